//! Configuration parsing and validation.
//!
//! blobkv configuration is loaded from an optional TOML file, then the
//! environment (`BLOB_URI`, after reading an optional `.env` file), then
//! CLI overrides.

use crate::storage::BlobUrl;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/blobkv.toml";

/// Environment variable holding the blob connection URL.
pub const BLOB_URI_ENV: &str = "BLOB_URI";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level blobkv configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// gRPC server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Object backend configuration.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Watch delivery configuration.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// gRPC server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the etcd v3 gRPC listener.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Cluster ID reported in response headers.
    #[serde(default = "default_cluster_id")]
    pub cluster_id: u64,

    /// Member ID reported in response headers.
    #[serde(default = "default_member_id")]
    pub member_id: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cluster_id: default_cluster_id(),
            member_id: default_member_id(),
        }
    }
}

/// Object backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Blob connection URL, e.g. `s3://user:pass@host:9000/bucket`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_uri: Option<String>,

    /// Reach the endpoint over https even for an `s3://` URL.
    #[serde(default)]
    pub secure: bool,

    /// Region sent with signed requests.
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            blob_uri: None,
            secure: false,
            region: default_region(),
        }
    }
}

/// Watch delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Events buffered per subscription before it is dropped as lagged.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Responses buffered per watch stream.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_listen() -> String {
    "0.0.0.0:2379".to_string()
}

fn default_cluster_id() -> u64 {
    1
}

fn default_member_id() -> u64 {
    1
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_queue_capacity() -> usize {
    100
}

fn default_stream_buffer() -> usize {
    128
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string. Not validated.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse config")
    }

    /// Load the file at `path`, or the default location when `None`.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Resolve the full configuration: file, then environment, then overrides.
    pub fn resolve(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = Self::load(path)?;
        // A missing .env file is normal.
        dotenvy::dotenv().ok();
        config.apply_env_from(|name| std::env::var(name).ok());
        config.apply_overrides(overrides);
        Ok(config)
    }

    /// Apply environment variables read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(uri) = lookup(BLOB_URI_ENV).filter(|v| !v.is_empty()) {
            self.backend.blob_uri = Some(uri);
        }
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref listen) = overrides.listen {
            self.server.listen = listen.clone();
        }
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref blob_uri) = overrides.blob_uri {
            self.backend.blob_uri = Some(blob_uri.clone());
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        self.blob_url()?;
        self.validate_watch()?;
        self.validate_telemetry()?;
        Ok(())
    }

    /// Parsed gRPC bind address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .with_context(|| format!("server.listen is not a socket address: {}", self.server.listen))
    }

    /// Parsed blob connection URL, with `backend.secure` applied.
    pub fn blob_url(&self) -> Result<BlobUrl> {
        let raw = self.backend.blob_uri.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "blob URI is not configured; set backend.blob_uri or {}",
                BLOB_URI_ENV
            )
        })?;
        let mut url = BlobUrl::parse(raw).context("invalid blob URI")?;
        if self.backend.secure {
            url.secure = true;
        }
        Ok(url)
    }

    fn validate_watch(&self) -> Result<()> {
        if self.watch.queue_capacity == 0 {
            anyhow::bail!("watch.queue_capacity must be > 0");
        }
        if self.watch.stream_buffer == 0 {
            anyhow::bail!("watch.stream_buffer must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                LOG_LEVELS,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    /// Copy of the configuration with the blob secret masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if let Some(ref raw) = self.backend.blob_uri {
            config.backend.blob_uri = Some(match BlobUrl::parse(raw) {
                Ok(url) => url.redacted(),
                Err(_) => "<invalid>".to_string(),
            });
        }
        config
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config")
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override gRPC bind address.
    pub listen: Option<String>,
    /// Override log level.
    pub log_level: Option<String>,
    /// Override blob connection URL.
    pub blob_uri: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const URI: &str = "s3://minio:secret@localhost:9000/kv";

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:2379");
        assert_eq!(config.server.cluster_id, 1);
        assert_eq!(config.backend.region, "us-east-1");
        assert_eq!(config.watch.queue_capacity, 100);
        assert_eq!(config.watch.stream_buffer, 128);
        assert_eq!(config.telemetry.log_level, "info");
        assert!(config.backend.blob_uri.is_none());
    }

    #[test]
    fn test_missing_blob_uri_rejected() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("blob URI"));
    }

    #[test]
    fn test_env_then_overrides() {
        let mut config = Config::from_toml(
            r#"
            [backend]
            blob_uri = "s3://a:b@file:9000/from-file"
            "#,
        )
        .unwrap();

        config.apply_env_from(|name| (name == BLOB_URI_ENV).then(|| URI.to_string()));
        assert_eq!(config.backend.blob_uri.as_deref(), Some(URI));

        config.apply_overrides(&ConfigOverrides {
            listen: Some("127.0.0.1:23790".to_string()),
            log_level: Some("debug".to_string()),
            blob_uri: None,
        });
        assert_eq!(config.server.listen, "127.0.0.1:23790");
        assert_eq!(config.telemetry.log_level, "debug");
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_env_ignored() {
        let mut config = Config::default();
        config.apply_env_from(|_| Some(String::new()));
        assert!(config.backend.blob_uri.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.backend.blob_uri = Some(URI.to_string());
        config.validate().unwrap();

        let mut bad = config.clone();
        bad.server.listen = ":2379".to_string();
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.watch.queue_capacity = 0;
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.telemetry.log_level = "verbose".to_string();
        assert!(bad.validate().is_err());

        let mut bad = config;
        bad.backend.blob_uri = Some("http://host/bucket".to_string());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_secure_flag_applies() {
        let mut config = Config::default();
        config.backend.blob_uri = Some(URI.to_string());
        assert!(!config.blob_url().unwrap().secure);
        config.backend.secure = true;
        assert_eq!(config.blob_url().unwrap().endpoint(), "https://localhost:9000");
    }

    #[test]
    fn test_redacted_masks_secret() {
        let mut config = Config::default();
        config.backend.blob_uri = Some(URI.to_string());
        let shown = config.redacted().to_toml().unwrap();
        assert!(!shown.contains("secret"));
        assert!(shown.contains("minio:****@localhost"));
    }
}
