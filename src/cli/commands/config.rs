//! Config command implementation.

use crate::core::config::{Config, ConfigOverrides};
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::Path;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate the resolved configuration (file, environment, flags).
    Validate,
    /// Print the resolved configuration with credentials redacted.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command.
pub fn run_config(
    args: ConfigArgs,
    config_path: Option<&Path>,
    overrides: ConfigOverrides,
) -> Result<()> {
    let config = Config::resolve(config_path, &overrides)?;
    match args.command {
        ConfigCommand::Validate => {
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  listen:  {}", config.server.listen);
            println!("  backend: {}", config.blob_url()?.redacted());
            Ok(())
        }
        ConfigCommand::Show { format } => {
            println!("{}", render(&config, &format)?);
            Ok(())
        }
    }
}

fn render(config: &Config, format: &str) -> Result<String> {
    let shown = config.redacted();
    match format {
        "json" => Ok(serde_json::to_string_pretty(&shown)?),
        "toml" => shown.to_toml(),
        other => anyhow::bail!("unknown format: {} (expected toml or json)", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_formats() {
        let mut config = Config::default();
        config.backend.blob_uri = Some("s3://minio:secret@localhost:9000/kv".to_string());

        let toml = render(&config, "toml").unwrap();
        assert!(toml.contains("[server]"));
        assert!(!toml.contains("secret"));

        let json = render(&config, "json").unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["watch"]["queue_capacity"], 100);

        assert!(render(&config, "yaml").is_err());
    }
}
