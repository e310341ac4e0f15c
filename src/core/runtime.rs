//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: object backend → store → gRPC listener
//! - Shutdown order: gRPC listener → watch streams → store

use crate::adapters::etcd::{EtcdGrpcServer, SharedState};
use crate::core::config::Config;
use crate::core::error::BlobKvResult;
use crate::kv::Store;
use crate::storage::ObjectBackend;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Time allowed for the gRPC server to drain on shutdown.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component has failed.
    Failed,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Object backend and store health.
    pub storage: ComponentHealth,
    /// gRPC listener health.
    pub listener: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            storage: ComponentHealth::Starting,
            listener: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.storage == ComponentHealth::Healthy && self.listener == ComponentHealth::Healthy
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        self.storage != ComponentHealth::Failed && self.listener != ComponentHealth::Failed
    }
}

/// blobkv runtime holding all component handles.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// Store, once the backend is reachable.
    store: Option<Store>,

    /// Runtime health status.
    health: RuntimeHealth,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,

    /// Address the gRPC listener is bound to.
    local_addr: Option<SocketAddr>,

    /// gRPC server task handle.
    grpc_handle: Option<JoinHandle<BlobKvResult<()>>>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        Ok(Self::unchecked(config))
    }

    /// Create a runtime for an injected backend; the blob URI is not required.
    pub fn with_config(config: Config) -> Self {
        Self::unchecked(config)
    }

    fn unchecked(config: Config) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config: Arc::new(config),
            store: None,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            local_addr: None,
            grpc_handle: None,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the store (if started).
    pub fn store(&self) -> Option<&Store> {
        self.store.as_ref()
    }

    /// Get the address the gRPC listener is bound to (if started).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Connect to the configured blob URL and start serving.
    pub async fn start(&mut self) -> Result<()> {
        let backend = self.connect_backend()?;
        self.start_with_backend(backend).await
    }

    #[cfg(feature = "s3")]
    fn connect_backend(&self) -> Result<Arc<dyn ObjectBackend>> {
        use crate::storage::S3Backend;

        let url = self.config.blob_url()?;
        tracing::info!(
            url = %url.redacted(),
            region = %self.config.backend.region,
            "connecting to object backend"
        );
        Ok(Arc::new(S3Backend::new(&url, &self.config.backend.region)))
    }

    #[cfg(not(feature = "s3"))]
    fn connect_backend(&self) -> Result<Arc<dyn ObjectBackend>> {
        anyhow::bail!("blobkv was built without the `s3` feature; no object backend available")
    }

    /// Start all components on top of `backend`.
    pub async fn start_with_backend(&mut self, backend: Arc<dyn ObjectBackend>) -> Result<()> {
        tracing::info!(backend = backend.name(), "starting blobkv runtime");

        self.init_store(backend).await?;
        self.start_listener().await?;

        self.running.store(true, Ordering::Release);
        tracing::info!("blobkv runtime started");
        Ok(())
    }

    async fn init_store(&mut self, backend: Arc<dyn ObjectBackend>) -> Result<()> {
        tracing::debug!("initializing store");

        let store = Store::new(backend, self.config.watch.queue_capacity);
        match store.init().await {
            Ok(created) => {
                tracing::info!(created_bucket = created, "store initialized");
            }
            Err(e) => {
                self.health.storage = ComponentHealth::Failed;
                return Err(e).context("failed to prepare bucket");
            }
        }

        self.store = Some(store);
        self.health.storage = ComponentHealth::Healthy;
        Ok(())
    }

    async fn start_listener(&mut self) -> Result<()> {
        let store = self
            .store
            .clone()
            .context("store must be initialized before the listener")?;
        let bind_addr = self.config.listen_addr()?;

        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind gRPC listener on {}", bind_addr))?;
        let local_addr = listener.local_addr().unwrap_or(bind_addr);

        let state = SharedState::new(store, self.shutdown_rx.clone())
            .with_ids(self.config.server.cluster_id, self.config.server.member_id)
            .with_stream_buffer(self.config.watch.stream_buffer);
        let server = EtcdGrpcServer::new(local_addr, state);

        self.grpc_handle = Some(tokio::spawn(server.serve(listener)));
        self.local_addr = Some(local_addr);
        self.health.listener = ComponentHealth::Healthy;

        tracing::info!(bind = %local_addr, "gRPC listener started");
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the runtime until SIGINT, a shutdown request, or server exit.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        if let Some(mut handle) = self.grpc_handle.take() {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("shutdown signal received (SIGINT)");
                    self.grpc_handle = Some(handle);
                }
                _ = async {
                    while !*shutdown_rx.borrow_and_update() {
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                } => {
                    tracing::info!("shutdown requested by component");
                    self.grpc_handle = Some(handle);
                }
                result = &mut handle => {
                    self.health.listener = ComponentHealth::Failed;
                    match result {
                        Ok(Ok(())) => tracing::info!("gRPC server stopped"),
                        Ok(Err(e)) => tracing::error!(error = %e, "gRPC server failed"),
                        Err(e) => tracing::error!(error = %e, "gRPC server task panicked"),
                    }
                }
            }
        }

        self.stop().await
    }

    /// Stop all runtime components.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping blobkv runtime");
        self.running.store(false, Ordering::Release);

        // Watch sessions and the server both observe this signal.
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.grpc_handle.take() {
            self.health.listener = ComponentHealth::Stopping;
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => tracing::info!("gRPC server stopped"),
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "gRPC server stopped with error"),
                Ok(Err(e)) => tracing::warn!(error = %e, "gRPC server task panicked"),
                Err(_) => tracing::warn!("gRPC server stop timed out"),
            }
        }
        self.health.listener = ComponentHealth::Stopped;

        if let Some(store) = self.store.take() {
            let stats = store.stats();
            tracing::info!(
                revision = stats.revision,
                puts = stats.puts,
                deletes = stats.deletes,
                watchers = stats.watchers,
                "store closed"
            );
        }
        self.health.storage = ComponentHealth::Stopped;

        tracing::info!("blobkv runtime stopped");
        Ok(())
    }
}
