//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: store client → store hub (initial listings, watch loops)
//! - Shutdown order: store hub → store client

use crate::core::config::Config;
use crate::kv::KvClient;
use crate::store::StoreHub;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

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
    /// Store client health.
    pub store: ComponentHealth,
    /// Store hub health.
    pub hub: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            store: ComponentHealth::Starting,
            hub: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.store == ComponentHealth::Healthy && self.hub == ComponentHealth::Healthy
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        self.store != ComponentHealth::Failed && self.hub != ComponentHealth::Failed
    }
}

/// Trellis runtime holding all component handles.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// Store client.
    client: Option<KvClient>,

    /// Store hub.
    hub: Option<Arc<StoreHub>>,

    /// Runtime health status.
    health: RuntimeHealth,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            client: None,
            hub: None,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Create a runtime over an existing client, e.g. one wrapping a
    /// test backend.
    pub fn with_client(config: Config, client: KvClient) -> Result<Self> {
        let mut runtime = Self::new(config)?;
        runtime.client = Some(client);
        Ok(runtime)
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the store hub (if started).
    pub fn hub(&self) -> Option<&Arc<StoreHub>> {
        self.hub.as_ref()
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

    /// Initialize and start all runtime components.
    ///
    /// Components are started in order:
    /// 1. Store client
    /// 2. Store hub (fails if any initial listing fails)
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            backend = %self.config.store.backend,
            prefix = %self.config.store.prefix,
            "starting Trellis runtime"
        );

        self.init_store().await?;
        self.init_hub().await?;

        self.running.store(true, Ordering::Release);
        tracing::info!("Trellis runtime started");
        Ok(())
    }

    async fn init_store(&mut self) -> Result<()> {
        tracing::debug!("initializing store client");

        if self.client.is_none() {
            match KvClient::connect(&self.config.store).await {
                Ok(client) => self.client = Some(client),
                Err(e) => {
                    self.health.store = ComponentHealth::Failed;
                    return Err(e).context("failed to connect to store");
                }
            }
        }

        self.health.store = ComponentHealth::Healthy;
        Ok(())
    }

    async fn init_hub(&mut self) -> Result<()> {
        tracing::debug!("initializing store hub");

        let client = self
            .client
            .clone()
            .context("store client not initialized")?;
        let kinds = self.config.resources.parse_kinds()?;

        match StoreHub::init(client, &kinds, &self.config.watch, self.config.store.node_id).await {
            Ok(hub) => {
                self.hub = Some(hub);
                self.health.hub = ComponentHealth::Healthy;
                tracing::info!(kinds = kinds.len(), "store hub started");
                Ok(())
            }
            Err(e) => {
                self.health.hub = ComponentHealth::Failed;
                Err(e).context("failed to initialize store hub")
            }
        }
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the runtime until ctrl-c or a shutdown request.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Stop all runtime components in reverse start order.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping Trellis runtime");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        self.health.hub = ComponentHealth::Stopping;
        if let Some(hub) = self.hub.take() {
            hub.shutdown().await;
        }
        self.health.hub = ComponentHealth::Stopped;

        self.health.store = ComponentHealth::Stopping;
        if let Some(client) = self.client.take() {
            client.close().await;
        }
        self.health.store = ComponentHealth::Stopped;

        tracing::info!("Trellis runtime stopped");
        Ok(())
    }
}
