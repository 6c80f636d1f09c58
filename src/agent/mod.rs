// The agent wires configuration, the store, and the client/server roles
// together and owns process lifecycle: startup, signals, shutdown.

pub mod client;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};

use crate::config::{AgentConfig, ConfigError, StoreConfig, BACKEND_NVAR};
use crate::network::retry;
use crate::store::cni_file::CniFileStore;
use crate::store::nvar::{NvarStore, VarsClient};
use crate::store::{Store, StoreError};

use self::client::{Client, ClientError};
use self::server::Server;

/// How long shutdown waits for long-running tasks before giving up and
/// letting the process exit anyway.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to set up store: {0}")]
    Store(#[from] StoreError),

    #[error("unsupported store backend: {0:?}")]
    UnsupportedBackend(String),

    #[error("failed to set up client: {0}")]
    Client(#[from] ClientError),

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

pub struct Agent {
    client: Option<Client>,
    server: Option<Server>,
}

impl Agent {
    /// Builds the agent from resolved configuration. The store is checked
    /// for reachability before either role starts, with retries: agents
    /// routinely boot before the orchestrator is up.
    pub async fn new(cfg: &AgentConfig) -> Result<Agent, AgentError> {
        let store = setup_store(&cfg.store).await?;

        let client = if cfg.client.enabled {
            let cni = Arc::new(CniFileStore::new(&cfg.client.cni_dir));
            Some(Client::new(cfg.client.clone(), Arc::clone(&store), cni).await?)
        } else {
            None
        };

        let server = if cfg.server.enabled {
            Some(Server::new(
                Arc::clone(&store),
                cfg.server.reaper.interval()?,
                cfg.server.reaper.threshold()?,
            ))
        } else {
            None
        };

        Ok(Agent { client, server })
    }

    pub async fn start(&mut self) -> Result<(), AgentError> {
        if let Some(client) = self.client.as_mut() {
            client.start().await?;
        }
        if let Some(server) = self.server.as_mut() {
            server.start();
        }

        tracing::info!(version = env!("CARGO_PKG_VERSION"), "started agent");
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(client) = self.client.as_mut() {
            if let Err(err) = client.stop().await {
                tracing::error!(error = %err, "failed to gracefully shutdown client");
            }
        }
        if let Some(server) = self.server.as_mut() {
            if let Err(err) = server.stop().await {
                tracing::error!(error = %err, "failed to gracefully shutdown server");
            }
        }
    }

    /// Blocks until a termination signal arrives, then shuts the agent
    /// down. SIGHUP is accepted but configuration reload is not implemented.
    pub async fn wait_for_signal(&mut self) -> Result<(), AgentError> {
        let mut sigterm = signal(SignalKind::terminate()).map_err(AgentError::Signal)?;
        let mut sighup = signal(SignalKind::hangup()).map_err(AgentError::Signal)?;

        tracing::info!("signal notification handler running");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = sigterm.recv() => break,
                _ = sighup.recv() => {
                    tracing::info!("SIGHUP received, configuration reload not yet implemented");
                }
            }
        }

        tracing::info!("shutting down agent");
        self.stop().await;
        tracing::info!("successfully shutdown agent");
        Ok(())
    }
}

/// Builds the configured store backend and verifies the orchestrator is
/// reachable before handing it out.
async fn setup_store(cfg: &StoreConfig) -> Result<Arc<dyn Store>, AgentError> {
    match cfg.backend.as_str() {
        BACKEND_NVAR => {
            let client = VarsClient::new(&cfg.nvar.address, cfg.nvar.token.as_deref())?;

            retry::retry("orchestrator reachability", || client.leader()).await?;

            Ok(Arc::new(NvarStore::new(client, &cfg.nvar.path)))
        }
        other => Err(AgentError::UnsupportedBackend(other.to_string())),
    }
}
