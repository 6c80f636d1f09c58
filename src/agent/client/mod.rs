mod heartbeat;
mod watch;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::SHUTDOWN_TIMEOUT;
use crate::config::ClientConfig;
use crate::network::{Manager, NetworkError};
use crate::store::cni_file::{CniError, CniStore};
use crate::store::{Store, StoreError};
use crate::types::network::NetworkValidationError;
use crate::types::{CniConfig, Network, Subnet};

/// File under the data directory holding this host's identity.
const ID_FILE_NAME: &str = "id";

/// How many times a subnet claim is retried after losing a write race.
const CLAIM_ATTEMPTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to load client identity: {0}")]
    Identity(#[source] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("failed to write CNI config: {0}")]
    Cni(#[from] CniError),

    #[error("invalid network {name:?}: {source}")]
    InvalidNetwork {
        name: String,
        source: NetworkValidationError,
    },

    #[error("no network configurations found")]
    NoNetworks,

    #[error("could not claim a subnet for network {0:?} after repeated conflicts")]
    ClaimConflict(String),

    #[error("timeout waiting for shutdown")]
    ShutdownTimeout,
}

/// The client role: claims one subnet per network for this host, keeps the
/// leases alive, programs the local data plane, and mirrors peers' leases
/// into kernel state.
pub struct Client {
    cfg: ClientConfig,

    /// Stable identity of this host, persisted under the data directory so
    /// it survives restarts.
    id: String,

    store: Arc<dyn Store>,
    cni: Arc<dyn CniStore>,
    manager: Arc<Manager>,

    /// Networks this client configures on the host, populated at bootstrap.
    networks: Vec<Network>,

    /// This host's leases, one per network.
    subnets: Vec<Subnet>,

    /// Closing signal observed by every long-running client task.
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    pub async fn new(
        cfg: ClientConfig,
        store: Arc<dyn Store>,
        cni: Arc<dyn CniStore>,
    ) -> Result<Client, ClientError> {
        let manager = Manager::new(cfg.network_interface.as_deref()).await?;
        let id = load_or_generate_id(&cfg.data_dir).map_err(ClientError::Identity)?;

        let (shutdown, _) = broadcast::channel(1);

        Ok(Client {
            cfg,
            id,
            store,
            cni,
            manager: Arc::new(manager),
            networks: Vec::new(),
            subnets: Vec::new(),
            shutdown,
            tasks: Vec::new(),
        })
    }

    pub async fn start(&mut self) -> Result<(), ClientError> {
        self.bootstrap().await?;
        self.start_watchers().await?;
        self.start_heartbeats();
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), ClientError> {
        tracing::info!("stopping client processes");
        let _ = self.shutdown.send(());

        let tasks = std::mem::take(&mut self.tasks);
        let barrier = async {
            for task in tasks {
                let _ = task.await;
            }
        };

        tokio::time::timeout(SHUTDOWN_TIMEOUT, barrier)
            .await
            .map_err(|_| ClientError::ShutdownTimeout)
    }

    /// Synchronous bootstrap: for every network visible in the store,
    /// ensure this host holds a lease, the local data plane is programmed,
    /// and the CNI config is emitted. Isolation rules go in last, once
    /// forward rules exist for all networks.
    async fn bootstrap(&mut self) -> Result<(), ClientError> {
        let networks = self.store.list_networks().await?;
        if networks.is_empty() {
            return Err(ClientError::NoNetworks);
        }

        for mut network in networks {
            network
                .validate()
                .map_err(|source| ClientError::InvalidNetwork {
                    name: network.name.clone(),
                    source,
                })?;
            network.canonicalize();

            tracing::info!(
                network_name = %network.name,
                client_id = %self.id,
                "initializing local host subnet",
            );

            let subnet = match self.store.get_subnet(&network.name, &self.id).await? {
                Some(existing) => self.program_subnet(&network, &existing, false).await?,
                None => match self.claim_subnet(&network).await {
                    Ok(subnet) => subnet,
                    // An unallocatable network is an operator problem with
                    // that network alone; the remaining networks still come
                    // up, and the operator sees the error.
                    Err(err) if is_allocation_failure(&err) => {
                        tracing::error!(
                            network_name = %network.name,
                            client_id = %self.id,
                            error = %err,
                            "failed to allocate subnet, skipping network",
                        );
                        continue;
                    }
                    Err(err) => return Err(err),
                },
            };

            if network.ipmasq.unwrap_or(true) && !self.cfg.disable_ipmasq {
                self.manager
                    .firewall
                    .setup_masq_rules(&network, &subnet)
                    .await?;
            }
            self.manager.firewall.setup_forward_rules(&network).await?;

            tracing::info!(
                network_name = %network.name,
                client_id = %self.id,
                subnet = %subnet
                    .ipv4_network
                    .map(|n| n.to_string())
                    .unwrap_or_default(),
                "successfully initialized local host subnet",
            );

            self.subnets.push(subnet);
            self.networks.push(network);
        }

        self.manager.firewall.ensure_isolation(&self.networks).await?;
        Ok(())
    }

    /// Brings up the local data plane for a lease, persists the enriched
    /// record, and emits the CNI config. The store write must come after the
    /// provider setup: remote peers program routes from the record, and
    /// until the tunnel interface exists its MAC is not known.
    async fn program_subnet(
        &self,
        network: &Network,
        subnet: &Subnet,
        create: bool,
    ) -> Result<Subnet, ClientError> {
        let enriched = self.manager.set_local(subnet).await?;

        if create {
            self.store.create_subnet(&enriched).await?;
        } else {
            self.store.set_subnet(&enriched).await?;
        }

        match CniConfig::generate(network, &enriched) {
            Some(cni) => self.cni.set(&cni)?,
            None => tracing::warn!(
                network_name = %network.name,
                "lease has no allocation, skipping CNI config",
            ),
        }

        Ok(enriched)
    }

    /// Allocates a block and writes the lease create-only. Losing the write
    /// race means another writer touched this host's path; adopt their
    /// record if it exists, otherwise re-list and re-allocate.
    async fn claim_subnet(&self, network: &Network) -> Result<Subnet, ClientError> {
        for attempt in 1..=CLAIM_ATTEMPTS {
            let existing = self.store.list_subnets(&network.name).await?;
            let candidate = self
                .manager
                .generate_ipv4_subnet(&self.id, network, &existing)?;

            match self.program_subnet(network, &candidate, true).await {
                Ok(enriched) => return Ok(enriched),
                Err(ClientError::Store(StoreError::Conflict { .. })) => {
                    tracing::warn!(
                        network_name = %network.name,
                        client_id = %self.id,
                        attempt,
                        "lost subnet claim race",
                    );

                    if let Some(current) = self.store.get_subnet(&network.name, &self.id).await? {
                        return self.program_subnet(network, &current, false).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(ClientError::ClaimConflict(network.name.clone()))
    }

    async fn start_watchers(&mut self) -> Result<(), ClientError> {
        for network in &self.networks {
            tracing::debug!(network_name = %network.name, "starting subnet watcher for network");

            let stream = self
                .store
                .watch_subnets(&network.name, self.shutdown.subscribe())
                .await?;

            self.tasks.push(watch::spawn_dispatcher(
                network.name.clone(),
                self.id.clone(),
                Arc::clone(&self.manager),
                stream,
                self.shutdown.subscribe(),
            ));
        }
        Ok(())
    }

    fn start_heartbeats(&mut self) {
        for subnet in &self.subnets {
            self.tasks.push(heartbeat::spawn_heartbeat(
                Arc::clone(&self.store),
                subnet.clone(),
                self.shutdown.subscribe(),
            ));
        }
    }
}

/// Whether a claim failure is scoped to one network's address space rather
/// than the agent as a whole. Allocation and claim-race exhaustion leave the
/// other networks perfectly serviceable; store and kernel failures do not.
fn is_allocation_failure(err: &ClientError) -> bool {
    matches!(
        err,
        ClientError::Network(NetworkError::InvalidRange { .. })
            | ClientError::Network(NetworkError::NetworkFull(_))
            | ClientError::ClaimConflict(_)
    )
}

/// Reads the persisted host identity, generating and persisting a fresh
/// UUID when the file is missing or empty. Any other read failure is fatal:
/// reusing a wrong identity would orphan the previous lease.
fn load_or_generate_id(data_dir: &str) -> Result<String, std::io::Error> {
    let path = Path::new(data_dir).join(ID_FILE_NAME);

    match fs::read_to_string(&path) {
        Ok(id) if !id.is_empty() => return Ok(id),
        Ok(_) => {} // empty file, regenerate
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    fs::create_dir_all(data_dir)?;

    let id = Uuid::new_v4().to_string();
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)?;
    file.write_all(id.as_bytes())?;

    Ok(id)
}
