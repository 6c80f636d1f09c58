// Persistence for networks and subnet leases. All coordination state lives
// in the orchestrator's variable store; agents never talk to each other
// directly.

pub mod cni_file;
pub mod nvar;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::types::{Network, Subnet};

/// Schema version segment used in store paths. Backwards compatible changes
/// do not bump this; breaking changes require a new version and a migration
/// in the store implementation.
pub const STORE_VERSION: &str = "v1";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("write conflict at {path:?}")]
    Conflict { path: String },

    #[error("variable item {0:?} not found")]
    MissingItem(&'static str),

    #[error("failed to decode stored object: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Streams of subnet changes produced by a watch. Modified leases arrive on
/// `modify`, leases flagged expired arrive on `delete`, and transient store
/// failures on `errors`. All three channels close when the watch stops.
pub struct SubnetWatch {
    pub modify: mpsc::Receiver<Vec<Subnet>>,
    pub delete: mpsc::Receiver<Vec<Subnet>>,
    pub errors: mpsc::Receiver<StoreError>,
}

/// Interface for persisting and retrieving network and subnet objects.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_networks(&self) -> Result<Vec<Network>, StoreError>;

    async fn list_subnets(&self, network: &str) -> Result<Vec<Subnet>, StoreError>;

    /// Fetches a single lease. Absence is not an error: a missing record
    /// yields `None`.
    async fn get_subnet(
        &self,
        network: &str,
        client_id: &str,
    ) -> Result<Option<Subnet>, StoreError>;

    /// Upserts a lease at its canonical path.
    async fn set_subnet(&self, subnet: &Subnet) -> Result<(), StoreError>;

    /// Writes a lease only if its path does not exist yet, so that two hosts
    /// racing for the same identity cannot both claim it. Returns
    /// [`StoreError::Conflict`] when the path is already populated.
    async fn create_subnet(&self, subnet: &Subnet) -> Result<(), StoreError>;

    async fn delete_subnet(&self, network: &str, client_id: &str) -> Result<(), StoreError>;

    /// Starts a long-poll watch over a network's leases. The watch runs until
    /// the shutdown channel fires, then closes all of its output channels.
    async fn watch_subnets(
        &self,
        network: &str,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<SubnetWatch, StoreError>;
}
