// Host-side network management: underlay fingerprint, subnet allocation,
// and dispatch into the data-plane provider and packet filter.

pub mod error;
pub mod fingerprint;
pub mod firewall;
pub mod netlink;
pub mod retry;
pub mod vxlan;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;

use crate::types::network::{Ipv4Config, Network};
use crate::types::{Ipv4Addr, Ipv4Net, Subnet, DEFAULT_SUBNET_TTL, PROVIDER_VXLAN};

pub use error::{NetworkError, NetworkResult};
pub use fingerprint::Fingerprint;
pub use firewall::FirewallManager;

/// A network provider realizes subnets on the wire: the local tunnel
/// interface for this host's block, and forwarding state for every peer
/// block observed through the store.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sets up the local data plane for this host's subnet and returns the
    /// lease enriched with whatever peers need to reach it.
    async fn set_local(&self, host: &Fingerprint, subnet: &Subnet) -> NetworkResult<Subnet>;

    /// Programs forwarding toward a peer's subnet.
    async fn set_remote(&self, subnet: &Subnet) -> NetworkResult<()>;

    /// Removes forwarding toward a peer's subnet.
    async fn delete_remote(&self, subnet: &Subnet) -> NetworkResult<()>;
}

/// Owns the underlay fingerprint, the provider registry, and the firewall.
/// One manager per client agent.
pub struct Manager {
    fingerprint: Fingerprint,
    providers: HashMap<&'static str, Box<dyn Provider>>,
    pub firewall: FirewallManager,
}

impl Manager {
    /// Fingerprints the host and prepares the data-plane backends. Fails
    /// when no usable underlay interface exists or iptables is unavailable.
    pub async fn new(interface: Option<&str>) -> NetworkResult<Manager> {
        let handle = Arc::new(netlink::NetlinkHandle::new()?);
        let fingerprint = fingerprint::fingerprint(&handle, interface).await?;

        tracing::info!(
            interface = %fingerprint.name,
            ipv4 = %fingerprint.ipv4,
            mtu = fingerprint.mtu,
            "fingerprinted underlay interface",
        );

        let firewall = FirewallManager::new().await?;

        let mut providers: HashMap<&'static str, Box<dyn Provider>> = HashMap::new();
        providers.insert(
            PROVIDER_VXLAN,
            Box::new(vxlan::VxlanProvider::new(Arc::clone(&handle))),
        );

        Ok(Manager {
            fingerprint,
            providers,
            firewall,
        })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    fn provider(&self, name: &str) -> NetworkResult<&dyn Provider> {
        self.providers
            .get(name)
            .map(|p| p.as_ref())
            .ok_or_else(|| NetworkError::UnknownProvider(name.to_string()))
    }

    pub async fn set_local(&self, subnet: &Subnet) -> NetworkResult<Subnet> {
        self.provider(&subnet.provider)?
            .set_local(&self.fingerprint, subnet)
            .await
    }

    pub async fn set_remote(&self, subnet: &Subnet) -> NetworkResult<()> {
        self.provider(&subnet.provider)?.set_remote(subnet).await
    }

    pub async fn delete_remote(&self, subnet: &Subnet) -> NetworkResult<()> {
        self.provider(&subnet.provider)?.delete_remote(subnet).await
    }

    /// Allocates an available block from the network's range. See
    /// [`generate_ipv4_subnet`].
    pub fn generate_ipv4_subnet(
        &self,
        client_id: &str,
        network: &Network,
        existing: &[Subnet],
    ) -> NetworkResult<Subnet> {
        generate_ipv4_subnet(&self.fingerprint, client_id, network, existing)
    }
}

/// Allocates an available subnet from the configured network range using an
/// adaptive strategy: random probing distributes allocations across the
/// address space while the network is sparse (reducing correlated collisions
/// between racing hosts); above 80% utilization a sequential scan guarantees
/// the search is complete.
pub fn generate_ipv4_subnet(
    fingerprint: &Fingerprint,
    client_id: &str,
    network: &Network,
    existing: &[Subnet],
) -> NetworkResult<Subnet> {
    let ipv4 = network
        .ipv4
        .as_ref()
        .ok_or_else(|| NetworkError::MissingIpv4(network.name.clone()))?;

    // Base addresses of blocks already leased in this network.
    let used: HashSet<Ipv4Addr> = existing
        .iter()
        .filter(|s| s.network_name == network.name)
        .filter_map(|s| s.ipv4_network)
        .map(|n| n.ip)
        .collect();

    let block_size = 1u32 << (32 - ipv4.size);
    if ipv4.max < ipv4.min {
        return Err(NetworkError::InvalidRange {
            min: ipv4.min,
            max: ipv4.max,
            size: ipv4.size,
        });
    }
    let total_blocks = ((ipv4.max.0 - ipv4.min.0) / block_size + 1) as usize;

    let utilization = used.len() as f64 / total_blocks as f64;
    if utilization >= 0.8 {
        tracing::debug!(
            network_name = %network.name,
            utilization,
            used = used.len(),
            total = total_blocks,
            "using sequential search strategy for subnet allocation",
        );
        return find_sequential_subnet(fingerprint, client_id, network, ipv4, &used, block_size);
    }

    tracing::debug!(
        network_name = %network.name,
        utilization,
        used = used.len(),
        total = total_blocks,
        "using random probe strategy for subnet allocation",
    );
    find_random_subnet(
        fingerprint,
        client_id,
        network,
        ipv4,
        &used,
        block_size,
        total_blocks,
    )
}

/// Probes uniformly random blocks. Efficient while the range is sparse; on
/// exhaustion the sequential scan takes over.
fn find_random_subnet(
    fingerprint: &Fingerprint,
    client_id: &str,
    network: &Network,
    ipv4: &Ipv4Config,
    used: &HashSet<Ipv4Addr>,
    block_size: u32,
    total_blocks: usize,
) -> NetworkResult<Subnet> {
    let max_attempts = usize::max(used.len() * 3, 1000);
    let mut rng = rand::thread_rng();

    for _ in 0..max_attempts {
        let index = rng.gen_range(0..total_blocks) as u32;
        let candidate = ipv4.min.add(index * block_size);

        if candidate > ipv4.max {
            continue;
        }
        if !used.contains(&candidate) {
            return Ok(new_subnet(fingerprint, client_id, network, ipv4, candidate));
        }
    }

    tracing::debug!(
        network_name = %network.name,
        attempts = max_attempts,
        "random probing exhausted, falling back to sequential search",
    );
    find_sequential_subnet(fingerprint, client_id, network, ipv4, used, block_size)
}

/// Scans linearly for the lowest available block.
fn find_sequential_subnet(
    fingerprint: &Fingerprint,
    client_id: &str,
    network: &Network,
    ipv4: &Ipv4Config,
    used: &HashSet<Ipv4Addr>,
    block_size: u32,
) -> NetworkResult<Subnet> {
    let mut candidate = ipv4.min;
    while candidate <= ipv4.max {
        if !used.contains(&candidate) {
            return Ok(new_subnet(fingerprint, client_id, network, ipv4, candidate));
        }

        // Guard against wrapping past the top of the address space.
        match candidate.0.checked_add(block_size) {
            Some(next) => candidate = Ipv4Addr(next),
            None => break,
        }
    }

    Err(NetworkError::NetworkFull(network.name.clone()))
}

fn new_subnet(
    fingerprint: &Fingerprint,
    client_id: &str,
    network: &Network,
    ipv4: &Ipv4Config,
    ip: Ipv4Addr,
) -> Subnet {
    Subnet {
        client_id: client_id.to_string(),
        network_name: network.name.clone(),
        provider: network
            .provider
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_default(),
        host_ipv4: Some(fingerprint.ipv4),
        config: network.provider.as_ref().and_then(|p| p.config.clone()),
        expiration: Utc::now() + DEFAULT_SUBNET_TTL,
        expired: false,
        ipv4_network: Some(Ipv4Net::new(ip, ipv4.size)),
        mtu: fingerprint.mtu.saturating_sub(vxlan::ENCAPSULATION_OVERHEAD),
    }
}
