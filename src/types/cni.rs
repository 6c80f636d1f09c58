use serde::{Deserialize, Serialize};

use crate::types::network::Network;
use crate::types::subnet::Subnet;

/// A container-networking-interface configuration, one per network per host.
/// The container runtime reads these from the CNI output directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CniConfig {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,

    pub mtu: u32,

    pub ipmasq: bool,

    pub ipv4: CniIpv4Config,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CniIpv4Config {
    pub network: String,

    pub subnet: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

impl CniConfig {
    /// Derives the CNI payload for a host's allocation on a network. The
    /// gateway is the first usable address of the allocated block. The
    /// emitted `ipmasq` is the negation of the network's `ipmasq` flag; this
    /// matches the behavior container runtimes in the field depend on.
    pub fn generate(network: &Network, subnet: &Subnet) -> Option<CniConfig> {
        let ipv4 = network.ipv4.as_ref()?;
        let gateway = subnet.ipv4_network.as_ref()?.next_addr();

        Some(CniConfig {
            name: network.name.clone(),
            bridge: Some(network.bridge_interface_name()),
            mtu: subnet.mtu,
            ipmasq: !network.ipmasq.unwrap_or(true),
            ipv4: CniIpv4Config {
                network: ipv4.network.to_string(),
                subnet: gateway.to_string(),
                gateway: Some(gateway.ip.to_string()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn fixtures() -> (Network, Subnet) {
        let mut network: Network = serde_json::from_value(serde_json::json!({
            "name": "v",
            "ipmasq": true,
            "ipv4": {"network": "10.10.0.0/16", "size": 24},
            "provider": {"name": "vxlan"},
        }))
        .unwrap();
        network.canonicalize();

        let subnet = Subnet {
            client_id: "client-1".to_string(),
            network_name: "v".to_string(),
            provider: "vxlan".to_string(),
            host_ipv4: Some("192.168.10.20".parse().unwrap()),
            config: None,
            expiration: Utc::now(),
            expired: false,
            ipv4_network: Some("10.10.5.0/24".parse().unwrap()),
            mtu: 1450,
        };

        (network, subnet)
    }

    #[test]
    fn generate_derives_bridge_gateway_and_mtu() {
        let (network, subnet) = fixtures();
        let cni = CniConfig::generate(&network, &subnet).unwrap();

        assert_eq!(cni.name, "v");
        assert_eq!(cni.bridge.as_deref(), Some("vbrd0"));
        assert_eq!(cni.mtu, 1450);
        assert_eq!(cni.ipv4.network, "10.10.0.0/16");
        assert_eq!(cni.ipv4.subnet, "10.10.5.1/24");
        assert_eq!(cni.ipv4.gateway.as_deref(), Some("10.10.5.1"));
    }

    #[test]
    fn generate_inverts_ipmasq() {
        let (mut network, subnet) = fixtures();

        network.ipmasq = Some(true);
        let cni = CniConfig::generate(&network, &subnet).unwrap();
        assert!(!cni.ipmasq);

        network.ipmasq = Some(false);
        let cni = CniConfig::generate(&network, &subnet).unwrap();
        assert!(cni.ipmasq);
    }

    #[test]
    fn generate_requires_an_allocation() {
        let (network, mut subnet) = fixtures();
        subnet.ipv4_network = None;
        assert!(CniConfig::generate(&network, &subnet).is_none());
    }
}
