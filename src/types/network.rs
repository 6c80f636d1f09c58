use serde::{Deserialize, Serialize};

use crate::types::ipv4::{Ipv4Addr, Ipv4Net, EMPTY_IPV4_ADDR};

/// Kernel interface names are capped at IFNAMSIZ-1 (15) characters. The
/// longest name derived from a network is `<name>brd0`, which leaves 11
/// characters for the network name itself.
const MAX_NETWORK_NAME_LEN: usize = 11;

/// The only network provider currently implemented.
pub const PROVIDER_VXLAN: &str = "vxlan";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NetworkValidationError {
    #[error("network name is empty")]
    EmptyName,

    #[error("network name {0:?} exceeds {MAX_NETWORK_NAME_LEN} characters")]
    NameTooLong(String),

    #[error("IPv4 network configuration is missing")]
    MissingIpv4,

    #[error("IPv4 subnet size must be between 1 and 32")]
    InvalidSize,

    #[error("IPv4 minimum address is out of network range")]
    MinOutOfRange,

    #[error("network provider configuration is missing")]
    MissingProvider,

    #[error("unsupported network provider: {0:?}")]
    UnsupportedProvider(String),
}

/// An operator-defined network: the address space that hosts carve per-host
/// blocks out of, plus the provider that realizes it on the wire. Network
/// objects are created out of band and are read-only to agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Network {
    pub name: String,

    /// Whether traffic leaving the network should be masqueraded. Defaults
    /// to true when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipmasq: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Config>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,
}

/// The IPv4 address space of a network. `size` is the prefix length of each
/// per-host block; `min`/`max` bound the base addresses handed out and are
/// computed when unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ipv4Config {
    pub network: Ipv4Net,

    #[serde(default)]
    pub min: Ipv4Addr,

    #[serde(default)]
    pub max: Ipv4Addr,

    pub size: u8,
}

/// Selects the provider implementation for a network and carries its opaque
/// configuration blob. The blob is passed through to the provider untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl Network {
    /// Fills in default values for unset fields. When no explicit bounds are
    /// configured, the first and last blocks of the supernet are excluded
    /// from allocation.
    pub fn canonicalize(&mut self) {
        if let Some(ipv4) = self.ipv4.as_mut() {
            let block = 1u32 << (32 - ipv4.size);
            if ipv4.min == EMPTY_IPV4_ADDR {
                ipv4.min = ipv4.network.ip.add(block);
            }
            if ipv4.max == EMPTY_IPV4_ADDR {
                ipv4.max = Ipv4Addr(ipv4.network.next_network().ip.0 - block - 1);
            }
        }

        if self.ipmasq.is_none() {
            self.ipmasq = Some(true);
        }
    }

    pub fn validate(&self) -> Result<(), NetworkValidationError> {
        if self.name.is_empty() {
            return Err(NetworkValidationError::EmptyName);
        }
        if self.name.len() > MAX_NETWORK_NAME_LEN {
            return Err(NetworkValidationError::NameTooLong(self.name.clone()));
        }

        let ipv4 = self.ipv4.as_ref().ok_or(NetworkValidationError::MissingIpv4)?;
        if ipv4.size == 0 || ipv4.size > 32 {
            return Err(NetworkValidationError::InvalidSize);
        }
        if ipv4.min != EMPTY_IPV4_ADDR
            && (ipv4.min < ipv4.network.ip || ipv4.min.0 > ipv4.network.next_network().ip.0 - 1)
        {
            return Err(NetworkValidationError::MinOutOfRange);
        }

        let provider = self
            .provider
            .as_ref()
            .ok_or(NetworkValidationError::MissingProvider)?;
        if provider.name != PROVIDER_VXLAN {
            return Err(NetworkValidationError::UnsupportedProvider(
                provider.name.clone(),
            ));
        }

        Ok(())
    }

    /// The overlay tunnel interface for this network on a host. One network
    /// has exactly one interface per host, so a static suffix is enough.
    pub fn interface_name(&self) -> String {
        format!("{}0", self.name)
    }

    /// The bridge interface containers attach to for this network.
    pub fn bridge_interface_name(&self) -> String {
        format!("{}brd0", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_network() -> Network {
        serde_json::from_value(serde_json::json!({
            "name": "v",
            "ipmasq": true,
            "ipv4": {"network": "10.10.0.0/16", "size": 24},
            "provider": {"name": "vxlan", "config": {"vni": 1, "port": 4789}},
        }))
        .unwrap()
    }

    #[test]
    fn canonicalize_excludes_first_and_last_blocks() {
        let mut network = test_network();
        network.canonicalize();

        let ipv4 = network.ipv4.unwrap();
        assert_eq!(ipv4.min.to_string(), "10.10.1.0");
        assert_eq!(ipv4.max.to_string(), "10.10.254.255");
    }

    #[test]
    fn canonicalize_defaults_ipmasq_true() {
        let mut network = test_network();
        network.ipmasq = None;
        network.canonicalize();
        assert_eq!(network.ipmasq, Some(true));
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let mut network = test_network();
        network.canonicalize();
        let once = network.clone();
        network.canonicalize();
        assert_eq!(network, once);
    }

    #[test]
    fn canonicalize_keeps_explicit_bounds() {
        let mut network = test_network();
        network.ipv4.as_mut().unwrap().min = "10.10.32.0".parse().unwrap();
        network.canonicalize();

        let ipv4 = network.ipv4.unwrap();
        assert_eq!(ipv4.min.to_string(), "10.10.32.0");
        assert_eq!(ipv4.max.to_string(), "10.10.254.255");
    }

    #[test]
    fn validate_accepts_canonical_network() {
        let mut network = test_network();
        network.canonicalize();
        assert_eq!(network.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_missing_pieces() {
        let mut network = test_network();
        network.ipv4 = None;
        assert_eq!(network.validate(), Err(NetworkValidationError::MissingIpv4));

        let mut network = test_network();
        network.ipv4.as_mut().unwrap().size = 0;
        assert_eq!(network.validate(), Err(NetworkValidationError::InvalidSize));

        let mut network = test_network();
        network.provider = None;
        assert_eq!(
            network.validate(),
            Err(NetworkValidationError::MissingProvider)
        );

        let mut network = test_network();
        network.provider.as_mut().unwrap().name = "wireguard".to_string();
        assert_eq!(
            network.validate(),
            Err(NetworkValidationError::UnsupportedProvider(
                "wireguard".to_string()
            ))
        );
    }

    #[test]
    fn validate_rejects_min_outside_supernet() {
        let mut network = test_network();
        network.ipv4.as_mut().unwrap().min = "10.11.0.0".parse().unwrap();
        assert_eq!(
            network.validate(),
            Err(NetworkValidationError::MinOutOfRange)
        );
    }

    #[test]
    fn validate_rejects_overlong_name() {
        let mut network = test_network();
        network.name = "a".repeat(12);
        assert!(matches!(
            network.validate(),
            Err(NetworkValidationError::NameTooLong(_))
        ));
    }

    #[test]
    fn interface_names_derive_from_network_name() {
        let network = test_network();
        assert_eq!(network.interface_name(), "v0");
        assert_eq!(network.bridge_interface_name(), "vbrd0");
    }
}
