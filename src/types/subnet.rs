use std::net;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ipv4::Ipv4Net;

/// How long a lease is valid without a heartbeat refresh. Leases that are not
/// refreshed within this window become eligible for reaping.
pub const DEFAULT_SUBNET_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A subnet lease: one host's claim on a block of a network's address space.
/// Each host owns at most one lease per network; the record is written by its
/// owner and only the expiry transition is written by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subnet {
    /// Unique identifier of the owning host.
    pub client_id: String,

    /// Name of the network this lease belongs to.
    pub network_name: String,

    /// Name of the provider that realizes this subnet on the wire.
    pub provider: String,

    /// Underlay IPv4 address of the owning host. Remote peers use this as
    /// the tunnel endpoint.
    pub host_ipv4: Option<net::Ipv4Addr>,

    /// Provider-specific configuration, opaque to the control plane. For the
    /// VXLAN provider this carries the VNI, UDP port, MTU and, once the local
    /// interface exists, its MAC address.
    #[serde(default)]
    pub config: Option<serde_json::Value>,

    /// Absolute time at which this lease expires unless refreshed.
    pub expiration: DateTime<Utc>,

    /// Set by the server once `expiration` has passed; peers tear down their
    /// routes for an expired lease before the record is deleted.
    #[serde(default)]
    pub expired: bool,

    /// The block allocated to the owning host, a subnet of the network's
    /// supernet.
    pub ipv4_network: Option<Ipv4Net>,

    /// MTU for the overlay interface, derived from the underlay MTU minus
    /// the encapsulation overhead.
    pub mtu: u32,
}

impl Subnet {
    /// The overlay tunnel interface for this subnet's network on a host.
    pub fn interface_name(&self) -> String {
        format!("{}0", self.network_name)
    }

    /// Advances the expiration to `now + ttl`. Expiration never moves
    /// backwards for a live lease.
    pub fn refresh(&mut self, ttl: Duration) {
        let next = Utc::now() + ttl;
        if next > self.expiration {
            self.expiration = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_subnet() -> Subnet {
        Subnet {
            client_id: "7cd1b54d-9b9e-4bcd-9c0e-26a8b2845d7e".to_string(),
            network_name: "v".to_string(),
            provider: "vxlan".to_string(),
            host_ipv4: Some("192.168.10.20".parse().unwrap()),
            config: Some(serde_json::json!({"vni": 1, "port": 4789})),
            expiration: Utc::now(),
            expired: false,
            ipv4_network: Some("10.10.5.0/24".parse().unwrap()),
            mtu: 1450,
        }
    }

    #[test]
    fn interface_name_has_static_suffix() {
        assert_eq!(test_subnet().interface_name(), "v0");
    }

    #[test]
    fn refresh_strictly_advances_expiration() {
        let mut subnet = test_subnet();
        let mut last = subnet.expiration;

        for _ in 0..3 {
            subnet.refresh(DEFAULT_SUBNET_TTL);
            assert!(subnet.expiration > last);
            last = subnet.expiration;
        }
    }

    #[test]
    fn refresh_never_moves_expiration_backwards() {
        let mut subnet = test_subnet();
        subnet.expiration = Utc::now() + Duration::from_secs(48 * 60 * 60);
        let before = subnet.expiration;

        subnet.refresh(Duration::from_secs(60));
        assert_eq!(subnet.expiration, before);
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let subnet = test_subnet();
        let encoded = serde_json::to_string(&subnet).unwrap();
        let decoded: Subnet = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, subnet);
    }

    #[test]
    fn json_uses_wire_field_names() {
        let value = serde_json::to_value(test_subnet()).unwrap();
        for key in [
            "client_id",
            "network_name",
            "provider",
            "host_ipv4",
            "config",
            "expiration",
            "expired",
            "ipv4_network",
            "mtu",
        ] {
            assert!(value.get(key).is_some(), "missing field {key}");
        }
        assert_eq!(value["ipv4_network"], "10.10.5.0/24");
    }
}
