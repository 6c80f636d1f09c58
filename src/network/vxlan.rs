use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use netlink_packet_route::link::nlas::{Info, InfoData, InfoVxlan, Nla as LinkNla};
use netlink_packet_route::LinkMessage;
use serde::{Deserialize, Serialize};

use crate::network::error::{NetworkError, NetworkResult};
use crate::network::fingerprint::Fingerprint;
use crate::network::netlink::{link_mac, parse_mac, NetlinkHandle, VxlanSpec};
use crate::network::{retry, Provider};
use crate::types::{Subnet, PROVIDER_VXLAN};

/// Default VXLAN network identifier used when the network does not set one.
const DEFAULT_VNI: u32 = 1;

/// IANA-assigned UDP port for VXLAN encapsulation.
const DEFAULT_PORT: u16 = 4789;

/// Bytes added by VXLAN encapsulation. The tunnel interface MTU is reduced
/// by this much to avoid fragmenting encapsulated frames.
pub const ENCAPSULATION_OVERHEAD: u32 = 50;

/// Provider-level configuration carried in each subnet's config blob. The
/// operator sets vni/port/mtu; `vtep_mac` is populated by the owning host
/// once its tunnel interface exists, and is what remote peers program their
/// FDB and neighbor entries from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VxlanConfig {
    pub vni: u32,
    pub port: u16,
    pub mtu: u32,
    #[serde(default)]
    pub vtep_mac: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawVxlanConfig {
    vni: Option<u32>,
    port: Option<u16>,
    mtu: Option<u32>,
    vtep_mac: Option<String>,
}

impl VxlanConfig {
    /// Decodes a subnet's config blob, defaulting unset fields. `mtu`
    /// defaults to the provided fallback (underlay MTU minus overhead).
    fn decode(blob: Option<&serde_json::Value>, fallback_mtu: u32) -> NetworkResult<VxlanConfig> {
        let raw: RawVxlanConfig = match blob {
            Some(value) => serde_json::from_value(value.clone())?,
            None => RawVxlanConfig::default(),
        };
        Ok(VxlanConfig {
            vni: raw.vni.unwrap_or(DEFAULT_VNI),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            mtu: raw.mtu.unwrap_or(fallback_mtu),
            vtep_mac: raw.vtep_mac.unwrap_or_default(),
        })
    }
}

/// The VXLAN network provider: one tunnel interface per network per host,
/// with per-peer FDB, neighbor and route entries. All operations are
/// idempotent.
pub struct VxlanProvider {
    netlink: Arc<NetlinkHandle>,
}

impl VxlanProvider {
    pub fn new(netlink: Arc<NetlinkHandle>) -> VxlanProvider {
        VxlanProvider { netlink }
    }

    /// Creates the tunnel interface or adopts an existing one. An existing
    /// interface whose attributes differ is deleted and recreated, which
    /// briefly disrupts traffic on it.
    async fn ensure_link(&self, spec: &VxlanSpec) -> NetworkResult<LinkMessage> {
        if let Err(e) = self.netlink.add_vxlan(spec).await {
            if !e.to_string().contains("File exists") {
                return Err(e);
            }

            let existing = self.netlink.get_link(&spec.name).await?;
            if !vxlan_matches(&existing, spec) {
                tracing::warn!(
                    interface = %spec.name,
                    "recreating existing VXLAN interface with updated configuration",
                );
                self.netlink.delete_link(&spec.name).await?;
                self.netlink.add_vxlan(spec).await?;
            }
        }

        let link = self.netlink.get_link(&spec.name).await?;
        self.netlink.set_link_mtu(link.header.index, spec.mtu).await?;
        Ok(link)
    }
}

#[async_trait]
impl Provider for VxlanProvider {
    fn name(&self) -> &'static str {
        PROVIDER_VXLAN
    }

    async fn set_local(&self, host: &Fingerprint, subnet: &Subnet) -> NetworkResult<Subnet> {
        let mut cfg = VxlanConfig::decode(
            subnet.config.as_ref(),
            host.mtu.saturating_sub(ENCAPSULATION_OVERHEAD),
        )?;

        let name = subnet.interface_name();
        let spec = VxlanSpec {
            name: name.clone(),
            vni: cfg.vni,
            port: cfg.port,
            mtu: cfg.mtu,
            local: host.ipv4,
            dev_index: host.index,
        };

        let link = self.ensure_link(&spec).await?;

        // Router advertisements on the tunnel would assign unwanted IPv6
        // state; failure to disable them is harmless on v6-less kernels.
        let _ = sysctl(&format!("net/ipv6/conf/{name}/accept_ra"), "0");

        sysctl("net/ipv4/ip_forward", "1")?;

        // Return traffic may arrive over a different path than it left by,
        // so strict reverse-path filtering would drop it.
        sysctl(&format!("net/ipv4/conf/{name}/rp_filter"), "0")?;
        sysctl("net/ipv4/conf/all/rp_filter", "0")?;

        self.netlink.set_link_up(link.header.index).await?;

        // Re-read the interface for its MAC address: remote hosts need it to
        // program FDB and neighbor entries toward this subnet.
        let link = self.netlink.get_link(&name).await?;
        cfg.vtep_mac = link_mac(&link).ok_or_else(|| NetworkError::EmptyVtepMac(name.clone()))?;

        tracing::info!(
            interface = %name,
            vni = cfg.vni,
            port = cfg.port,
            mtu = cfg.mtu,
            vtep_mac = %cfg.vtep_mac,
            "set up local VXLAN interface",
        );

        let mut enriched = subnet.clone();
        enriched.config = Some(serde_json::to_value(&cfg)?);
        Ok(enriched)
    }

    async fn set_remote(&self, subnet: &Subnet) -> NetworkResult<()> {
        let cfg = VxlanConfig::decode(subnet.config.as_ref(), 0)?;
        let name = subnet.interface_name();

        let link_index = self.netlink.get_link_index(&name).await?;
        let mac = parse_mac(&cfg.vtep_mac)?;
        let remote = subnet
            .host_ipv4
            .ok_or(NetworkError::IncompleteSubnet("host_ipv4"))?;
        let block = subnet
            .ipv4_network
            .ok_or(NetworkError::IncompleteSubnet("ipv4_network"))?;

        // The gateway is the first usable address of the peer's block.
        let gateway = block.next_addr().ip.to_std();

        // FDB entry: peer VTEP MAC reached via the peer's underlay address.
        retry::retry("add fdb entry", || {
            self.netlink.fdb_replace(link_index, &mac, remote)
        })
        .await?;

        // Neighbor entry: peer gateway address resolves to the VTEP MAC
        // without ARP over the tunnel.
        retry::retry("add neighbor entry", || {
            self.netlink.neighbour_replace(link_index, gateway, &mac)
        })
        .await?;

        // Route to the peer block via its gateway, onlink.
        retry::retry("add route", || {
            self.netlink.route_replace(link_index, block, gateway)
        })
        .await?;

        Ok(())
    }

    async fn delete_remote(&self, subnet: &Subnet) -> NetworkResult<()> {
        let cfg = VxlanConfig::decode(subnet.config.as_ref(), 0)?;
        let name = subnet.interface_name();

        let link_index = self.netlink.get_link_index(&name).await?;
        let mac = parse_mac(&cfg.vtep_mac)?;
        let remote = subnet
            .host_ipv4
            .ok_or(NetworkError::IncompleteSubnet("host_ipv4"))?;
        let block = subnet
            .ipv4_network
            .ok_or(NetworkError::IncompleteSubnet("ipv4_network"))?;
        let gateway = block.next_addr().ip.to_std();

        retry::retry("delete route", || self.netlink.route_delete(block)).await?;

        retry::retry("delete neighbor entry", || {
            self.netlink.neighbour_delete(link_index, gateway, &mac)
        })
        .await?;

        retry::retry("delete fdb entry", || {
            self.netlink.fdb_delete(link_index, &mac, remote)
        })
        .await?;

        Ok(())
    }
}

/// Compares an existing link against the desired VXLAN attributes. Fields
/// the kernel reports as unset are not compared.
fn vxlan_matches(link: &LinkMessage, spec: &VxlanSpec) -> bool {
    let mut infos = None;
    for nla in &link.nlas {
        if let LinkNla::Info(info) = nla {
            infos = Some(info);
        }
    }
    let Some(infos) = infos else { return false };

    let mut attrs = None;
    for info in infos {
        if let Info::Data(InfoData::Vxlan(vxlan)) = info {
            attrs = Some(vxlan);
        }
    }
    let Some(attrs) = attrs else { return false };

    for attr in attrs {
        match attr {
            InfoVxlan::Id(id) if *id != spec.vni => return false,
            InfoVxlan::Port(port) if *port > 0 && *port != spec.port => return false,
            InfoVxlan::Link(dev) if *dev > 0 && *dev != spec.dev_index => return false,
            InfoVxlan::Local(bytes)
                if bytes.len() == 4 && bytes.as_slice() != spec.local.octets().as_slice() =>
            {
                return false
            }
            _ => {}
        }
    }

    true
}

fn sysctl(key: &str, value: &str) -> NetworkResult<()> {
    std::fs::write(Path::new("/proc/sys").join(key), value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_spec() -> VxlanSpec {
        VxlanSpec {
            name: "v0".to_string(),
            vni: 1,
            port: 4789,
            mtu: 1450,
            local: Ipv4Addr::new(192, 168, 10, 20),
            dev_index: 3,
        }
    }

    fn vxlan_link(attrs: Vec<InfoVxlan>) -> LinkMessage {
        let mut msg = LinkMessage::default();
        msg.nlas
            .push(LinkNla::Info(vec![Info::Data(InfoData::Vxlan(attrs))]));
        msg
    }

    #[test]
    fn decode_defaults_unset_fields() {
        let cfg = VxlanConfig::decode(None, 1450).unwrap();
        assert_eq!(cfg.vni, 1);
        assert_eq!(cfg.port, 4789);
        assert_eq!(cfg.mtu, 1450);
        assert_eq!(cfg.vtep_mac, "");
    }

    #[test]
    fn decode_keeps_provided_fields() {
        let blob = serde_json::json!({"vni": 7, "port": 8472, "vtep_mac": "02:42:ac:11:00:02"});
        let cfg = VxlanConfig::decode(Some(&blob), 1450).unwrap();
        assert_eq!(cfg.vni, 7);
        assert_eq!(cfg.port, 8472);
        assert_eq!(cfg.mtu, 1450);
        assert_eq!(cfg.vtep_mac, "02:42:ac:11:00:02");
    }

    #[test]
    fn decode_rejects_malformed_blob() {
        let blob = serde_json::json!({"vni": "one"});
        assert!(VxlanConfig::decode(Some(&blob), 1450).is_err());
    }

    #[test]
    fn matches_accepts_equal_attributes() {
        let spec = test_spec();
        let link = vxlan_link(vec![
            InfoVxlan::Id(1),
            InfoVxlan::Port(4789),
            InfoVxlan::Link(3),
            InfoVxlan::Local(vec![192, 168, 10, 20]),
        ]);
        assert!(vxlan_matches(&link, &spec));
    }

    #[test]
    fn matches_ignores_unset_kernel_fields() {
        let spec = test_spec();
        let link = vxlan_link(vec![InfoVxlan::Id(1), InfoVxlan::Port(0), InfoVxlan::Link(0)]);
        assert!(vxlan_matches(&link, &spec));
    }

    #[test]
    fn matches_rejects_differing_attributes() {
        let spec = test_spec();

        let link = vxlan_link(vec![InfoVxlan::Id(2)]);
        assert!(!vxlan_matches(&link, &spec));

        let link = vxlan_link(vec![InfoVxlan::Id(1), InfoVxlan::Port(8472)]);
        assert!(!vxlan_matches(&link, &spec));

        let link = vxlan_link(vec![InfoVxlan::Id(1), InfoVxlan::Local(vec![10, 0, 0, 1])]);
        assert!(!vxlan_matches(&link, &spec));
    }

    #[test]
    fn matches_rejects_non_vxlan_links() {
        let spec = test_spec();
        assert!(!vxlan_matches(&LinkMessage::default(), &spec));
    }
}
