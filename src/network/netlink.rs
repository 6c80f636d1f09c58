use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;
use netlink_packet_route::constants::{AF_BRIDGE, AF_INET, NTF_SELF, NUD_PERMANENT, RTNH_F_ONLINK};
use netlink_packet_route::link::nlas::Nla as LinkNla;
use netlink_packet_route::neighbour::nlas::Nla as NeighbourNla;
use netlink_packet_route::route::nlas::Nla as RouteNla;
use netlink_packet_route::{AddressMessage, LinkMessage, NeighbourMessage};

use crate::network::error::{NetworkError, NetworkResult};
use crate::types::Ipv4Net;

/// Desired attributes of a VXLAN tunnel interface.
#[derive(Debug, Clone)]
pub struct VxlanSpec {
    pub name: String,
    pub vni: u32,
    pub port: u16,
    pub mtu: u32,
    /// Underlay source address for encapsulated traffic.
    pub local: Ipv4Addr,
    /// Underlay interface carrying the tunnel.
    pub dev_index: u32,
}

/// Persistent netlink handle wrapping rtnetlink for all link, neighbor, FDB
/// and route operations. One handle per process, shared by the provider and
/// the interface fingerprint.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

impl NetlinkHandle {
    pub fn new() -> NetworkResult<NetlinkHandle> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(NetlinkHandle {
            handle,
            _conn_task: conn_task,
        })
    }

    // ── Link operations ───────────────────────────────────────────────

    /// Fetches a link by name. Returns NotFound if the link doesn't exist.
    pub async fn get_link(&self, name: &str) -> NetworkResult<LinkMessage> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) => {
                // rtnetlink returns an error for "not found" on some kernels
                if e.to_string().contains("No such device") {
                    Err(NetworkError::NotFound(format!("link {}", name)))
                } else {
                    Err(NetworkError::Netlink(e))
                }
            }
        }
    }

    pub async fn get_link_by_index(&self, index: u32) -> NetworkResult<LinkMessage> {
        let mut links = self.handle.link().get().match_index(index).execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(NetworkError::NotFound(format!("link index {}", index))),
            Err(e) => {
                if e.to_string().contains("No such device") {
                    Err(NetworkError::NotFound(format!("link index {}", index)))
                } else {
                    Err(NetworkError::Netlink(e))
                }
            }
        }
    }

    pub async fn get_link_index(&self, name: &str) -> NetworkResult<u32> {
        Ok(self.get_link(name).await?.header.index)
    }

    /// Delete a link by name. Idempotent - returns Ok if link doesn't exist.
    pub async fn delete_link(&self, name: &str) -> NetworkResult<()> {
        let index = match self.get_link_index(name).await {
            Ok(idx) => idx,
            Err(NetworkError::NotFound(_)) => return Ok(()), // already gone
            Err(e) => return Err(e),
        };

        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such device") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    /// Creates a VXLAN interface. The caller decides how to handle an
    /// existing interface of the same name; "File exists" is surfaced as-is.
    pub async fn add_vxlan(&self, spec: &VxlanSpec) -> NetworkResult<()> {
        self.handle
            .link()
            .add()
            .vxlan(spec.name.clone(), spec.vni)
            .link(spec.dev_index)
            .local(spec.local)
            .port(spec.port)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_link_up(&self, index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_link_mtu(&self, index: u32, mtu: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    // ── Enumeration ───────────────────────────────────────────────────

    pub async fn list_links(&self) -> NetworkResult<Vec<LinkMessage>> {
        let mut links = self.handle.link().get().execute();
        let mut messages = Vec::new();
        while let Some(msg) = links.try_next().await.map_err(NetworkError::Netlink)? {
            messages.push(msg);
        }
        Ok(messages)
    }

    pub async fn list_addresses(&self) -> NetworkResult<Vec<AddressMessage>> {
        let mut addresses = self.handle.address().get().execute();
        let mut messages = Vec::new();
        while let Some(msg) = addresses.try_next().await.map_err(NetworkError::Netlink)? {
            messages.push(msg);
        }
        Ok(messages)
    }

    // ── Forwarding database ───────────────────────────────────────────

    /// Installs or replaces the FDB entry mapping a peer's VTEP MAC to its
    /// underlay address on the given tunnel interface.
    pub async fn fdb_replace(
        &self,
        index: u32,
        mac: &[u8; 6],
        remote: Ipv4Addr,
    ) -> NetworkResult<()> {
        self.handle
            .neighbours()
            .add_bridge(index, mac)
            .destination(IpAddr::V4(remote))
            .state(NUD_PERMANENT)
            .flags(NTF_SELF)
            .replace()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Removes an FDB entry. Missing entries are not an error.
    pub async fn fdb_delete(
        &self,
        index: u32,
        mac: &[u8; 6],
        remote: Ipv4Addr,
    ) -> NetworkResult<()> {
        let mut message = NeighbourMessage::default();
        message.header.family = AF_BRIDGE as u8;
        message.header.ifindex = index;
        message.header.state = NUD_PERMANENT;
        message.header.flags = NTF_SELF;
        message
            .nlas
            .push(NeighbourNla::LinkLocalAddress(mac.to_vec()));
        message
            .nlas
            .push(NeighbourNla::Destination(remote.octets().to_vec()));

        match self.handle.neighbours().del(message).execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_missing_entry(&e) => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    // ── Neighbor (ARP) entries ────────────────────────────────────────

    /// Installs or replaces the permanent neighbor entry mapping a peer
    /// gateway address to its VTEP MAC.
    pub async fn neighbour_replace(
        &self,
        index: u32,
        ip: Ipv4Addr,
        mac: &[u8; 6],
    ) -> NetworkResult<()> {
        self.handle
            .neighbours()
            .add(index, IpAddr::V4(ip))
            .link_local_address(mac)
            .state(NUD_PERMANENT)
            .replace()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Removes a neighbor entry. Missing entries are not an error.
    pub async fn neighbour_delete(
        &self,
        index: u32,
        ip: Ipv4Addr,
        mac: &[u8; 6],
    ) -> NetworkResult<()> {
        let mut message = NeighbourMessage::default();
        message.header.family = AF_INET as u8;
        message.header.ifindex = index;
        message.header.state = NUD_PERMANENT;
        message.nlas.push(NeighbourNla::Destination(ip.octets().to_vec()));
        message
            .nlas
            .push(NeighbourNla::LinkLocalAddress(mac.to_vec()));

        match self.handle.neighbours().del(message).execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_missing_entry(&e) => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    // ── Routes ────────────────────────────────────────────────────────

    /// Installs the route to a peer's block via its gateway on the tunnel
    /// interface, with the onlink flag so the kernel accepts a gateway that
    /// is not otherwise reachable. An existing route for the destination is
    /// replaced.
    pub async fn route_replace(
        &self,
        index: u32,
        destination: Ipv4Net,
        gateway: Ipv4Addr,
    ) -> NetworkResult<()> {
        match self.route_add_onlink(index, destination, gateway).await {
            Ok(()) => Ok(()),
            Err(NetworkError::Netlink(e)) if e.to_string().contains("File exists") => {
                // The handle has no atomic replace; re-point the route by
                // deleting the stale one first.
                self.route_delete(destination).await?;
                self.route_add_onlink(index, destination, gateway).await
            }
            Err(e) => Err(e),
        }
    }

    async fn route_add_onlink(
        &self,
        index: u32,
        destination: Ipv4Net,
        gateway: Ipv4Addr,
    ) -> NetworkResult<()> {
        let mut request = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(destination.ip.to_std(), destination.size)
            .gateway(gateway)
            .output_interface(index);
        request.message_mut().header.flags |=
            netlink_packet_route::route::RouteFlags::from_bits_truncate(RTNH_F_ONLINK as u32);

        request.execute().await.map_err(NetworkError::Netlink)
    }

    /// Delete the route to a destination. Idempotent - returns Ok if no
    /// matching route exists.
    pub async fn route_delete(&self, destination: Ipv4Net) -> NetworkResult<()> {
        let dest_ip = destination.ip.to_std();

        let mut routes = self.handle.route().get(rtnetlink::IpVersion::V4).execute();
        while let Some(route) = routes.try_next().await.map_err(NetworkError::Netlink)? {
            if route.header.destination_prefix_length != destination.size {
                continue;
            }

            let mut route_dest = None;
            for nla in &route.nlas {
                if let RouteNla::Destination(addr_bytes) = nla {
                    if addr_bytes.len() == 4 {
                        route_dest = Some(Ipv4Addr::new(
                            addr_bytes[0],
                            addr_bytes[1],
                            addr_bytes[2],
                            addr_bytes[3],
                        ));
                    }
                }
            }

            if route_dest == Some(dest_ip) {
                let result = self.handle.route().del(route).execute().await;
                return match result {
                    Ok(()) => Ok(()),
                    Err(e) if e.to_string().contains("No such process") => Ok(()), // already gone
                    Err(e) => Err(NetworkError::Netlink(e)),
                };
            }
        }

        // Route not found — treat as success
        Ok(())
    }
}

fn is_missing_entry(e: &rtnetlink::Error) -> bool {
    let text = e.to_string();
    text.contains("No such file or directory") || text.contains("No such device")
}

// ── Link attribute helpers ────────────────────────────────────────────

pub fn link_name(msg: &LinkMessage) -> Option<String> {
    msg.nlas.iter().find_map(|nla| match nla {
        LinkNla::IfName(name) => Some(name.clone()),
        _ => None,
    })
}

pub fn link_mtu(msg: &LinkMessage) -> Option<u32> {
    msg.nlas.iter().find_map(|nla| match nla {
        LinkNla::Mtu(mtu) => Some(*mtu),
        _ => None,
    })
}

pub fn link_mac(msg: &LinkMessage) -> Option<String> {
    msg.nlas.iter().find_map(|nla| match nla {
        LinkNla::Address(bytes) if !bytes.is_empty() => Some(format_mac(bytes)),
        _ => None,
    })
}

pub fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn parse_mac(mac: &str) -> NetworkResult<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = mac.split(':');
    for slot in out.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| NetworkError::MalformedMac(mac.to_string()))?;
        *slot = u8::from_str_radix(part, 16)
            .map_err(|_| NetworkError::MalformedMac(mac.to_string()))?;
    }
    if parts.next().is_some() {
        return Err(NetworkError::MalformedMac(mac.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_format_and_parse_round_trip() {
        let bytes = [0x02, 0x42, 0xac, 0x11, 0x00, 0x02];
        let text = format_mac(&bytes);
        assert_eq!(text, "02:42:ac:11:00:02");
        assert_eq!(parse_mac(&text).unwrap(), bytes);
    }

    #[test]
    fn parse_mac_rejects_bad_input() {
        for bad in ["", "02:42:ac:11:00", "02:42:ac:11:00:02:aa", "zz:42:ac:11:00:02"] {
            assert!(parse_mac(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn link_helpers_read_attributes() {
        let mut msg = LinkMessage::default();
        msg.nlas.push(LinkNla::IfName("v0".to_string()));
        msg.nlas.push(LinkNla::Mtu(1450));
        msg.nlas
            .push(LinkNla::Address(vec![0x02, 0x42, 0xac, 0x11, 0x00, 0x02]));

        assert_eq!(link_name(&msg).as_deref(), Some("v0"));
        assert_eq!(link_mtu(&msg), Some(1450));
        assert_eq!(link_mac(&msg).as_deref(), Some("02:42:ac:11:00:02"));

        let empty = LinkMessage::default();
        assert_eq!(link_name(&empty), None);
        assert_eq!(link_mac(&empty), None);
    }
}
