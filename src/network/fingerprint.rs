use std::net::{Ipv4Addr, UdpSocket};

use netlink_packet_route::address::nlas::Nla as AddressNla;
use netlink_packet_route::constants::{AF_INET, IFF_LOOPBACK, IFF_UP};
use netlink_packet_route::{AddressMessage, LinkMessage};

use crate::network::error::{NetworkError, NetworkResult};
use crate::network::netlink::{link_mtu, link_name, NetlinkHandle};

/// A well-known external address used to learn which interface carries the
/// default route. The socket is connected but never written to.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// The underlay interface this host tunnels over, captured once at startup.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub index: u32,
    pub name: String,
    pub mtu: u32,
    pub ipv4: Ipv4Addr,
}

/// Discovers the underlay interface. A configured name wins; otherwise the
/// interface owning the default-route source address is used, falling back
/// to the first up, non-loopback interface with a non-loopback IPv4.
pub async fn fingerprint(
    netlink: &NetlinkHandle,
    interface: Option<&str>,
) -> NetworkResult<Fingerprint> {
    let addresses = netlink.list_addresses().await?;

    if let Some(name) = interface {
        let link = netlink.get_link(name).await.map_err(|e| match e {
            NetworkError::NotFound(_) => NetworkError::NoUsableInterface,
            other => other,
        })?;
        return build(&link, &addresses).ok_or(NetworkError::NoUsableInterface);
    }

    // Learn the default-route source address, then map it back to the
    // interface that owns it.
    if let Some(probe_ip) = probe_default_ipv4() {
        if let Some(index) = addresses
            .iter()
            .find(|msg| address_ipv4(msg) == Some(probe_ip))
            .map(|msg| msg.header.index)
        {
            let link = netlink.get_link_by_index(index).await?;
            if let Some(fp) = build(&link, &addresses) {
                return Ok(fp);
            }
        }
    }

    // No route to the outside world; take the first usable interface.
    for link in netlink.list_links().await? {
        let flags = link.header.flags;
        if flags & IFF_UP == 0 || flags & IFF_LOOPBACK != 0 {
            continue;
        }
        if let Some(fp) = build(&link, &addresses) {
            return Ok(fp);
        }
    }

    Err(NetworkError::NoUsableInterface)
}

/// Connects a UDP socket outward to find the local address the kernel would
/// source default-route traffic from. No packets are sent.
fn probe_default_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(ROUTE_PROBE_ADDR).ok()?;
    match socket.local_addr().ok()? {
        std::net::SocketAddr::V4(addr) => Some(*addr.ip()),
        std::net::SocketAddr::V6(_) => None,
    }
}

fn build(link: &LinkMessage, addresses: &[AddressMessage]) -> Option<Fingerprint> {
    let index = link.header.index;
    let ipv4 = addresses
        .iter()
        .filter(|msg| msg.header.index == index)
        .find_map(address_ipv4)
        .filter(|ip| !ip.is_loopback())?;

    Some(Fingerprint {
        index,
        name: link_name(link)?,
        mtu: link_mtu(link)?,
        ipv4,
    })
}

fn address_ipv4(msg: &AddressMessage) -> Option<Ipv4Addr> {
    if u16::from(msg.header.family) != AF_INET {
        return None;
    }
    msg.nlas.iter().find_map(|nla| match nla {
        AddressNla::Address(bytes) if bytes.len() == 4 => {
            Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlink_packet_route::link::nlas::Nla as LinkNla;

    fn address_message(index: u32, family: u16, bytes: Vec<u8>) -> AddressMessage {
        let mut msg = AddressMessage::default();
        msg.header.index = index;
        msg.header.family = family as u8;
        msg.nlas.push(AddressNla::Address(bytes));
        msg
    }

    fn link_message(index: u32, name: &str, mtu: u32) -> LinkMessage {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        msg.nlas.push(LinkNla::IfName(name.to_string()));
        msg.nlas.push(LinkNla::Mtu(mtu));
        msg
    }

    #[test]
    fn build_captures_link_and_address() {
        let link = link_message(3, "eth0", 1500);
        let addresses = vec![
            address_message(1, AF_INET, vec![127, 0, 0, 1]),
            address_message(3, AF_INET, vec![192, 168, 10, 20]),
        ];

        let fp = build(&link, &addresses).unwrap();
        assert_eq!(fp.index, 3);
        assert_eq!(fp.name, "eth0");
        assert_eq!(fp.mtu, 1500);
        assert_eq!(fp.ipv4, Ipv4Addr::new(192, 168, 10, 20));
    }

    #[test]
    fn build_skips_loopback_and_foreign_addresses() {
        let link = link_message(3, "eth0", 1500);

        // Only a loopback address on the interface: unusable.
        let addresses = vec![address_message(3, AF_INET, vec![127, 0, 0, 1])];
        assert!(build(&link, &addresses).is_none());

        // Address belongs to a different interface: unusable.
        let addresses = vec![address_message(7, AF_INET, vec![192, 168, 10, 20])];
        assert!(build(&link, &addresses).is_none());
    }

    #[test]
    fn address_ipv4_ignores_other_families() {
        let msg = address_message(3, 10 /* AF_INET6 */, vec![0; 16]);
        assert_eq!(address_ipv4(&msg), None);
    }
}
