//! Bridge FDB and IP neighbor programming (§4.1: "add FDB entry", "add
//! neighbor", "add static route"). Both FDB and neighbor entries ride the
//! same request/ack transport as `nlsock::NlSocket` because
//! `netlink-packet-route` models FDB entries as `NewNeighbour` messages on
//! the bridge link with `AF_BRIDGE` family — the same message type as an
//! ordinary IP neighbor, distinguished only by family and a couple of
//! attributes. This follows the `rust-netlink` `neighbour-add.rs` request
//! shape, generalized to also emit the bridge-FDB form.
//!
//! Every entry point here is self-contained: it resolves the link by name
//! and opens its own socket, matching the calling convention already used
//! throughout `kal::link` rather than threading a socket handle through
//! `nsthread::run_in_namespace` closures.

use std::net::{IpAddr, Ipv4Addr};

use anyhow::{Context, Result};
use netlink_packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourFlag, NeighbourMessage, NeighbourState,
};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope, RouteType};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};

use super::link::host_link_index;
use super::nlsock::NlSocket;

fn permanent_self(family: AddressFamily) -> NeighbourMessage {
    let mut msg = NeighbourMessage::default();
    msg.header.family = family;
    msg.header.state = NeighbourState::Permanent;
    msg.header.flags = vec![NeighbourFlag::Self_];
    msg.header.kind = RouteType::Unspec;
    msg
}

/// `(link, vtep_ip, mac)` FDB entry, family `AF_BRIDGE`, flags
/// `NUD_PERMANENT | NTF_SELF` (§4.1's table, row "add FDB entry").
pub fn add_fdb(link_name: &str, vtep: Ipv4Addr, mac: [u8; 6]) -> Result<()> {
    let link_index = host_link_index(link_name)?;
    let mut sock = NlSocket::new()?;
    let mut msg = permanent_self(AddressFamily::Bridge);
    msg.header.ifindex = link_index;
    msg.attributes.push(NeighbourAttribute::LinkLocalAddress(mac.to_vec()));
    msg.attributes
        .push(NeighbourAttribute::Destination(NeighbourAddress::Inet(vtep)));
    sock.request(RouteNetlinkMessage::NewNeighbour(msg), true, false)
        .with_context(|| format!("installing fdb entry for {:02x?} -> {} on {}", mac, vtep, link_name))
}

pub fn del_fdb(link_name: &str, mac: [u8; 6]) -> Result<()> {
    let link_index = host_link_index(link_name)?;
    let mut sock = NlSocket::new()?;
    let mut msg = NeighbourMessage::default();
    msg.header.family = AddressFamily::Bridge;
    msg.header.ifindex = link_index;
    msg.header.flags = vec![NeighbourFlag::Self_];
    msg.header.kind = RouteType::Unspec;
    msg.attributes.push(NeighbourAttribute::LinkLocalAddress(mac.to_vec()));
    sock.request(RouteNetlinkMessage::DelNeighbour(msg), false, false)
        .with_context(|| format!("removing fdb entry for {:02x?} on {}", mac, link_name))
}

/// `(link, ip, mac)` ARP/neighbor entry, `NUD_PERMANENT | NTF_SELF`, family
/// inferred from the IP version (IPv4 only in this driver, per §1
/// Non-goals).
pub fn add_neighbor(link_name: &str, ip: IpAddr, mac: [u8; 6]) -> Result<()> {
    let addr = match ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => anyhow::bail!("IPv6 overlay transport is out of scope"),
    };
    let link_index = host_link_index(link_name)?;
    let mut sock = NlSocket::new()?;
    let mut msg = permanent_self(AddressFamily::Inet);
    msg.header.ifindex = link_index;
    msg.attributes.push(NeighbourAttribute::Destination(NeighbourAddress::Inet(addr)));
    msg.attributes.push(NeighbourAttribute::LinkLocalAddress(mac.to_vec()));
    sock.request(RouteNetlinkMessage::NewNeighbour(msg), true, false)
        .with_context(|| format!("installing neighbor entry for {} -> {:02x?} on {}", ip, mac, link_name))
}

pub fn del_neighbor(link_name: &str, ip: IpAddr) -> Result<()> {
    let addr = match ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => anyhow::bail!("IPv6 overlay transport is out of scope"),
    };
    let link_index = host_link_index(link_name)?;
    let mut sock = NlSocket::new()?;
    let mut msg = NeighbourMessage::default();
    msg.header.family = AddressFamily::Inet;
    msg.header.ifindex = link_index;
    msg.header.flags = vec![NeighbourFlag::Self_];
    msg.header.kind = RouteType::Unspec;
    msg.attributes.push(NeighbourAttribute::Destination(NeighbourAddress::Inet(addr)));
    sock.request(RouteNetlinkMessage::DelNeighbour(msg), false, false)
        .with_context(|| format!("removing neighbor entry for {} on {}", ip, link_name))
}

/// `(dst_prefix, nexthop)` static route (§4.1's table, row "add static
/// route"). Used by `Join` to route every other subnet of the network
/// through this subnet's gateway.
pub fn add_route(dst: &ipnet::Ipv4Net, gateway: Ipv4Addr) -> Result<()> {
    let mut sock = NlSocket::new()?;
    let mut msg = RouteMessage::default();
    msg.header.address_family = AddressFamily::Inet;
    msg.header.destination_prefix_length = dst.prefix_len();
    msg.header.protocol = RouteProtocol::Boot;
    msg.header.scope = RouteScope::Universe;
    msg.header.kind = RouteType::Unicast;
    msg.attributes.push(RouteAttribute::Destination(RouteAddress::Inet(dst.addr())));
    msg.attributes.push(RouteAttribute::Gateway(RouteAddress::Inet(gateway)));
    sock.request(RouteNetlinkMessage::NewRoute(msg), true, false)
        .with_context(|| format!("adding route {} via {}", dst, gateway))
}
