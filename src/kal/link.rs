//! Bridge / VXLAN / veth creation (§4.1: "add bridge", "add VXLAN",
//! "add veth pair"). The bridge and veth-pair paths wrap `netavark`'s
//! netlink helpers for exactly this; VXLAN creation is built directly on
//! `netlink-packet-route`'s attribute builders, the same idiom
//! `rust-netlink/rtnetlink`'s `link-vxlan.rs` file demonstrates, so that
//! every flag in §4.1's table (`learning`, `proxy`, `l2miss`, `l3miss`,
//! configurable `dstport`) is actually set.

use std::net::IpAddr;
use std::os::fd::AsFd;
use std::path::Path;

use anyhow::{Context, Result};
use netavark::network::core_utils::open_netlink_sockets;
use netavark::network::netlink::{self, LinkID};
use netlink_packet_route::link::{InfoData, InfoKind, InfoVeth, InfoVxlan, LinkMessage};

use super::nlsock::NlSocket;

pub struct BridgeSpec<'a> {
    pub name: &'a str,
    pub gateway: IpAddr,
    pub prefix_len: u8,
}

pub struct VxlanSpec<'a> {
    pub name: &'a str,
    pub vni: u32,
    pub mtu: u32,
    pub dst_port: u16,
}

/// Create a bridge, assign it the subnet gateway address, and bring it up.
/// On any later failure in the same sandbox-init critical section (e.g. the
/// matching VXLAN-add), the caller removes this bridge via `del_link`.
pub fn add_bridge(spec: &BridgeSpec) -> Result<()> {
    let mut socket = netlink::Socket::new().context("opening netlink socket")?;
    socket
        .create_link(netlink::CreateLinkOptions::new(
            spec.name.to_string(),
            InfoKind::Bridge,
        ))
        .with_context(|| format!("creating bridge {}", spec.name))?;
    let id = socket
        .get_link(LinkID::Name(spec.name.to_string()))
        .with_context(|| format!("looking up bridge {} after create", spec.name))?
        .header
        .index;
    let net = ipnet::IpNet::new(spec.gateway, spec.prefix_len)
        .with_context(|| format!("building gateway net {}/{}", spec.gateway, spec.prefix_len))?;
    socket
        .add_addr(id, &net)
        .with_context(|| format!("assigning gateway {} to {}", net, spec.name))?;
    socket
        .set_up(LinkID::ID(id))
        .with_context(|| format!("setting {} up", spec.name))?;
    Ok(())
}

/// Create a veth pair whose host side is attached to the subnet bridge
/// *inside the overlay network's own sandbox* and whose guest side is
/// created directly inside the container's namespace (`container_ns_path`,
/// the "sandbox-key" `Join` is given, §6). These are two different
/// namespaces, neither of them root, so the whole operation is dispatched
/// onto a thread pinned to `sandbox_path` via `nsthread::run_in_namespace`:
/// once that thread's "current namespace" is the sandbox,
/// `open_netlink_sockets(container_ns_path)` opens one socket scoped to the
/// sandbox (for the host end + bridge attach, by ifindex local to that
/// namespace) and one scoped to `container_ns_path` (for the guest end),
/// exactly the two-namespace split `open_netlink_sockets` already provides
/// for "current ns" + "named target ns".
pub fn add_veth_pair(
    host_name: &str,
    guest_name: &str,
    sandbox_path: &Path,
    container_ns_path: &Path,
    bridge_index: u32,
) -> Result<()> {
    let host_name = host_name.to_string();
    let guest_name = guest_name.to_string();
    let container_ns_path = container_ns_path.to_path_buf();
    super::nsthread::run_in_namespace(sandbox_path, move || {
        let (mut host, mut guest) = open_netlink_sockets(&container_ns_path.to_string_lossy())
            .with_context(|| format!("opening netlink socket pair for {}", container_ns_path.display()))?;

        let mut peer_opts = netlink::CreateLinkOptions::new(guest_name.clone(), InfoKind::Veth);
        peer_opts.netns = Some(guest.file.as_fd());
        let mut peer = LinkMessage::default();
        netlink::parse_create_link_options(&mut peer, peer_opts);

        let mut host_opts = netlink::CreateLinkOptions::new(host_name.clone(), InfoKind::Veth);
        host_opts.info_data = Some(InfoData::Veth(InfoVeth::Peer(peer)));
        host_opts.primary_index = bridge_index;
        host.netlink
            .create_link(host_opts)
            .with_context(|| format!("creating veth pair {} <-> {}", host_name, guest_name))?;

        let guest_index = guest
            .netlink
            .get_link(LinkID::Name(guest_name.clone()))
            .with_context(|| format!("looking up {} inside container namespace", guest_name))?
            .header
            .index;
        guest
            .netlink
            .set_up(LinkID::ID(guest_index))
            .with_context(|| format!("setting {} up inside container namespace", guest_name))?;
        host.netlink
            .set_up(LinkID::Name(host_name.clone()))
            .with_context(|| format!("setting {} up inside sandbox", host_name))?;
        Ok(())
    })
}

/// Rename the guest-side veth to its final container-facing name and apply
/// the endpoint's MAC, both inside the container namespace (§3 "the
/// container side is renamed to `container_ifname` once moved into the
/// container's own namespace").
pub fn finalize_guest_side(container_ns_path: &Path, guest_name: &str, container_ifname: &str, mac: [u8; 6]) -> Result<()> {
    let guest_name = guest_name.to_string();
    let container_ifname = container_ifname.to_string();
    super::nsthread::run_in_namespace(container_ns_path, move || {
        let mut socket = netlink::Socket::new().context("opening netlink socket inside container namespace")?;
        let id = socket
            .get_link(LinkID::Name(guest_name.clone()))
            .with_context(|| format!("looking up {} inside container namespace", guest_name))?
            .header
            .index;
        socket
            .set_mac_address(LinkID::ID(id), &mac)
            .with_context(|| format!("setting mac address on {}", guest_name))?;
        socket
            .set_name(LinkID::ID(id), container_ifname.clone())
            .with_context(|| format!("renaming {} to {}", guest_name, container_ifname))?;
        Ok(())
    })
}

pub fn host_link_index(name: &str) -> Result<u32> {
    let mut socket = netlink::Socket::new().context("opening netlink socket")?;
    Ok(socket
        .get_link(LinkID::Name(name.to_string()))
        .with_context(|| format!("looking up link {}", name))?
        .header
        .index)
}

/// Create a VXLAN link in the root namespace, with the full flag set
/// §4.1 requires. Moved into the sandbox and enslaved to the bridge by
/// `move_vxlan_into_sandbox` once created.
pub fn add_vxlan(spec: &VxlanSpec) -> Result<()> {
    let mut sock = NlSocket::new()?;
    let data = InfoData::Vxlan(vec![
        InfoVxlan::Id(spec.vni),
        InfoVxlan::Port(spec.dst_port),
        InfoVxlan::Learning(true),
        InfoVxlan::Proxy(true),
        InfoVxlan::L2Miss(true),
        InfoVxlan::L3Miss(true),
    ]);
    sock.new_link_with_data(spec.name, InfoKind::Vxlan, data, Some(spec.mtu))
        .with_context(|| format!("creating vxlan {}", spec.name))
}

/// Move the VXLAN link into the sandbox namespace and attach it to the
/// bridge there, matching the lazy subnet-init sequence in §4.4: "create
/// VXLAN outside sandbox ... and move it inside as a bridge slave."
pub fn move_vxlan_into_sandbox(vxlan_name: &str, sandbox_path: &std::path::Path, bridge_name: &str) -> Result<()> {
    let name = vxlan_name.to_string();
    let bridge = bridge_name.to_string();
    super::nsthread::run_in_namespace(sandbox_path, move || {
        let mut lookup = netlink::Socket::new().context("opening netlink socket inside sandbox")?;
        let bridge_id = lookup
            .get_link(LinkID::Name(bridge.clone()))
            .with_context(|| format!("looking up bridge {} inside sandbox", bridge))?
            .header
            .index;
        let mut sock = NlSocket::new().context("opening netlink transport inside sandbox")?;
        sock.set_master(&name, bridge_id)
            .with_context(|| format!("attaching {} to bridge {}", name, bridge))?;
        sock.set_up(&name)
            .with_context(|| format!("setting {} up", name))?;
        Ok(())
    })
}

/// Remove a link by name in the root namespace. Used for rollback (the
/// bridge that was just created, when the matching VXLAN-add fails) and for
/// ordinary subnet teardown.
pub fn del_link(name: &str) -> Result<()> {
    let mut socket = netlink::Socket::new().context("opening netlink socket")?;
    socket
        .del_link(LinkID::Name(name.to_string()))
        .with_context(|| format!("deleting link {}", name))
}

/// Same, but inside a sandbox namespace (used when tearing down a subnet's
/// bridge, which lives inside the sandbox rather than the root namespace).
pub fn del_link_in_sandbox(name: &str, sandbox_path: &std::path::Path) -> Result<()> {
    let name = name.to_string();
    super::nsthread::run_in_namespace(sandbox_path, move || {
        let mut socket = netlink::Socket::new().context("opening netlink socket inside sandbox")?;
        socket
            .del_link(LinkID::Name(name.clone()))
            .with_context(|| format!("deleting link {} inside sandbox", name))
    })
}
