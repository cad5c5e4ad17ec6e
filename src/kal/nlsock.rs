//! A small synchronous netlink/NETLINK_ROUTE transport shared by
//! `link`, `fdb`, `neigh`, and `route`. `netavark`'s higher-level socket
//! wrapper covers link/address/up; FDB, neighbor, and route programming
//! have no equivalent there, so this module builds request/ack round trips
//! directly on `netlink-packet-core` + `netlink-packet-route`, the same
//! crates the `rust-netlink` examples (`neighbour-add.rs`, `link-vxlan.rs`)
//! construct messages with.

use std::os::fd::AsRawFd;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use netlink_packet_core::{
    NetlinkDeserializable, NetlinkHeader, NetlinkMessage, NetlinkPayload, NetlinkSerializable,
    NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST,
};
use netlink_packet_route::link::{InfoData, InfoKind, LinkAttribute, LinkFlags, LinkInfo, LinkMessage};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};

/// Default receive timeout for every KAL netlink round trip (§5: "netlink
/// sockets are configured with a receive timeout (default 3 s) and all
/// waits are poll-interruptible").
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct NlSocket {
    socket: Socket,
}

impl NlSocket {
    pub fn new() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE).context("opening NETLINK_ROUTE socket")?;
        socket
            .bind(&SocketAddr::new(0, 0))
            .context("binding netlink socket")?;
        set_recv_timeout(&socket, DEFAULT_TIMEOUT)?;
        Ok(NlSocket { socket })
    }

    /// Send `msg` as a create-if-absent request (`NLM_F_CREATE|NLM_F_EXCL`)
    /// and wait for the ack/error. `exclusive = false` drops `NLM_F_EXCL`
    /// for delete/replace style requests.
    pub fn request(&mut self, msg: RouteNetlinkMessage, create: bool, exclusive: bool) -> Result<()> {
        let mut flags = NLM_F_REQUEST | NLM_F_ACK;
        if create {
            flags |= NLM_F_CREATE;
        }
        if exclusive {
            flags |= NLM_F_EXCL;
        }
        let mut packet = NetlinkMessage::new(NetlinkHeader::default(), NetlinkPayload::from(msg));
        packet.header.flags = flags;
        packet.header.sequence_number = 1;
        packet.finalize();

        let mut buf = vec![0u8; packet.header.length as usize];
        packet
            .serialize(&mut buf[..])
            .map_err(|e| anyhow::anyhow!("serializing netlink request: {}", e))?;

        self.socket
            .send(&buf, 0)
            .context("sending netlink request")?;

        let mut recv_buf = vec![0u8; 1024 * 8];
        let n = self
            .socket
            .recv(&mut &mut recv_buf[..], 0)
            .context("receiving netlink response (timed out?)")?;

        let parsed = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&recv_buf[..n])
            .context("parsing netlink response")?;
        match parsed.payload {
            NetlinkPayload::Error(err) if err.code.is_some() => {
                bail!("netlink error: {}", err.to_string())
            }
            NetlinkPayload::Error(_) | NetlinkPayload::Ack(_) => Ok(()),
            other => bail!("unexpected netlink payload: {:?}", other),
        }
    }

    /// Create a link with an explicit `InfoData` payload (used for VXLAN,
    /// where the flag set in §4.1's table has no representation in
    /// `netavark`'s bridge/veth-only wrapper).
    pub fn new_link_with_data(
        &mut self,
        name: &str,
        kind: InfoKind,
        data: InfoData,
        mtu: Option<u32>,
    ) -> Result<()> {
        let mut msg = LinkMessage::default();
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        msg.attributes
            .push(LinkAttribute::LinkInfo(vec![LinkInfo::Kind(kind), LinkInfo::Data(data)]));
        if let Some(mtu) = mtu {
            msg.attributes.push(LinkAttribute::Mtu(mtu));
        }
        self.request(RouteNetlinkMessage::NewLink(msg), true, true)
    }

    /// `ip link set <name> master <master_index>`.
    pub fn set_master(&mut self, name: &str, master_index: u32) -> Result<()> {
        let mut msg = LinkMessage::default();
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        msg.attributes.push(LinkAttribute::Controller(master_index));
        self.request(RouteNetlinkMessage::SetLink(msg), false, false)
    }

    /// `ip link set <name> up`.
    pub fn set_up(&mut self, name: &str) -> Result<()> {
        let mut msg = LinkMessage::default();
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        msg.header.flags = LinkFlags::Up;
        msg.header.change_mask = LinkFlags::Up;
        self.request(RouteNetlinkMessage::SetLink(msg), false, false)
    }
}

#[cfg(target_os = "linux")]
fn set_recv_timeout(socket: &Socket, timeout: Duration) -> Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        bail!("setsockopt(SO_RCVTIMEO) failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}
