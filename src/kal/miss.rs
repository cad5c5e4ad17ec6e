//! WatchMiss (§4.4): a per-sandbox watcher that subscribes to
//! `NETLINK_ROUTE / RTNLGRP_NEIGH` inside the sandbox namespace and reacts
//! to the VXLAN driver's "neighbor miss" notifications — the kernel asking
//! "I don't know the MAC for this IP" (L3 miss) or "I don't know the VTEP
//! for this MAC" (L2 miss). This is what lets the driver keep only the
//! peerDB in sync fleet-wide: kernel FDB/neighbor entries are materialised
//! lazily, on demand, the first time traffic actually needs them.
//!
//! Grounded in `nsthread`'s namespace-pinning discipline (the watcher
//! thread itself must live inside the sandbox for the whole of its life,
//! not just for one round trip, so it does its own `setns` rather than
//! going through `run_in_namespace`'s spawn-run-join shape) and in
//! `nlsock::NlSocket`'s request/ack transport for the raw `netlink-sys`
//! socket handling.
//!
//! Cancellation (§5 "Cancellation", §8 S5): `MissWatcher::stop` flips an
//! `AtomicBool` the receive loop checks after every poll-timeout interval
//! (default 3s, matching the KAL's standard netlink receive timeout) and
//! then joins the thread. The spec models this as "the watcher interprets
//! socket fd is -1 as a clean shutdown"; since the socket here is owned
//! exclusively by its own thread (not shared), there is no separate fd to
//! invalidate from outside — the flag-plus-bounded-timeout achieves the
//! same observable property: the watcher exits within `timeout` of the
//! owning sandbox going away, without leaking.

use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use netlink_packet_core::{NetlinkDeserializable, NetlinkMessage, NetlinkPayload};
use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourState};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;

/// `RTMGRP_NEIGH` (linux/rtnetlink.h): the legacy bind-time multicast group
/// bit for neighbor table events, the group this driver needs ARP/FDB miss
/// notifications from.
const RTMGRP_NEIGH: u32 = 0x0000_0400;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// A single unresolved lookup the VXLAN driver signalled.
#[derive(Debug, Clone, Copy)]
pub enum MissEvent {
    /// L3 miss: the kernel knows the IP but not the MAC behind it.
    L3 { ifindex: u32, ip: Ipv4Addr },
    /// L2 miss: the kernel knows the MAC but not which VTEP it lives
    /// behind (an `AF_BRIDGE` neighbor/FDB lookup on the VXLAN link).
    L2 { ifindex: u32, mac: [u8; 6] },
}

pub struct MissWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MissWatcher {
    /// Spawn a watcher pinned to the sandbox at `sandbox_path`. `on_miss`
    /// is called from the watcher thread for every miss notification
    /// observed; it should resolve the lookup against the peerDB and
    /// program the corresponding FDB/neighbor entry (§4.4).
    pub fn spawn(sandbox_path: PathBuf, on_miss: Arc<dyn Fn(MissEvent) + Send + Sync>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = stop.clone();
        let handle = thread::Builder::new()
            .name("overlay-miss-watcher".into())
            .spawn(move || {
                if let Err(err) = run(&sandbox_path, &stop_for_thread, on_miss.as_ref()) {
                    tracing::warn!(path = %sandbox_path.display(), error = %err, "miss watcher exiting");
                }
            })
            .context("failed to spawn miss-watcher thread")?;
        Ok(MissWatcher { stop, handle: Some(handle) })
    }

    /// Signal the watcher to stop and join it. Bounded by the socket's
    /// receive timeout (§5 "Draining is bounded by the timeout").
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MissWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(sandbox_path: &Path, stop: &AtomicBool, on_miss: &(dyn Fn(MissEvent) + Send + Sync)) -> Result<()> {
    enter_namespace(sandbox_path)
        .with_context(|| format!("entering namespace {} for miss watcher", sandbox_path.display()))?;

    let mut socket = Socket::new(NETLINK_ROUTE).context("opening NETLINK_ROUTE socket for miss watcher")?;
    socket
        .bind(&SocketAddr::new(0, RTMGRP_NEIGH))
        .context("joining RTNLGRP_NEIGH")?;
    set_recv_timeout(&socket, RECV_TIMEOUT)?;

    tracing::debug!(path = %sandbox_path.display(), "miss watcher listening");

    let mut buf = vec![0u8; 1 << 16];
    while !stop.load(Ordering::Relaxed) {
        let n = match socket.recv(&mut &mut buf[..], 0) {
            Ok(n) => n,
            Err(err) if is_timeout(&err) => continue,
            Err(err) => {
                // A genuine socket error, not a timeout: per §7 "background
                // watcher errors are logged and the loop continues" unless
                // we've been told to stop.
                if stop.load(Ordering::Relaxed) {
                    return Ok(());
                }
                tracing::warn!(error = %err, "miss watcher recv error, retrying");
                continue;
            }
        };

        let parsed = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[..n]) {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(error = %err, "miss watcher: dropping unparseable netlink message");
                continue;
            }
        };
        if let NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewNeighbour(neigh)) = parsed.payload {
            if let Some(event) = classify(&neigh) {
                on_miss(event);
            }
        }
    }
    Ok(())
}

/// Classify a `RTM_NEWNEIGH` notification as an L3 or L2 miss, per §4.4:
/// a miss is signalled by an incomplete/failed neighbor state — an entry
/// the kernel tried to resolve and could not. `AF_BRIDGE` family marks a
/// bridge-FDB lookup (L2, MAC -> VTEP); any other family is an ordinary IP
/// neighbor lookup (L3, IP -> MAC).
fn classify(msg: &netlink_packet_route::neighbour::NeighbourMessage) -> Option<MissEvent> {
    let incomplete = matches!(msg.header.state, NeighbourState::Incomplete | NeighbourState::Failed);
    if !incomplete {
        return None;
    }
    let ifindex = msg.header.ifindex;
    match msg.header.family {
        AddressFamily::Bridge => {
            let mac = msg.attributes.iter().find_map(|a| match a {
                NeighbourAttribute::LinkLocalAddress(bytes) if bytes.len() == 6 => {
                    let mut out = [0u8; 6];
                    out.copy_from_slice(bytes);
                    Some(out)
                }
                _ => None,
            })?;
            Some(MissEvent::L2 { ifindex, mac })
        }
        AddressFamily::Inet => {
            let ip = msg.attributes.iter().find_map(|a| match a {
                NeighbourAttribute::Destination(NeighbourAddress::Inet(addr)) => Some(*addr),
                _ => None,
            })?;
            Some(MissEvent::L3 { ifindex, ip })
        }
        _ => None,
    }
}

fn enter_namespace(ns_path: &Path) -> Result<()> {
    use std::os::fd::BorrowedFd;
    let fd = open(ns_path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .with_context(|| format!("opening namespace file {}", ns_path.display()))?;
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd.as_raw_fd()) };
    setns(borrowed, CloneFlags::CLONE_NEWNET).context("setns(CLONE_NEWNET) failed")?;
    Ok(())
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
        anyhow::bail!("setsockopt(SO_RCVTIMEO) failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neigh(family: AddressFamily, state: NeighbourState, attrs: Vec<NeighbourAttribute>) -> netlink_packet_route::neighbour::NeighbourMessage {
        let mut msg = netlink_packet_route::neighbour::NeighbourMessage::default();
        msg.header.family = family;
        msg.header.state = state;
        msg.header.ifindex = 7;
        msg.attributes = attrs;
        msg
    }

    #[test]
    fn classifies_l3_miss_from_incomplete_inet_neighbour() {
        let msg = neigh(
            AddressFamily::Inet,
            NeighbourState::Incomplete,
            vec![NeighbourAttribute::Destination(NeighbourAddress::Inet("10.0.1.9".parse().unwrap()))],
        );
        match classify(&msg) {
            Some(MissEvent::L3 { ifindex, ip }) => {
                assert_eq!(ifindex, 7);
                assert_eq!(ip, "10.0.1.9".parse::<Ipv4Addr>().unwrap());
            }
            other => panic!("expected L3 miss, got {:?}", other.is_some()),
        }
    }

    #[test]
    fn classifies_l2_miss_from_incomplete_bridge_neighbour() {
        let mac = [0x02, 0x42, 0x0a, 0x00, 0x01, 0x09];
        let msg = neigh(
            AddressFamily::Bridge,
            NeighbourState::Incomplete,
            vec![NeighbourAttribute::LinkLocalAddress(mac.to_vec())],
        );
        match classify(&msg) {
            Some(MissEvent::L2 { mac: got, .. }) => assert_eq!(got, mac),
            other => panic!("expected L2 miss, got {:?}", other.is_some()),
        }
    }

    #[test]
    fn reachable_state_is_not_a_miss() {
        let msg = neigh(AddressFamily::Inet, NeighbourState::Reachable, vec![]);
        assert!(classify(&msg).is_none());
    }
}
