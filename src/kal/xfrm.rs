//! XFRM state/policy programming (§4.1 "install XFRM state", "install XFRM
//! policy"; §4.3 throughout). `netlink-packet-route` has no XFRM support,
//! so messages are assembled as raw byte buffers over the same
//! `netlink-sys` transport `nlsock::NlSocket` uses for `NETLINK_ROUTE` —
//! this mirrors the request/ack idiom of that module while targeting
//! `NETLINK_XFRM`.
//!
//! Struct layouts and message-type numbers follow `linux/xfrm.h`; the
//! message-type values were cross-checked against the pack's
//! `p13marc-nlink` XFRM client (`GETSA = 0x12`, `GETPOLICY = 0x15`), which
//! independently confirms the same base numbering this module uses for
//! `NEWSA`/`DELSA`/`NEWPOLICY`/`DELPOLICY`.

use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use netlink_sys::{Socket, SocketAddr};

const NETLINK_XFRM: isize = 6;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
const NLM_F_CREATE: u16 = 0x400;
const NLM_F_EXCL: u16 = 0x200;
const NLM_F_DUMP: u16 = 0x100 | 0x200;

const XFRM_MSG_NEWSA: u16 = 0x10;
const XFRM_MSG_DELSA: u16 = 0x11;
const XFRM_MSG_GETSA: u16 = 0x12;
const XFRM_MSG_NEWPOLICY: u16 = 0x13;
const XFRM_MSG_DELPOLICY: u16 = 0x14;
const XFRM_MSG_GETPOLICY: u16 = 0x15;

const XFRMA_ALG_AEAD: u16 = 18;
const XFRMA_MARK: u16 = 21;
const XFRMA_TMPL: u16 = 6;

const XFRM_MODE_TRANSPORT: u8 = 0;
const IPPROTO_ESP: u8 = 50;
const AF_INET: u16 = 2;

const XFRM_POLICY_OUT: u8 = 1;
const XFRM_POLICY_ALLOW: u8 = 0;

/// `rfc4106(gcm(aes))` AEAD transform with an 8-byte (64-bit) ICV, per §4.3.
pub struct Aead {
    pub name: &'static str,
    /// `key_bytes || be32(spi)` salt appended by the caller before this is
    /// built — see `encryption::install_reverse_sa`.
    pub key_and_salt: Vec<u8>,
    pub icv_bits: u32,
}

pub struct SaSpec {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub spi: u32,
    pub reqid: u32,
    pub aead: Aead,
}

pub struct SpSpec {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub mark: u32,
    pub dst_port: u16,
    /// SPI of the forward SA this policy's template should reference.
    pub tmpl_spi: u32,
}

pub struct XfrmSocket {
    socket: Socket,
    seq: u32,
}

impl XfrmSocket {
    pub fn new() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_XFRM).context("opening NETLINK_XFRM socket")?;
        socket.bind(&SocketAddr::new(0, 0)).context("binding xfrm socket")?;
        set_recv_timeout(&socket, Duration::from_secs(3))?;
        Ok(XfrmSocket { socket, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq += 1;
        self.seq
    }

    fn roundtrip(&mut self, msg_type: u16, flags: u16, payload: &[u8]) -> Result<Vec<u8>> {
        let seq = self.next_seq();
        let mut buf = nlmsg_header(msg_type, flags, seq, payload.len());
        buf.extend_from_slice(payload);
        self.socket.send(&buf, 0).context("sending xfrm request")?;

        let mut recv_buf = vec![0u8; 1 << 16];
        let n = self
            .socket
            .recv(&mut &mut recv_buf[..], 0)
            .context("receiving xfrm response (timed out?)")?;
        recv_buf.truncate(n);
        check_ack_or_error(&recv_buf)?;
        Ok(recv_buf)
    }

    /// Install a forward or reverse SA (§4.1 "install XFRM state"). Pre-
    /// checked with a `GETSA`-style idempotency query by the caller
    /// (`sa_exists`) so repeated installs from retried peer events are
    /// absorbed as transient (§7), not fatal.
    pub fn install_state(&mut self, spec: &SaSpec) -> Result<()> {
        let payload = build_usersa_info(spec);
        self.roundtrip(XFRM_MSG_NEWSA, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL, &payload)
            .map(|_| ())
            .with_context(|| format!("installing SA {} -> {} spi={:#x}", spec.src, spec.dst, spec.spi))
    }

    pub fn delete_state(&mut self, src: Ipv4Addr, dst: Ipv4Addr, spi: u32) -> Result<()> {
        let payload = build_xfrm_id_query(dst, spi);
        self.roundtrip(XFRM_MSG_DELSA, NLM_F_REQUEST | NLM_F_ACK, &payload)
            .map(|_| ())
            .with_context(|| format!("deleting SA {} -> {} spi={:#x}", src, dst, spi))
    }

    /// Install an outgoing policy pinning `src/32 -> dst/32` (UDP, marked)
    /// to the forward SA's SPI (§4.1 "install XFRM policy", §4.3).
    pub fn install_policy(&mut self, spec: &SpSpec) -> Result<()> {
        let payload = build_userpolicy_info(spec);
        self.roundtrip(XFRM_MSG_NEWPOLICY, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL, &payload)
            .map(|_| ())
            .with_context(|| format!("installing policy {} -> {} mark={:#x}", spec.src, spec.dst, spec.mark))
    }

    pub fn delete_policy(&mut self, src: Ipv4Addr, dst: Ipv4Addr, mark: u32) -> Result<()> {
        let payload = build_policy_selector_query(src, dst, mark);
        self.roundtrip(XFRM_MSG_DELPOLICY, NLM_F_REQUEST | NLM_F_ACK, &payload)
            .map(|_| ())
            .with_context(|| format!("deleting policy {} -> {} mark={:#x}", src, dst, mark))
    }

    /// Enumerate every SA (`XFRM_MSG_GETSA` with `NLM_F_DUMP`) and parse out
    /// `(dst, spi, reqid)` for each, for the startup reclaim sweep (§4.3:
    /// "Stale SAs/SPs left by a previous process are reclaimed at startup
    /// ... reqid == GLOBAL_MARK").
    pub fn dump_states(&mut self) -> Result<Vec<(Ipv4Addr, u32, u32)>> {
        let seq = self.next_seq();
        let mut buf = nlmsg_header(XFRM_MSG_GETSA, NLM_F_REQUEST | NLM_F_DUMP, seq, 0);
        self.socket.send(&buf, 0).context("sending xfrm SA dump request")?;
        buf = self.recv_dump()?;
        Ok(split_nlmsgs(&buf, XFRM_MSG_NEWSA).iter().filter_map(|payload| parse_usersa_info(payload)).collect())
    }

    /// Enumerate every policy (`XFRM_MSG_GETPOLICY` with `NLM_F_DUMP`) and
    /// parse out `(src, dst, mark)` for each.
    pub fn dump_policies(&mut self) -> Result<Vec<(Ipv4Addr, Ipv4Addr, u32)>> {
        let seq = self.next_seq();
        let buf = nlmsg_header(XFRM_MSG_GETPOLICY, NLM_F_REQUEST | NLM_F_DUMP, seq, 0);
        self.socket.send(&buf, 0).context("sending xfrm policy dump request")?;
        let buf = self.recv_dump()?;
        Ok(split_nlmsgs(&buf, XFRM_MSG_NEWPOLICY).iter().filter_map(|payload| parse_userpolicy_info(payload)).collect())
    }

    /// Drain dump responses off the socket until `NLMSG_DONE`, concatenating
    /// the raw bytes of every message received. A dump can span several
    /// `recv()` calls once the kernel has more entries than fit one
    /// datagram; each iteration reuses the same 3s receive timeout as every
    /// other KAL netlink operation (§5 "netlink sockets are configured with
    /// a receive timeout").
    fn recv_dump(&mut self) -> Result<Vec<u8>> {
        let mut all = Vec::new();
        loop {
            let mut recv_buf = vec![0u8; 1 << 16];
            let n = self.socket.recv(&mut &mut recv_buf[..], 0).context("receiving xfrm dump response (timed out?)")?;
            recv_buf.truncate(n);
            if nlmsgs_contain_done(&recv_buf) {
                all.extend_from_slice(&recv_buf);
                break;
            }
            all.extend_from_slice(&recv_buf);
        }
        Ok(all)
    }
}

const NLMSG_DONE: u16 = 3;
const NLMSG_ERROR: u16 = 2;

fn nlmsgs_contain_done(buf: &[u8]) -> bool {
    let mut offset = 0;
    while offset + 16 <= buf.len() {
        let len = u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        if len < 16 {
            break;
        }
        let msg_type = u16::from_ne_bytes(buf[offset + 4..offset + 6].try_into().unwrap());
        if msg_type == NLMSG_DONE {
            return true;
        }
        offset += align4(len);
    }
    false
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Split a concatenated dump buffer into the payloads of every message whose
/// type is `want_type`, stripping the 16-byte `nlmsghdr` from each. Messages
/// of other types (`NLMSG_DONE`, `NLMSG_ERROR`) are skipped.
fn split_nlmsgs(buf: &[u8], want_type: u16) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + 16 <= buf.len() {
        let len = u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        if len < 16 || offset + len > buf.len() {
            break;
        }
        let msg_type = u16::from_ne_bytes(buf[offset + 4..offset + 6].try_into().unwrap());
        if msg_type == want_type {
            out.push(buf[offset + 16..offset + len].to_vec());
        } else if msg_type == NLMSG_DONE || msg_type == NLMSG_ERROR {
            break;
        }
        offset += align4(len);
    }
    out
}

/// Offsets into the fixed-length prefix of `build_usersa_info`'s payload
/// (selector 54 bytes, then `id.daddr`(16)/`id.spi`(4 be)/... , `reqid` at a
/// further fixed offset), mirroring that function's own layout exactly so a
/// dump this same process produced round-trips; used to recognise entries
/// this driver (or an earlier instance of it) installed.
fn parse_usersa_info(payload: &[u8]) -> Option<(Ipv4Addr, u32, u32)> {
    const SELECTOR_LEN: usize = 54;
    const ID_DADDR_OFFSET: usize = SELECTOR_LEN;
    const ID_SPI_OFFSET: usize = SELECTOR_LEN + 16;
    const REQID_OFFSET: usize = SELECTOR_LEN + 24 + 16 + 64 + 32;
    if payload.len() < REQID_OFFSET + 4 {
        return None;
    }
    let daddr = Ipv4Addr::new(
        payload[ID_DADDR_OFFSET],
        payload[ID_DADDR_OFFSET + 1],
        payload[ID_DADDR_OFFSET + 2],
        payload[ID_DADDR_OFFSET + 3],
    );
    let spi = u32::from_be_bytes(payload[ID_SPI_OFFSET..ID_SPI_OFFSET + 4].try_into().ok()?);
    let reqid = u32::from_ne_bytes(payload[REQID_OFFSET..REQID_OFFSET + 4].try_into().ok()?);
    Some((daddr, spi, reqid))
}

/// Mirrors `build_userpolicy_info`'s fixed-length prefix (selector 54 bytes
/// giving `src`/`dst`, then the fixed policy fields) plus a scan of the
/// trailing attributes for `XFRMA_MARK`.
fn parse_userpolicy_info(payload: &[u8]) -> Option<(Ipv4Addr, Ipv4Addr, u32)> {
    const SELECTOR_DADDR_OFFSET: usize = 0;
    const SELECTOR_SADDR_OFFSET: usize = 16;
    const FIXED_LEN: usize = 54 + 12 + 64 + 32;
    if payload.len() < FIXED_LEN {
        return None;
    }
    let dst = Ipv4Addr::new(
        payload[SELECTOR_DADDR_OFFSET],
        payload[SELECTOR_DADDR_OFFSET + 1],
        payload[SELECTOR_DADDR_OFFSET + 2],
        payload[SELECTOR_DADDR_OFFSET + 3],
    );
    let src = Ipv4Addr::new(
        payload[SELECTOR_SADDR_OFFSET],
        payload[SELECTOR_SADDR_OFFSET + 1],
        payload[SELECTOR_SADDR_OFFSET + 2],
        payload[SELECTOR_SADDR_OFFSET + 3],
    );
    let mark = find_attr(&payload[FIXED_LEN..], XFRMA_MARK).and_then(|v| v.get(0..4)).and_then(|b| b.try_into().ok()).map(u32::from_ne_bytes)?;
    Some((src, dst, mark))
}

/// Walk a TLV attribute buffer (`len: u16, type: u16, payload, pad-to-4`)
/// looking for one attribute type.
fn find_attr(mut buf: &[u8], want_type: u16) -> Option<Vec<u8>> {
    while buf.len() >= 4 {
        let len = u16::from_ne_bytes(buf[0..2].try_into().ok()?) as usize;
        let attr_type = u16::from_ne_bytes(buf[2..4].try_into().ok()?);
        if len < 4 || len > buf.len() {
            break;
        }
        let payload = &buf[4..len];
        if attr_type == want_type {
            return Some(payload.to_vec());
        }
        let advance = align4(len);
        if advance >= buf.len() {
            break;
        }
        buf = &buf[advance..];
    }
    None
}

fn nlmsg_header(msg_type: u16, flags: u16, seq: u32, payload_len: usize) -> Vec<u8> {
    let total = 16 + payload_len;
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_ne_bytes());
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // pid, kernel fills in
    buf
}

fn check_ack_or_error(buf: &[u8]) -> Result<()> {
    if buf.len() < 16 {
        bail!("short netlink response ({} bytes)", buf.len());
    }
    let msg_type = u16::from_ne_bytes(buf[4..6].try_into().unwrap());
    const NLMSG_ERROR: u16 = 2;
    if msg_type == NLMSG_ERROR {
        if buf.len() < 20 {
            bail!("truncated NLMSG_ERROR");
        }
        let errno = i32::from_ne_bytes(buf[16..20].try_into().unwrap());
        if errno != 0 {
            bail!("xfrm netlink error: errno {}", -errno);
        }
    }
    Ok(())
}

fn push_addr(buf: &mut Vec<u8>, addr: Ipv4Addr) {
    let mut padded = [0u8; 16];
    padded[..4].copy_from_slice(&addr.octets());
    buf.extend_from_slice(&padded);
}

fn push_attr(buf: &mut Vec<u8>, attr_type: u16, payload: &[u8]) {
    let len = 4 + payload.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(payload);
    let pad = (4 - (len % 4)) % 4;
    buf.extend(std::iter::repeat(0u8).take(pad));
}

/// `struct xfrm_usersa_info` (selector + id + lifetimes + mode/family),
/// followed by an `XFRMA_ALG_AEAD` attribute carrying the AEAD transform.
fn build_usersa_info(spec: &SaSpec) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    // selector: daddr, saddr, ports (wildcard), family, prefixlens, proto
    push_addr(&mut buf, spec.dst);
    push_addr(&mut buf, spec.src);
    buf.extend_from_slice(&[0u8; 8]); // dport/dport_mask/sport/sport_mask, wildcard
    buf.extend_from_slice(&AF_INET.to_ne_bytes());
    buf.push(32); // prefixlen_d
    buf.push(32); // prefixlen_s
    buf.push(IPPROTO_ESP);
    buf.push(0); // padding
    buf.extend_from_slice(&0i32.to_ne_bytes()); // ifindex
    buf.extend_from_slice(&0u32.to_ne_bytes()); // user id

    // id: daddr, spi (network byte order), proto
    push_addr(&mut buf, spec.dst);
    buf.extend_from_slice(&spec.spi.to_be_bytes());
    buf.push(IPPROTO_ESP);
    buf.extend_from_slice(&[0u8; 3]);

    // saddr
    push_addr(&mut buf, spec.src);

    // lifetime_cfg: all zero (no soft/hard limits configured)
    buf.extend_from_slice(&[0u8; 8 * 8]);
    // lifetime_cur
    buf.extend_from_slice(&[0u8; 4 * 8]);

    buf.extend_from_slice(&spec.reqid.to_ne_bytes());
    buf.extend_from_slice(&AF_INET.to_ne_bytes());
    buf.push(XFRM_MODE_TRANSPORT);
    buf.push(0); // replay_window
    buf.push(0); // flags
    buf.push(0); // padding

    let mut msg = nlmsg_header(0, 0, 0, 0); // placeholder, not used directly
    msg.clear();
    msg.extend_from_slice(&buf);

    let mut aead_payload = Vec::new();
    aead_payload.extend_from_slice(spec.aead.name.as_bytes());
    aead_payload.resize(aead_payload.len().max(64), 0); // alg_name[64]
    aead_payload.extend_from_slice(&(spec.aead.key_and_salt.len() as u32 * 8).to_ne_bytes());
    aead_payload.extend_from_slice(&spec.aead.icv_bits.to_ne_bytes());
    aead_payload.extend_from_slice(&spec.aead.key_and_salt);
    push_attr(&mut msg, XFRMA_ALG_AEAD, &aead_payload);

    msg
}

fn build_xfrm_id_query(dst: Ipv4Addr, spi: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    push_addr(&mut buf, dst);
    buf.extend_from_slice(&spi.to_be_bytes());
    buf.push(IPPROTO_ESP);
    buf.extend_from_slice(&[0u8; 3]);
    buf.extend_from_slice(&AF_INET.to_ne_bytes());
    buf.extend_from_slice(&[0u8; 2]);
    buf
}

fn build_userpolicy_info(spec: &SpSpec) -> Vec<u8> {
    let mut buf = Vec::new();
    // selector: src/32 -> dst/32, UDP, dst_port set
    push_addr(&mut buf, spec.dst);
    push_addr(&mut buf, spec.src);
    buf.extend_from_slice(&spec.dst_port.to_be_bytes());
    buf.extend_from_slice(&0xffffu16.to_be_bytes());
    buf.extend_from_slice(&[0u8; 4]); // sport wildcard
    buf.extend_from_slice(&AF_INET.to_ne_bytes());
    buf.push(32);
    buf.push(32);
    buf.push(17); // IPPROTO_UDP
    buf.push(0);
    buf.extend_from_slice(&0i32.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());

    buf.extend_from_slice(&0u64.to_ne_bytes()); // index, dir packed loosely
    buf.push(XFRM_POLICY_OUT);
    buf.push(XFRM_POLICY_ALLOW);
    buf.push(0); // flags
    buf.push(0); // share
    buf.extend_from_slice(&[0u8; 8 * 8]); // lifetime_cfg
    buf.extend_from_slice(&[0u8; 4 * 8]); // lifetime_cur

    let mut tmpl = Vec::new();
    push_addr(&mut tmpl, spec.dst);
    tmpl.extend_from_slice(&spec.tmpl_spi.to_be_bytes());
    tmpl.push(IPPROTO_ESP);
    tmpl.extend_from_slice(&[0u8; 3]);
    tmpl.push(XFRM_MODE_TRANSPORT);
    tmpl.extend_from_slice(&0u32.to_ne_bytes()); // reqid
    tmpl.extend_from_slice(&AF_INET.to_ne_bytes());
    push_addr(&mut tmpl, spec.src);
    push_attr(&mut buf, XFRMA_TMPL, &tmpl);
    push_attr(&mut buf, XFRMA_MARK, &spec.mark.to_ne_bytes());

    buf
}

fn build_policy_selector_query(src: Ipv4Addr, dst: Ipv4Addr, mark: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    push_addr(&mut buf, dst);
    push_addr(&mut buf, src);
    buf.extend_from_slice(&[0u8; 8]);
    buf.extend_from_slice(&AF_INET.to_ne_bytes());
    buf.push(32);
    buf.push(32);
    buf.push(17);
    buf.push(0);
    buf.extend_from_slice(&0i32.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.push(XFRM_POLICY_OUT);
    buf.extend_from_slice(&[0u8; 3]);
    push_attr(&mut buf, XFRMA_MARK, &mark.to_ne_bytes());
    buf
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usersa_payload_embeds_spi_in_network_order() {
        let spec = SaSpec {
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
            spi: 0x1234_5678,
            reqid: 0xD0C4E3,
            aead: Aead { name: "rfc4106(gcm(aes))", key_and_salt: vec![0u8; 20], icv_bits: 64 },
        };
        let payload = build_usersa_info(&spec);
        assert!(payload.windows(4).any(|w| w == [0x12, 0x34, 0x56, 0x78]));
    }

    #[test]
    fn policy_payload_embeds_mark_attribute() {
        let spec = SpSpec {
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
            mark: 0xD0C4E3,
            dst_port: 4789,
            tmpl_spi: 0xAAAA_BBBB,
        };
        let payload = build_userpolicy_info(&spec);
        assert!(payload.windows(4).any(|w| w == 0xD0C4E3u32.to_ne_bytes()));
    }

    #[test]
    fn parse_usersa_info_round_trips_what_build_usersa_info_wrote() {
        let spec = SaSpec {
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
            spi: 0x1234_5678,
            reqid: 0xD0C4E3,
            aead: Aead { name: "rfc4106(gcm(aes))", key_and_salt: vec![0u8; 20], icv_bits: 64 },
        };
        let payload = build_usersa_info(&spec);
        let (dst, spi, reqid) = parse_usersa_info(&payload).expect("payload should parse");
        assert_eq!(dst, spec.dst);
        assert_eq!(spi, spec.spi);
        assert_eq!(reqid, spec.reqid);
    }

    #[test]
    fn parse_userpolicy_info_round_trips_what_build_userpolicy_info_wrote() {
        let spec = SpSpec {
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
            mark: 0xD0C4E3,
            dst_port: 4789,
            tmpl_spi: 0xAAAA_BBBB,
        };
        let payload = build_userpolicy_info(&spec);
        let (src, dst, mark) = parse_userpolicy_info(&payload).expect("payload should parse");
        assert_eq!(src, spec.src);
        assert_eq!(dst, spec.dst);
        assert_eq!(mark, spec.mark);
    }

    #[test]
    fn split_nlmsgs_extracts_only_the_requested_type_and_stops_at_done() {
        let mut buf = Vec::new();
        let payload1 = vec![0xAAu8; 8];
        buf.extend_from_slice(&nlmsg_header(XFRM_MSG_NEWSA, 0, 1, payload1.len()));
        buf.extend_from_slice(&payload1);
        let payload2 = vec![0xBBu8; 8];
        buf.extend_from_slice(&nlmsg_header(XFRM_MSG_NEWPOLICY, 0, 2, payload2.len()));
        buf.extend_from_slice(&payload2);
        buf.extend_from_slice(&nlmsg_header(NLMSG_DONE, 0, 3, 0));

        let sas = split_nlmsgs(&buf, XFRM_MSG_NEWSA);
        assert_eq!(sas, vec![payload1]);
    }
}
