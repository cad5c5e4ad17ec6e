//! Encryption Controller (§4.3). One controller instance per *secure*
//! network: programs XFRM state/policy and the firewall rules so that
//! VXLAN datagrams between this node and each remote VTEP are wrapped in
//! ESP transport mode, and cleartext VXLAN datagrams for the network's VNI
//! are dropped on input. Handles key rotation (add/prune/promote primary).
//!
//! Grounded in the pack's `mheon-netavark` firewall idempotency idiom
//! (`kal::firewall`) for the rule half and in `p13marc-nlink`'s XFRM wire
//! constants (`kal::xfrm`) for the SA/policy half; the state machine and
//! SPI-derivation rules are this driver's own, per §4.3.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::external::EncryptionKey;
use crate::kal::bpf;
use crate::kal::firewall::FirewallLock;
use crate::kal::xfrm::{Aead, SaSpec, SpSpec, XfrmSocket};

/// Fixed AEAD shape for every SA this controller installs (§4.3:
/// "rfc4106(gcm(aes)), ICV 64 bits").
const AEAD_ALG: &str = "rfc4106(gcm(aes))";
const ICV_BITS: u32 = 64;

/// FNV-1a, 32-bit variant: offset basis `2166136261`, prime `16777619`
/// (distinct from the 64-bit FNV-1a `fnv::FnvHasher` computes — §4.3
/// requires `fnv32a` specifically, so this is hand-rolled rather than
/// truncating the 64-bit hash, which would not agree with a spec-
/// conformant peer).
const FNV32_OFFSET_BASIS: u32 = 2166136261;
const FNV32_PRIME: u32 = 16777619;

fn fnv32a(bytes: &[u8]) -> u32 {
    let mut hash = FNV32_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV32_PRIME);
    }
    hash
}

/// `fnv32a(src || tag_bytes || dst)` (§4.3 "SPI derivation"): stable,
/// node-derivable without coordination. `tag` is encoded as 8 big-endian
/// bytes so both ends agree on the byte sequence being hashed regardless
/// of host endianness.
pub fn derive_spi(src: Ipv4Addr, dst: Ipv4Addr, tag: u64) -> u32 {
    let mut bytes = Vec::with_capacity(4 + 8 + 4);
    bytes.extend_from_slice(&src.octets());
    bytes.extend_from_slice(&tag.to_be_bytes());
    bytes.extend_from_slice(&dst.octets());
    fnv32a(&bytes)
}

#[derive(Debug, Default, Clone)]
struct PeerState {
    /// tag -> installed reverse-SA SPI (`remote -> local`).
    reverse: HashMap<u64, u32>,
    /// The single active forward SA (`local -> remote`) and the policy
    /// pinned to it, if any. Only one forward SA is active per peer at a
    /// time (§4.3 "Programming rules").
    forward: Option<u64>,
}

/// Per-network secure-transport controller. `vni`/`dst_port` feed the BPF
/// VNI matcher that both firewall rules and (conceptually) XFRM selectors
/// key off of.
pub struct EncryptionController {
    local_vtep: Ipv4Addr,
    vni: u32,
    dst_port: u16,
    global_mark: u32,
    keys: Mutex<Vec<EncryptionKey>>,
    peers: Mutex<HashMap<Ipv4Addr, PeerState>>,
    firewall: Arc<FirewallLock>,
}

impl EncryptionController {
    pub fn new(local_vtep: Ipv4Addr, vni: u32, dst_port: u16, global_mark: u32, keys: Vec<EncryptionKey>, firewall: Arc<FirewallLock>) -> Self {
        EncryptionController {
            local_vtep,
            vni,
            dst_port,
            global_mark,
            keys: Mutex::new(keys),
            peers: Mutex::new(HashMap::new()),
            firewall,
        }
    }

    pub fn has_keys(&self) -> bool {
        !self.keys.lock().unwrap().is_empty()
    }

    fn primary_tag(&self) -> Option<u64> {
        self.keys.lock().unwrap().first().map(|k| k.tag)
    }

    fn key_bytes(&self, tag: u64) -> Option<Vec<u8>> {
        self.keys.lock().unwrap().iter().find(|k| k.tag == tag).map(|k| k.bytes.clone())
    }

    fn aead_for(&self, tag: u64, spi: u32) -> Option<Aead> {
        let mut key_and_salt = self.key_bytes(tag)?;
        key_and_salt.extend_from_slice(&spi.to_be_bytes());
        Some(Aead { name: AEAD_ALG, key_and_salt, icv_bits: ICV_BITS })
    }

    /// Install the mangle-OUTPUT mark rule and the top-of-INPUT drop rule
    /// for this network's VNI (§4.3). Idempotent; called once when the
    /// network becomes secure and its subnet sandbox is initialised.
    pub fn install_firewall_rules(&self) -> Result<()> {
        let program = bpf::match_vxlan(self.vni);
        let bytecode = bpf::render_bytecode(&program);
        crate::kal::firewall::install_vni_rules(&self.firewall, self.global_mark, &bytecode, self.dst_port)
            .map_err(Into::into)
    }

    pub fn remove_firewall_rules(&self) -> Result<()> {
        let program = bpf::match_vxlan(self.vni);
        let bytecode = bpf::render_bytecode(&program);
        crate::kal::firewall::remove_vni_rules(&self.firewall, self.global_mark, &bytecode, self.dst_port)
            .map_err(Into::into)
    }

    /// A remote VTEP became a peer on this secure network: install every
    /// missing reverse SA, and — for the primary key only — the forward SA
    /// plus its policy (§4.3 "Programming rules"). Best-effort: a failed
    /// element is logged and skipped, the rest still converge (§7).
    pub fn peer_joined(&self, remote: Ipv4Addr) {
        let keys = self.keys.lock().unwrap().clone();
        if keys.is_empty() {
            tracing::warn!(%remote, "secure network has no keys, skipping SA install");
            return;
        }
        let mut peers = self.peers.lock().unwrap();
        let state = peers.entry(remote).or_default();

        for key in &keys {
            if state.reverse.contains_key(&key.tag) {
                continue;
            }
            match self.install_reverse_sa(remote, key.tag) {
                Ok(spi) => {
                    state.reverse.insert(key.tag, spi);
                }
                Err(err) => tracing::warn!(%remote, tag = key.tag, error = %err, "failed to install reverse SA, will retry on next peer event"),
            }
        }

        if let Some(primary) = keys.first() {
            if state.forward != Some(primary.tag) {
                match self.install_forward_sa_and_policy(remote, primary.tag) {
                    Ok(()) => {
                        let old = state.forward.replace(primary.tag);
                        if let Some(old_tag) = old {
                            if let Err(err) = self.remove_forward_sa_and_policy(remote, old_tag) {
                                tracing::warn!(%remote, tag = old_tag, error = %err, "failed to remove superseded forward SA");
                            }
                        }
                    }
                    Err(err) => tracing::warn!(%remote, tag = primary.tag, error = %err, "failed to install forward SA/policy"),
                }
            }
        }
    }

    /// The last secure peer to `remote` left: tear down every SA and the
    /// policy for that VTEP (§4.5 "Encryption triggers").
    pub fn peer_left(&self, remote: Ipv4Addr) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(state) = peers.remove(&remote) {
            if let Some(tag) = state.forward {
                if let Err(err) = self.remove_forward_sa_and_policy(remote, tag) {
                    tracing::warn!(%remote, error = %err, "failed to remove forward SA/policy on peer leave");
                }
            }
            for tag in state.reverse.keys() {
                if let Err(err) = self.remove_reverse_sa(remote, *tag) {
                    tracing::warn!(%remote, tag = %tag, error = %err, "failed to remove reverse SA on peer leave");
                }
            }
        }
    }

    /// `updateKeys(new?, primary?, prune?)` (§4.3 "Key rotation").
    pub fn update_keys(&self, new_key: Option<EncryptionKey>, new_primary: Option<u64>, prune: Option<u64>) {
        if let Some(key) = new_key.clone() {
            let mut keys = self.keys.lock().unwrap();
            if !keys.iter().any(|k| k.tag == key.tag) {
                keys.push(key);
            }
        }

        // Step 1: install any missing reverse SA for the new key on every
        // known remote.
        if let Some(key) = &new_key {
            let remotes: Vec<Ipv4Addr> = self.peers.lock().unwrap().keys().copied().collect();
            for remote in remotes {
                let already = self.peers.lock().unwrap().get(&remote).map(|s| s.reverse.contains_key(&key.tag)).unwrap_or(false);
                if already {
                    continue;
                }
                match self.install_reverse_sa(remote, key.tag) {
                    Ok(spi) => {
                        self.peers.lock().unwrap().entry(remote).or_default().reverse.insert(key.tag, spi);
                    }
                    Err(err) => tracing::warn!(%remote, tag = key.tag, error = %err, "rotation: failed to install reverse SA"),
                }
            }
        }

        // Step 2: promote a new primary — forward SA + policy, then drop
        // the old forward SA. Only one forward SA is active per peer.
        if let Some(primary_tag) = new_primary {
            let remotes: Vec<Ipv4Addr> = self.peers.lock().unwrap().keys().copied().collect();
            for remote in remotes {
                let old_forward = self.peers.lock().unwrap().get(&remote).and_then(|s| s.forward);
                if old_forward == Some(primary_tag) {
                    continue;
                }
                match self.install_forward_sa_and_policy(remote, primary_tag) {
                    Ok(()) => {
                        self.peers.lock().unwrap().entry(remote).or_default().forward = Some(primary_tag);
                        if let Some(old_tag) = old_forward {
                            if let Err(err) = self.remove_forward_sa_and_policy(remote, old_tag) {
                                tracing::warn!(%remote, tag = old_tag, error = %err, "rotation: failed to remove old forward SA");
                            }
                        }
                    }
                    Err(err) => tracing::warn!(%remote, tag = primary_tag, error = %err, "rotation: failed to install new forward SA/policy"),
                }
            }
        }

        // Step 3: remove reverse SAs for the pruned key.
        if let Some(prune_tag) = prune {
            let remotes: Vec<Ipv4Addr> = self.peers.lock().unwrap().keys().copied().collect();
            for remote in remotes {
                let had = self.peers.lock().unwrap().get(&remote).map(|s| s.reverse.contains_key(&prune_tag)).unwrap_or(false);
                if !had {
                    continue;
                }
                if let Err(err) = self.remove_reverse_sa(remote, prune_tag) {
                    tracing::warn!(%remote, tag = prune_tag, error = %err, "rotation: failed to remove pruned reverse SA");
                    continue;
                }
                if let Some(state) = self.peers.lock().unwrap().get_mut(&remote) {
                    state.reverse.remove(&prune_tag);
                }
            }
        }

        // Step 4: reorder local key state — new primary at position 0, the
        // pruned key dropped.
        let mut keys = self.keys.lock().unwrap();
        if let Some(primary_tag) = new_primary {
            if let Some(pos) = keys.iter().position(|k| k.tag == primary_tag) {
                let key = keys.remove(pos);
                keys.insert(0, key);
            }
        }
        if let Some(prune_tag) = prune {
            keys.retain(|k| k.tag != prune_tag);
        }
    }

    fn install_reverse_sa(&self, remote: Ipv4Addr, tag: u64) -> Result<u32> {
        let spi = derive_spi(remote, self.local_vtep, tag);
        let aead = self.aead_for(tag, spi).ok_or_else(|| {
            crate::error::DriverError::NotFound(format!("no key material for tag {}", tag))
        })?;
        let mut sock = XfrmSocket::new()?;
        sock.install_state(&SaSpec { src: remote, dst: self.local_vtep, spi, reqid: self.global_mark, aead })?;
        Ok(spi)
    }

    fn remove_reverse_sa(&self, remote: Ipv4Addr, tag: u64) -> Result<()> {
        let spi = derive_spi(remote, self.local_vtep, tag);
        let mut sock = XfrmSocket::new()?;
        sock.delete_state(remote, self.local_vtep, spi)?;
        Ok(())
    }

    fn install_forward_sa_and_policy(&self, remote: Ipv4Addr, tag: u64) -> Result<()> {
        let spi = derive_spi(self.local_vtep, remote, tag);
        let aead = self.aead_for(tag, spi).ok_or_else(|| {
            crate::error::DriverError::NotFound(format!("no key material for tag {}", tag))
        })?;
        let mut sock = XfrmSocket::new()?;
        sock.install_state(&SaSpec { src: self.local_vtep, dst: remote, spi, reqid: self.global_mark, aead })?;
        sock.install_policy(&SpSpec {
            src: self.local_vtep,
            dst: remote,
            mark: self.global_mark,
            dst_port: self.dst_port,
            tmpl_spi: spi,
        })?;
        Ok(())
    }

    fn remove_forward_sa_and_policy(&self, remote: Ipv4Addr, tag: u64) -> Result<()> {
        let spi = derive_spi(self.local_vtep, remote, tag);
        let mut sock = XfrmSocket::new()?;
        sock.delete_policy(self.local_vtep, remote, self.global_mark)?;
        sock.delete_state(self.local_vtep, remote, spi)?;
        Ok(())
    }

    /// Reclaim SAs/SPs a previous process left behind, by enumerating every
    /// XFRM state/policy and deleting those whose `reqid`/mark equals this
    /// controller's `global_mark` (§4.3 "Stale SAs/SPs left by a previous
    /// process are reclaimed at startup ... reqid == GLOBAL_MARK or whose
    /// policy mark matches"). Enumeration and deletion are both best-effort:
    /// any failure is logged and the sweep continues, never fatal to
    /// startup (§7 "Background watcher errors").
    pub fn reclaim_stale(&self) {
        let mut sock = match XfrmSocket::new() {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "skipping stale XFRM reclaim: could not open socket");
                return;
            }
        };

        match sock.dump_states() {
            Ok(sas) => {
                for (dst, spi, reqid) in sas {
                    if reqid != self.global_mark {
                        continue;
                    }
                    if let Err(err) = sock.delete_state(Ipv4Addr::UNSPECIFIED, dst, spi) {
                        tracing::warn!(%dst, spi, error = %err, "failed to reclaim stale XFRM SA");
                    } else {
                        tracing::info!(%dst, spi, "reclaimed stale XFRM SA from a previous process");
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "skipping stale XFRM state reclaim"),
        }

        match sock.dump_policies() {
            Ok(policies) => {
                for (src, dst, mark) in policies {
                    if mark != self.global_mark {
                        continue;
                    }
                    if let Err(err) = sock.delete_policy(src, dst, mark) {
                        tracing::warn!(%src, %dst, error = %err, "failed to reclaim stale XFRM policy");
                    } else {
                        tracing::info!(%src, %dst, "reclaimed stale XFRM policy from a previous process");
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "skipping stale XFRM policy reclaim"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spi_derivation_is_stable_and_direction_sensitive() {
        let a: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let b: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let spi_ab = derive_spi(a, b, 1);
        let spi_ab_again = derive_spi(a, b, 1);
        let spi_ba = derive_spi(b, a, 1);
        assert_eq!(spi_ab, spi_ab_again, "same inputs must derive the same SPI on every node");
        assert_ne!(spi_ab, spi_ba, "direction must affect the derived SPI");
    }

    #[test]
    fn spi_derivation_varies_with_tag() {
        let a: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let b: Ipv4Addr = "10.0.0.2".parse().unwrap();
        assert_ne!(derive_spi(a, b, 1), derive_spi(a, b, 2));
    }

    #[test]
    fn rotation_reorders_keys_and_drops_pruned() {
        let firewall = Arc::new(FirewallLock::new());
        let ctrl = EncryptionController::new(
            "10.0.0.1".parse().unwrap(),
            4097,
            4789,
            0xD0C4E3,
            vec![EncryptionKey { bytes: vec![1; 16], tag: 1 }],
            firewall,
        );
        ctrl.update_keys(Some(EncryptionKey { bytes: vec![2; 16], tag: 2 }), Some(2), Some(1));
        let keys = ctrl.keys.lock().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].tag, 2);
    }
}
