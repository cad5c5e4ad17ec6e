use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use parking_lot::Mutex;

/// The invalid/zero VTEP that marks a `PeerEntry` as local (§3, Design Notes:
/// "local ⇔ vtep invalid" — the newer of the two revisions observed in the
/// original repository, chosen over the older `isLocal` boolean).
pub const INVALID_VTEP: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Immutable value-type peer record. Equality is structural over all three
/// fields, which is exactly what the multiset "same value twice is a no-op"
/// rule in §4.2 needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerEntry {
    pub endpoint_id: String,
    pub vtep: Ipv4Addr,
    pub prefix_bits: u8,
}

impl PeerEntry {
    pub fn new(endpoint_id: impl Into<String>, vtep: Ipv4Addr, prefix_bits: u8) -> Self {
        PeerEntry {
            endpoint_id: endpoint_id.into(),
            vtep,
            prefix_bits,
        }
    }

    pub fn is_local(&self) -> bool {
        self.vtep == INVALID_VTEP
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub ip: IpAddr,
    pub mac: [u8; 6],
}

/// Per-network map from `(ip, mac)` to an insertion-ordered multiset of
/// `PeerEntry`. The repository's observed behaviour on shadow-restore is
/// FIFO: the first-inserted entry is the one the kernel has programmed, and
/// it stays head-of-list until it is explicitly removed. Preserve FIFO.
#[derive(Default)]
struct PeerMap {
    entries: HashMap<PeerKey, Vec<PeerEntry>>,
}

/// PeerDB holds one `PeerMap` per network, each guarded by its own lock so
/// that mutating one network's multiset never blocks a walk or mutation on
/// another (§5: "peerMap.lock — per-network; held while mutating the
/// multiset of a key").
pub struct PeerDb {
    // peerDb.lock: guards the outer network_id -> peerMap map. Held briefly,
    // never across a kernel-programming call.
    networks: Mutex<HashMap<String, Arc<Mutex<PeerMap>>>>,
}

/// Outcome of a mutation: whether the requested value changed the multiset,
/// and the cardinality of the key's list afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationOutcome {
    pub changed: bool,
    pub cardinality: usize,
}

impl PeerDb {
    pub fn new() -> Self {
        PeerDb {
            networks: Mutex::new(HashMap::new()),
        }
    }

    fn with_map<R>(&self, nid: &str, f: impl FnOnce(&mut PeerMap) -> R) -> R {
        // Only the outer lock is held while looking up/creating the
        // per-network entry; released before the inner lock is taken so
        // concurrent operations on different networks never contend on it.
        let inner = {
            let mut networks = self.networks.lock();
            networks
                .entry(nid.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(PeerMap::default())))
                .clone()
        };
        let mut guard = inner.lock();
        f(&mut guard)
    }

    /// Insert a `PeerEntry`. Returns whether the list changed (a brand-new
    /// value, not a duplicate of one already present) and the resulting
    /// cardinality for the key. The caller reprograms the kernel only when
    /// `cardinality == 1` after a successful insert (transient-duplicate
    /// policy, §4.2/§8 item 2): cardinality > 1 means the head entry is
    /// already programmed and this one is a shadow.
    pub fn add(
        &self,
        nid: &str,
        endpoint_id: &str,
        ip: IpAddr,
        mac: [u8; 6],
        vtep: Ipv4Addr,
        prefix_bits: u8,
    ) -> MutationOutcome {
        let value = PeerEntry::new(endpoint_id, vtep, prefix_bits);
        self.with_map(nid, |map| {
            let key = PeerKey { ip, mac };
            let list = map.entries.entry(key).or_insert_with(Vec::new);
            if list.contains(&value) {
                return MutationOutcome {
                    changed: false,
                    cardinality: list.len(),
                };
            }
            list.push(value);
            MutationOutcome {
                changed: true,
                cardinality: list.len(),
            }
        })
    }

    /// Remove exactly one occurrence of the value matching
    /// `(endpoint_id, vtep, prefix_bits)` for the given key. Returns whether
    /// anything was removed and the cardinality remaining afterwards (0
    /// means the key itself was dropped). If `cardinality > 0`, the caller
    /// must look up `head` for the same key and reprogram the kernel with
    /// it — that is the promoted shadow (§4.2).
    pub fn del(
        &self,
        nid: &str,
        endpoint_id: &str,
        ip: IpAddr,
        mac: [u8; 6],
        vtep: Ipv4Addr,
        prefix_bits: u8,
    ) -> MutationOutcome {
        let value = PeerEntry::new(endpoint_id, vtep, prefix_bits);
        self.with_map(nid, |map| {
            let key = PeerKey { ip, mac };
            let Some(list) = map.entries.get_mut(&key) else {
                return MutationOutcome {
                    changed: false,
                    cardinality: 0,
                };
            };
            let Some(pos) = list.iter().position(|e| e == &value) else {
                return MutationOutcome {
                    changed: false,
                    cardinality: list.len(),
                };
            };
            list.remove(pos);
            let cardinality = list.len();
            if list.is_empty() {
                map.entries.remove(&key);
            }
            MutationOutcome {
                changed: true,
                cardinality,
            }
        })
    }

    /// The current head (programmed) entry for a key, if any.
    pub fn head(&self, nid: &str, ip: IpAddr, mac: [u8; 6]) -> Option<PeerEntry> {
        self.with_map(nid, |map| {
            map.entries
                .get(&PeerKey { ip, mac })
                .and_then(|list| list.first().cloned())
        })
    }

    /// Snapshot-and-iterate: copy the whole multiset out under the lock,
    /// release it, then call `f` for every `(key, entry)` pair. `entry` is
    /// always the current head — the only record the kernel has installed.
    pub fn walk(&self, nid: &str, mut f: impl FnMut(PeerKey, &PeerEntry)) {
        let snapshot: Vec<(PeerKey, PeerEntry)> = self.with_map(nid, |map| {
            map.entries
                .iter()
                .filter_map(|(k, v)| v.first().map(|e| (*k, e.clone())))
                .collect()
        });
        for (key, entry) in &snapshot {
            f(*key, entry);
        }
    }

    /// Find the head entry for any key whose IP matches, regardless of MAC.
    /// Used by `kal::miss`'s L3-miss resolution: the kernel only hands the
    /// watcher an IP it failed to resolve, not the `(ip, mac)` pair the
    /// multiset is keyed by.
    pub fn find_by_ip(&self, nid: &str, ip: IpAddr) -> Option<(PeerKey, PeerEntry)> {
        self.with_map(nid, |map| {
            map.entries
                .iter()
                .find(|(k, _)| k.ip == ip)
                .and_then(|(k, v)| v.first().map(|e| (*k, e.clone())))
        })
    }

    /// Find the head entry for any key whose MAC matches, regardless of IP.
    /// Used by `kal::miss`'s L2-miss resolution (VTEP for a MAC).
    pub fn find_by_mac(&self, nid: &str, mac: [u8; 6]) -> Option<(PeerKey, PeerEntry)> {
        self.with_map(nid, |map| {
            map.entries
                .iter()
                .find(|(k, _)| k.mac == mac)
                .and_then(|(k, v)| v.first().map(|e| (*k, e.clone())))
        })
    }

    /// Drop an entire network's peer table (called from `DeleteNetwork`,
    /// after the driver lock has already been released — see §5).
    pub fn flush(&self, nid: &str) {
        self.networks.lock().remove(nid);
    }
}

impl Default for PeerDb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> [u8; 6] {
        [0x02, 0x42, 0x0a, 0x00, 0x01, n]
    }

    #[test]
    fn round_trip_balances_to_empty() {
        let db = PeerDb::new();
        let ip: IpAddr = "10.0.1.5".parse().unwrap();
        let out = db.add("n1", "e1", ip, mac(5), INVALID_VTEP, 24);
        assert_eq!(out, MutationOutcome { changed: true, cardinality: 1 });
        let out = db.del("n1", "e1", ip, mac(5), INVALID_VTEP, 24);
        assert_eq!(out, MutationOutcome { changed: true, cardinality: 0 });
        let mut seen = false;
        db.walk("n1", |_, _| seen = true);
        assert!(!seen, "key must be absent after balanced add/del");
    }

    #[test]
    fn transient_duplicate_programs_only_head_then_promotes_shadow() {
        let db = PeerDb::new();
        let ip: IpAddr = "10.0.1.6".parse().unwrap();
        let vtep_a: Ipv4Addr = "192.168.1.10".parse().unwrap();
        let vtep_b: Ipv4Addr = "192.168.1.20".parse().unwrap();

        let out_a = db.add("n1", "a", ip, mac(6), vtep_a, 24);
        assert_eq!(out_a.cardinality, 1);
        let out_b = db.add("n1", "b", ip, mac(6), vtep_b, 24);
        // cardinality > 1: caller must NOT reprogram, A stays head.
        assert_eq!(out_b.cardinality, 2);
        assert_eq!(db.head("n1", ip, mac(6)).unwrap().endpoint_id, "a");

        let out_del_a = db.del("n1", "a", ip, mac(6), vtep_a, 24);
        assert_eq!(out_del_a.cardinality, 1);
        // caller reprograms with the new head, which is now B.
        assert_eq!(db.head("n1", ip, mac(6)).unwrap().endpoint_id, "b");

        let out_del_b = db.del("n1", "b", ip, mac(6), vtep_b, 24);
        assert_eq!(out_del_b.cardinality, 0);
        assert!(db.head("n1", ip, mac(6)).is_none());
    }

    #[test]
    fn duplicate_value_is_a_no_op() {
        let db = PeerDb::new();
        let ip: IpAddr = "10.0.1.7".parse().unwrap();
        let vtep: Ipv4Addr = "192.168.1.10".parse().unwrap();
        let first = db.add("n1", "a", ip, mac(7), vtep, 24);
        let second = db.add("n1", "a", ip, mac(7), vtep, 24);
        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(second.cardinality, 1);
    }

    #[test]
    fn flush_drops_whole_network() {
        let db = PeerDb::new();
        let ip: IpAddr = "10.0.1.8".parse().unwrap();
        db.add("n1", "a", ip, mac(8), INVALID_VTEP, 24);
        db.flush("n1");
        let mut seen = false;
        db.walk("n1", |_, _| seen = true);
        assert!(!seen);
    }

    #[test]
    fn find_by_ip_and_mac_ignore_the_other_half_of_the_key() {
        let db = PeerDb::new();
        let ip: IpAddr = "10.0.1.9".parse().unwrap();
        let vtep: Ipv4Addr = "192.168.1.30".parse().unwrap();
        db.add("n1", "a", ip, mac(9), vtep, 24);

        let (key, entry) = db.find_by_ip("n1", ip).expect("ip miss should resolve");
        assert_eq!(key.mac, mac(9));
        assert_eq!(entry.endpoint_id, "a");

        let (key, entry) = db.find_by_mac("n1", mac(9)).expect("mac miss should resolve");
        assert_eq!(key.ip, ip);
        assert_eq!(entry.vtep, vtep);

        assert!(db.find_by_ip("n1", "10.0.1.200".parse().unwrap()).is_none());
    }
}
