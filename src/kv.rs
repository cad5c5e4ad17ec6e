//! External key-value store abstraction (§6 "Persistent state", Design
//! Notes "External key-value store"). The spec asks for a narrow
//! capability — `get/put/delete with CAS, watch(prefix)` — without binding
//! to a specific backend. `Store` is that capability; `MemoryStore` is the
//! in-memory implementation the Design Notes call for so tests don't need
//! a real cluster store.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{DriverError, Result};

/// Opaque revision returned by `get`/`put`, used for compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(pub u64);

#[derive(Debug, Clone)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub revision: Revision,
}

pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Atomic put: succeeds only if the key's current revision equals
    /// `expected` (`None` means "key must not exist yet"). Returns the new
    /// revision. This is the "CAS ('put-atomic')" operation §6 requires for
    /// the per-network allocation record and §4.4's VNI-allocator retry.
    fn put_atomic(&self, key: &str, value: Vec<u8>, expected: Option<Revision>) -> Result<Revision>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Snapshot every key currently under `prefix`. A narrowed stand-in for
    /// `watch(prefix)`: the Design Notes ask only that the abstraction
    /// "admits in-memory implementations for tests", not a live subscribe
    /// API, since the gossip/watch substrate itself is out of scope (§1).
    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;
}

/// Per-network allocation record persisted in the external store (§6):
/// subnets with their VNIs, the secure flag, and the MTU hint.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct NetworkRecord {
    pub subnets: Vec<SubnetRecord>,
    pub secure: bool,
    pub mtu: u32,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SubnetRecord {
    pub subnet_ip: String,
    pub gw_ip: String,
    pub vni: u32,
}

pub fn record_key(network_id: &str) -> String {
    format!("overlay/network/{}", network_id)
}

/// Read-modify-write a typed record under CAS, retrying on a revision
/// conflict. Used by VNI allocation and release so concurrent callers on
/// different nodes converge (§4.4: "The driver calls these under CAS retry
/// on the persistent record for the network").
pub fn cas_update<T, F>(store: &dyn Store, key: &str, mut f: F) -> Result<T>
where
    T: Serialize + DeserializeOwned + Clone,
    F: FnMut(Option<T>) -> Result<T>,
{
    const MAX_ATTEMPTS: usize = 16;
    for _ in 0..MAX_ATTEMPTS {
        let current = store.get(key)?;
        let (decoded, expected) = match &current {
            Some(v) => (
                Some(serde_json::from_slice::<T>(&v.value).map_err(|e| {
                    DriverError::InvalidArgument(format!("decoding record at {}: {}", key, e))
                })?),
                Some(v.revision),
            ),
            None => (None, None),
        };
        let updated = f(decoded)?;
        let bytes = serde_json::to_vec(&updated)
            .map_err(|e| DriverError::InvalidArgument(format!("encoding record at {}: {}", key, e)))?;
        match store.put_atomic(key, bytes, expected) {
            Ok(_) => return Ok(updated),
            Err(DriverError::Kernel(_)) => continue, // revision race, retry
            Err(other) => return Err(other),
        }
    }
    Err(DriverError::InvalidArgument(format!("CAS update on {} did not converge", key)))
}

#[derive(Default)]
struct Entry {
    value: Vec<u8>,
    revision: u64,
}

/// In-memory `Store`, guarded by a single mutex. Sufficient for unit tests
/// and for the demo harness; a real deployment plugs in the daemon's actual
/// KV client behind the same trait.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    next_revision: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            entries: Mutex::new(HashMap::new()),
            next_revision: Mutex::new(1),
        }
    }

    fn bump(&self) -> u64 {
        let mut next = self.next_revision.lock().unwrap();
        let rev = *next;
        *next += 1;
        rev
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).map(|e| Versioned { value: e.value.clone(), revision: Revision(e.revision) }))
    }

    fn put_atomic(&self, key: &str, value: Vec<u8>, expected: Option<Revision>) -> Result<Revision> {
        let mut entries = self.entries.lock().unwrap();
        let current_rev = entries.get(key).map(|e| e.revision);
        let matches = match (expected, current_rev) {
            (None, None) => true,
            (Some(Revision(e)), Some(c)) => e == c,
            _ => false,
        };
        if !matches {
            return Err(DriverError::from(anyhow::anyhow!("cas conflict: already exists")));
        }
        let revision = self.bump();
        entries.insert(key.to_string(), Entry { value, revision });
        Ok(Revision(revision))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), Versioned { value: e.value.clone(), revision: Revision(e.revision) }))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_rejects_stale_expected_revision() {
        let store = MemoryStore::new();
        let rev = store.put_atomic("k", b"v1".to_vec(), None).unwrap();
        assert!(store.put_atomic("k", b"v2".to_vec(), None).is_err());
        store.put_atomic("k", b"v2".to_vec(), Some(rev)).unwrap();
        assert_eq!(store.get("k").unwrap().unwrap().value, b"v2");
    }

    #[test]
    fn cas_update_retries_are_not_needed_on_uncontended_key() {
        let store = MemoryStore::new();
        let result: NetworkRecord = cas_update(&store, &record_key("n1"), |existing| {
            assert!(existing.is_none());
            Ok(NetworkRecord { subnets: vec![], secure: false, mtu: 1450 })
        })
        .unwrap();
        assert_eq!(result.mtu, 1450);

        let updated: NetworkRecord = cas_update(&store, &record_key("n1"), |existing| {
            let mut rec = existing.unwrap();
            rec.secure = true;
            Ok(rec)
        })
        .unwrap();
        assert!(updated.secure);
    }

    #[test]
    fn list_prefix_only_returns_matching_keys() {
        let store = MemoryStore::new();
        store.put_atomic(&record_key("n1"), b"{}".to_vec(), None).unwrap();
        store.put_atomic("other/key", b"{}".to_vec(), None).unwrap();
        let matches = store.list_prefix("overlay/network/").unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, record_key("n1"));
    }
}
