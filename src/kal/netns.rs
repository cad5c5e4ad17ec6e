//! Sandbox namespace lifecycle (§4.1 "create/mount ns at path",
//! "destroy ns"). Built on `netns-rs`, keyed by network id rather than a
//! fixed `/var/run/netns/<prefix>-<index>` naming scheme.

use anyhow::{Context, Result};
use netns_rs::NetNs;

pub fn sandbox_path(network_id: &str) -> String {
    format!("/var/run/netns/ov-{}", short_id(network_id))
}

fn short_id(network_id: &str) -> String {
    network_id.chars().take(12).collect()
}

/// Create (or mount) the namespace file for a network's sandbox. Bind-mounts
/// a fresh net-ns onto the path; the kernel allocates a new namespace for
/// the unshare implicit in `NetNs::new`.
pub fn create(network_id: &str) -> Result<NetNs> {
    let name = format!("ov-{}", short_id(network_id));
    tracing::debug!(network_id, path = %sandbox_path(network_id), "creating sandbox namespace");
    NetNs::new(&name).with_context(|| format!("creating namespace for network {}", network_id))
}

/// Re-open an existing sandbox namespace by network id, for operations that
/// need to enter it again (e.g. a late subnet's bridge/vxlan setup).
pub fn open(network_id: &str) -> Result<NetNs> {
    let name = format!("ov-{}", short_id(network_id));
    NetNs::get(&name).with_context(|| format!("opening namespace for network {}", network_id))
}

/// Detach-mount and remove the namespace file. Matches §3's "sandbox
/// destroyed when the join counter reaches zero" lifecycle rule: callers
/// invoke this exactly once, after the last endpoint/peer touch is gone.
pub fn destroy(network_id: &str) -> Result<()> {
    let name = format!("ov-{}", short_id(network_id));
    tracing::debug!(network_id, "destroying sandbox namespace");
    match NetNs::get(&name) {
        Ok(ns) => ns
            .remove()
            .with_context(|| format!("removing namespace for network {}", network_id)),
        Err(_) => {
            // Already gone; destroy is idempotent.
            Ok(())
        }
    }
}

/// Detach-mount and remove a namespace by its already-prefixed mount name
/// (as returned by `list_stale`), rather than by network id. `destroy`
/// re-derives the `ov-<id>` name from a network id; this variant is for
/// callers that already have the mount name and must not double-prefix it.
pub fn destroy_by_ns_name(ns_name: &str) -> Result<()> {
    tracing::debug!(ns_name, "destroying stale sandbox namespace");
    match NetNs::get(ns_name) {
        Ok(ns) => ns.remove().with_context(|| format!("removing namespace {}", ns_name)),
        Err(_) => Ok(()),
    }
}

/// List sandbox namespace names currently mounted under the well-known
/// prefix, for the stale-sandbox sweep (§4.4, §5).
pub fn list_stale(exclude: &[String]) -> Result<Vec<String>> {
    let dir = std::path::Path::new("/var/run/netns");
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut stale = Vec::new();
    for entry in std::fs::read_dir(dir).context("reading /var/run/netns")? {
        let entry = entry.context("reading netns dir entry")?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("ov-") && !exclude.contains(&name) {
            stale.push(name);
        }
    }
    Ok(stale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_path_is_keyed_by_network_id_prefix() {
        assert_eq!(sandbox_path("n1"), "/var/run/netns/ov-n1");
        assert_eq!(
            sandbox_path("a-very-long-network-identifier"),
            "/var/run/netns/ov-a-very-long"
        );
    }
}
