use sysctl::Sysctl;

pub(crate) fn ensure_value(name: &str, value: &str) -> anyhow::Result<()> {
    tracing::debug!("setting sysctl {} to {}", name, value);
    let ctl = sysctl::Ctl::new(name)?;
    match ctl.value_string() {
        Ok(v) if v == value => Ok(()),
        _ => {
            ctl.set_value_string(value)?;
            Ok(())
        }
    }
}

// don't forward packets on bridge to iptables.
// https://wiki.libvirt.org/Net.bridge.bridge-nf-call_and_sysctl.conf.html
pub(crate) fn disable_bridge_nf_call_iptables() -> anyhow::Result<()> {
    ensure_value("net.bridge.bridge-nf-call-iptables", "0")
}

pub(crate) fn ipv4_neigh_gc_thresh3(value: u32) -> anyhow::Result<()> {
    ensure_value("net.ipv4.neigh.default.gc_thresh3", &value.to_string())
}

pub(crate) fn enable_ipv4_forwarding() -> anyhow::Result<()> {
    ensure_value("net.ipv4.ip_forward", "1")
}

/// Clear the bridge's default PVID so untagged frames are not auto-tagged
/// into VLAN 1 (§4.4). Requires `/sys` inside the sandbox to be a private
/// mount (the caller re-execs this on a namespace-pinned thread after a
/// `CLONE_NEWNS` + remount, so writing here never leaks to the host's
/// `/sys`).
pub(crate) fn clear_bridge_default_pvid(bridge_name: &str) -> anyhow::Result<()> {
    let path = format!("/sys/class/net/{}/bridge/default_pvid", bridge_name);
    tracing::debug!("clearing default_pvid for {}", bridge_name);
    std::fs::write(&path, b"0\n")
        .map_err(|e| anyhow::anyhow!("writing {}: {}", path, e))
}
