//! Idempotent iptables programming, grounded in the pack's
//! `mheon-netavark` firewall driver (`iptables` crate: `exists`-before-
//! `append`/`insert`/`delete`, dedicated chains). Generalized here for the
//! encryption controller's mangle/filter rules (§4.3) rather than NAT/port
//! forwarding.
//!
//! §4.1's table requires all iptables writes to be serialised fleet-wide
//! per protocol family ("single-slot semaphore per protocol family;
//! concurrent drivers can deadlock the kernel netfilter table otherwise").
//! `FirewallLock` is that semaphore: one mutex per family, held for the
//! duration of a rule-programming call.

use std::sync::Mutex;

use anyhow::{Context, Result};
use iptables::IPTables;

pub const MANGLE: &str = "mangle";
pub const FILTER: &str = "filter";
pub const OUTPUT: &str = "OUTPUT";
pub const INPUT: &str = "INPUT";

/// The driver-wide firewall serialisation point (§4.1, §5 "firewall lock").
/// A single-slot mutex stands in for a counted semaphore since this driver
/// only ever needs one writer at a time per family, never a counted pool.
pub struct FirewallLock {
    ipv4: Mutex<()>,
}

impl FirewallLock {
    pub fn new() -> Self {
        FirewallLock { ipv4: Mutex::new(()) }
    }

    /// Run `f` with the per-family lock held. IPv6 is out of scope (§1), so
    /// there is only one family slot; a second slot would be added here if
    /// that non-goal were ever lifted.
    pub fn with_lock<R>(&self, f: impl FnOnce(&IPTables) -> Result<R>) -> Result<R> {
        let _guard = self.ipv4.lock().unwrap_or_else(|p| p.into_inner());
        let conn = iptables::new(false).map_err(|e| anyhow::anyhow!("opening iptables connection: {}", e))?;
        f(&conn)
    }
}

impl Default for FirewallLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Append `rule` to `table`/`chain` unless it is already present. Mirrors
/// `mheon-netavark`'s `append_unique`.
pub fn append_unique(conn: &IPTables, table: &str, chain: &str, rule: &str) -> Result<()> {
    let exists = conn
        .exists(table, chain, rule)
        .map_err(|e| anyhow::anyhow!("checking rule existence: {}", e))?;
    if exists {
        tracing::debug!(table, chain, rule, "firewall rule already present");
        return Ok(());
    }
    conn.append(table, chain, rule)
        .map(|_| tracing::debug!(table, chain, rule, "firewall rule appended"))
        .map_err(|e| anyhow::anyhow!("appending rule: {}", e))
}

/// Insert `rule` at `position` (1-based) unless already present. Used for
/// the secure-network input-drop rule, which must land at the *top* of
/// INPUT (§4.3, §9 Open Questions) ahead of any administrator ACCEPT.
pub fn insert_unique(conn: &IPTables, table: &str, chain: &str, rule: &str, position: i32) -> Result<()> {
    let exists = conn
        .exists(table, chain, rule)
        .map_err(|e| anyhow::anyhow!("checking rule existence: {}", e))?;
    if exists {
        tracing::debug!(table, chain, rule, "firewall rule already present");
        return Ok(());
    }
    conn.insert(table, chain, rule, position)
        .map(|_| tracing::debug!(table, chain, rule, position, "firewall rule inserted"))
        .map_err(|e| anyhow::anyhow!("inserting rule: {}", e))
}

/// Remove `rule` from `table`/`chain` if present; a no-op otherwise (§7:
/// transient "not exist" kernel errors are absorbed via pre-check).
pub fn remove_if_exists(conn: &IPTables, table: &str, chain: &str, rule: &str) -> Result<()> {
    let exists = conn
        .exists(table, chain, rule)
        .map_err(|e| anyhow::anyhow!("checking rule existence: {}", e))?;
    if !exists {
        return Ok(());
    }
    conn.delete(table, chain, rule)
        .map(|_| tracing::debug!(table, chain, rule, "firewall rule removed"))
        .map_err(|e| anyhow::anyhow!("removing rule: {}", e))
}

/// Mangle-OUTPUT rule marking outgoing traffic for this VNI with the global
/// XFRM mark, matched via the compiled BPF program (§4.3).
pub fn mark_rule(global_mark: u32, bpf_bytecode: &str, dst_port: u16) -> String {
    format!(
        "-p udp --dport {} -m bpf --bytecode \"{}\" -j MARK --set-mark {:#x}",
        dst_port, bpf_bytecode, global_mark
    )
}

/// Top-of-INPUT rule dropping cleartext VXLAN datagrams for this VNI (§4.3,
/// §9: deliberately bypasses any administrator unconditional ACCEPT).
pub fn drop_cleartext_rule(bpf_bytecode: &str, dst_port: u16) -> String {
    format!("-p udp --dport {} -m bpf --bytecode \"{}\" -j DROP", dst_port, bpf_bytecode)
}

pub fn install_vni_rules(lock: &FirewallLock, global_mark: u32, bpf_bytecode: &str, dst_port: u16) -> Result<()> {
    lock.with_lock(|conn| {
        append_unique(conn, MANGLE, OUTPUT, &mark_rule(global_mark, bpf_bytecode, dst_port))
            .context("installing mangle mark rule")?;
        insert_unique(conn, FILTER, INPUT, &drop_cleartext_rule(bpf_bytecode, dst_port), 1)
            .context("installing input drop rule")?;
        Ok(())
    })
}

pub fn remove_vni_rules(lock: &FirewallLock, global_mark: u32, bpf_bytecode: &str, dst_port: u16) -> Result<()> {
    lock.with_lock(|conn| {
        remove_if_exists(conn, MANGLE, OUTPUT, &mark_rule(global_mark, bpf_bytecode, dst_port))
            .context("removing mangle mark rule")?;
        remove_if_exists(conn, FILTER, INPUT, &drop_cleartext_rule(bpf_bytecode, dst_port))
            .context("removing input drop rule")?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_rule_embeds_mark_and_bytecode() {
        let rule = mark_rule(0xD0C4E3, "5,40 0 0 8,116 0 0 8,...", 4789);
        assert!(rule.contains("0xd0c4e3"));
        assert!(rule.contains("--dport 4789"));
    }

    #[test]
    fn drop_rule_targets_input_chain_semantics() {
        let rule = drop_cleartext_rule("5,...", 4789);
        assert!(rule.ends_with("-j DROP"));
    }
}
