//! Data model and per-network lifecycle (§3, §4.4).
//!
//! A `Network` owns one or more `Subnet`s (one VNI per subnet) and a set of
//! locally joined `Endpoint`s. Sandbox and subnet kernel state are created
//! lazily — on first endpoint or peer touch — and torn down when the join
//! counter reaches zero: one struct owns the pieces a create/destroy pair
//! drives, over a network whose kernel state is created and torn down many
//! times across its life rather than once.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use ipnet::Ipv4Net;

use crate::encryption::EncryptionController;
use crate::error::{DriverError, Result};
use crate::kal;
use crate::kal::firewall::FirewallLock;
use crate::kal::miss::{MissEvent, MissWatcher};
use crate::peerdb::PeerDb;

/// `(subnet_cidr, gateway_addr, vni)` as supplied by `CreateNetwork` (§3).
#[derive(Debug, Clone)]
pub struct SubnetSpec {
    pub cidr: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub vni: u32,
}

/// A subnet's kernel identity: the bridge/VXLAN interface names are derived
/// once, at construction, from `vni` and the network id (§3: `ov-<vni-hex>-
/// <nid[:5]>` / `vx-<vni-hex>-<nid[:5]>`).
#[derive(Debug, Clone)]
pub struct Subnet {
    pub cidr: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub vni: u32,
    pub bridge_name: String,
    pub vxlan_name: String,
    ready: bool,
}

impl Subnet {
    fn new(spec: SubnetSpec, network_id: &str) -> Self {
        let (bridge_name, vxlan_name) = subnet_link_names(spec.vni, network_id);
        Subnet {
            cidr: spec.cidr,
            gateway: spec.gateway,
            vni: spec.vni,
            bridge_name,
            vxlan_name,
            ready: false,
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.cidr.contains(&ip)
    }
}

/// `ov-<vni-hex>-<nid[:5]>` / `vx-<vni-hex>-<nid[:5]>` (§3). `vni` is
/// rendered as a zero-padded 6-hex-digit field, matching §8 scenario S1's
/// literal example (`vni=4097` → `ov-001001-...`).
pub fn subnet_link_names(vni: u32, network_id: &str) -> (String, String) {
    let nid5: String = network_id.chars().take(5).collect();
    (format!("ov-{:06x}-{}", vni, nid5), format!("vx-{:06x}-{}", vni, nid5))
}

/// `(endpoint_id, network_id, ip_prefix, mac, container_ifname)` (§3). The
/// host side of the veth pair keeps a kernel-chosen random name
/// (`host_ifname`); the container side is renamed to `container_ifname`
/// once moved into the container's namespace.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: String,
    pub ip: Ipv4Net,
    pub mac: [u8; 6],
    pub container_ifname: String,
    pub host_ifname: String,
    pub guest_ifname: String,
    pub vni: u32,
}

/// Derive a MAC from an IPv4 address when the caller didn't supply one
/// (§3 "MAC is derived from IP when not supplied"): `02:42` (locally
/// administered, unicast) followed by the four address octets — the same
/// deterministic scheme used throughout the retrieval pack's container
/// networking examples for auto-assigned MACs.
pub fn mac_from_ip(ip: Ipv4Addr) -> [u8; 6] {
    let o = ip.octets();
    [0x02, 0x42, o[0], o[1], o[2], o[3]]
}

/// Base VXLAN/Ethernet overhead subtracted from the network's MTU hint:
/// inner eth(14) + outer IP(20) + outer UDP(8) + vxlan header(8) (§4.4
/// "MaxMTU computation").
const VXLAN_OVERHEAD: u32 = 50;
/// Additional ESP transport-mode overhead for secure networks (§4.4).
const ESP_OVERHEAD: u32 = 26;

/// `base_mtu - 50`, minus an additional 26 for secure networks, rounded
/// down to a multiple of 4 (§4.4 "MaxMTU computation").
pub fn max_mtu(base_mtu: u32, secure: bool) -> u32 {
    let overhead = if secure { VXLAN_OVERHEAD + ESP_OVERHEAD } else { VXLAN_OVERHEAD };
    let mtu = base_mtu.saturating_sub(overhead);
    mtu - (mtu % 4)
}

#[derive(Default)]
struct NetworkState {
    subnets: Vec<Subnet>,
    endpoints: HashMap<String, Endpoint>,
    sandbox_path: Option<PathBuf>,
    /// Endpoints currently joined (distinct from merely registered via
    /// `CreateEndpoint`). Sandbox teardown is gated on this reaching zero
    /// *and* `peer_count` reaching zero (§3: "sandbox namespace exists iff
    /// at least one endpoint is joined or a peer is known").
    join_count: usize,
    /// Ids of the endpoints currently joined, so a later `NodeJoin` can
    /// re-broadcast their `PeerRecord`s once the real advertise address is
    /// learned (§6).
    joined: std::collections::HashSet<String>,
    /// Remote peers known on this network (incremented/decremented by the
    /// driver's `peerAdd`/`peerDelete` dispatch for non-local entries).
    peer_count: usize,
    /// Init-once latch: `Some(Err(..))` once the first sandbox-init attempt
    /// fails is remembered so every concurrent caller observes the same
    /// error rather than retrying independently (§3 "initialisation
    /// latch").
    init_result: Option<std::result::Result<(), String>>,
    /// Per-VNI encryption controller, present only for secure networks and
    /// only once that subnet's sandbox state has been initialised.
    encryption: HashMap<u32, Arc<EncryptionController>>,
    /// WatchMiss (§4.4): one watcher per sandbox, subscribed to neighbor-miss
    /// notifications inside it. Spawned alongside the sandbox namespace,
    /// stopped when the sandbox is torn down.
    miss_watcher: Option<MissWatcher>,
}

/// A logical L2 domain (§3). Endpoint join/leave, lazy sandbox/subnet
/// kernel-state initialisation, and encryption-controller wiring all live
/// here; the top-level dispatch (`CreateNetwork`/`Join`/peer events) lives
/// in `driver::Driver`, which owns a `HashMap<String, Arc<Network>>` behind
/// its own `driver.lock`.
pub struct Network {
    pub id: String,
    pub secure: bool,
    pub mtu: u32,
    peerdb: Arc<PeerDb>,
    state: Mutex<NetworkState>,
}

impl Network {
    pub fn new(id: impl Into<String>, subnet_specs: Vec<SubnetSpec>, secure: bool, mtu: u32, peerdb: Arc<PeerDb>) -> Result<Arc<Self>> {
        let id = id.into();
        if id.is_empty() {
            return Err(DriverError::InvalidArgument("network id must not be empty".into()));
        }
        if subnet_specs.is_empty() {
            return Err(DriverError::InvalidArgument("CreateNetwork requires at least one IPv4 subnet".into()));
        }
        for spec in &subnet_specs {
            if spec.cidr.prefix_len() == 0 {
                return Err(DriverError::InvalidArgument("0.0.0.0/0 is not a valid subnet pool".into()));
            }
        }
        let subnets = subnet_specs.into_iter().map(|s| Subnet::new(s, &id)).collect();
        Ok(Arc::new(Network {
            id,
            secure,
            mtu,
            peerdb,
            state: Mutex::new(NetworkState { subnets, ..Default::default() }),
        }))
    }

    pub fn max_mtu(&self) -> u32 {
        max_mtu(self.mtu, self.secure)
    }

    pub fn subnet_for_ip(&self, ip: Ipv4Addr) -> Option<Subnet> {
        self.state.lock().unwrap().subnets.iter().find(|s| s.contains(ip)).cloned()
    }

    pub fn subnets(&self) -> Vec<Subnet> {
        self.state.lock().unwrap().subnets.clone()
    }

    pub fn vnis(&self) -> Vec<u32> {
        self.state.lock().unwrap().subnets.iter().map(|s| s.vni).collect()
    }

    pub fn join_count(&self) -> usize {
        self.state.lock().unwrap().join_count
    }

    pub fn endpoint(&self, eid: &str) -> Option<Endpoint> {
        self.state.lock().unwrap().endpoints.get(eid).cloned()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state.lock().unwrap().endpoints.values().cloned().collect()
    }

    pub fn has_sandbox(&self) -> bool {
        self.state.lock().unwrap().sandbox_path.is_some()
    }

    /// Lazily create the per-network sandbox namespace, sweeping stale
    /// sandboxes from a prior crashed process first (§4.4 "Lazy sandbox
    /// init"). The init-error latch means a failed first attempt is
    /// remembered and replayed to every later caller rather than retried —
    /// matching §3's "initialisation latch" invariant. Returns the sandbox's
    /// namespace file path; callers that need an actual `NetNs` handle (to
    /// move a link into it, for instance) re-open it via `kal::netns::open`
    /// — `setns`-based KAL operations only ever need the path.
    pub fn ensure_sandbox(&self, global_vni_nspath: &Mutex<HashMap<u32, String>>, live_network_ids: &[String]) -> Result<PathBuf> {
        let mut state = self.state.lock().unwrap();
        if let Some(path) = &state.sandbox_path {
            return Ok(path.clone());
        }
        if let Some(Err(msg)) = &state.init_result {
            return Err(DriverError::from(anyhow::anyhow!("sandbox init previously failed: {}", msg)));
        }
        match self.create_sandbox_locked(&mut state, global_vni_nspath, live_network_ids) {
            Ok(path) => {
                state.sandbox_path = Some(path.clone());
                state.init_result = Some(Ok(()));
                Ok(path)
            }
            Err(err) => {
                state.init_result = Some(Err(err.to_string()));
                Err(err)
            }
        }
    }

    fn create_sandbox_locked(
        &self,
        state: &mut NetworkState,
        global_vni_nspath: &Mutex<HashMap<u32, String>>,
        live_network_ids: &[String],
    ) -> Result<PathBuf> {
        // Exclude every currently-live network's sandbox, not just our own
        // (§4.4): this network's first lazy init must not sweep another
        // network's active sandbox as "stale".
        let exclude: Vec<String> = live_network_ids.iter().map(|nid| format!("ov-{}", short_id(nid))).collect();
        match kal::netns::list_stale(&exclude) {
            Ok(stale) => {
                for name in stale {
                    tracing::warn!(stale_ns = %name, "sweeping stale sandbox namespace before init");
                    if let Err(err) = kal::netns::destroy_by_ns_name(&name) {
                        tracing::warn!(stale_ns = %name, error = %err, "failed to sweep stale sandbox");
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to list stale sandboxes, continuing"),
        }
        {
            let mut map = global_vni_nspath.lock().unwrap();
            let vnis: Vec<u32> = state.subnets.iter().map(|s| s.vni).collect();
            for vni in vnis {
                map.remove(&vni);
            }
        }
        let ns = kal::netns::create(&self.id)?;
        let path = ns.path();
        {
            let mut map = global_vni_nspath.lock().unwrap();
            for subnet in &state.subnets {
                map.insert(subnet.vni, path.to_string_lossy().into_owned());
            }
        }

        // WatchMiss (§4.4): one watcher per sandbox, for the lifetime of the
        // namespace. A spawn failure is non-fatal best-effort convergence —
        // without it, kernel peer entries never auto-resolve from traffic,
        // but explicit peer-event programming still keeps working (§7).
        let nid = self.id.clone();
        let peerdb = self.peerdb.clone();
        let subnets_snapshot = state.subnets.clone();
        match MissWatcher::spawn(
            path.clone(),
            Arc::new(move |event: MissEvent| resolve_and_program_miss(&nid, &peerdb, &subnets_snapshot, event)),
        ) {
            Ok(watcher) => state.miss_watcher = Some(watcher),
            Err(err) => tracing::warn!(nid = %self.id, error = %err, "failed to spawn miss watcher for sandbox"),
        }

        Ok(path)
    }

    /// Lazily materialise one subnet's bridge + VXLAN pair inside the
    /// sandbox (§4.4 "Lazy subnet init"). Idempotent per subnet. On VXLAN
    /// creation failure the bridge that was just created is rolled back
    /// (§4.1 "no partial state is silently tolerated").
    pub fn ensure_subnet_ready(
        &self,
        vni: u32,
        sandbox_path: &std::path::Path,
        firewall: &Arc<FirewallLock>,
        global_mark: u32,
        dst_port: u16,
        local_vtep: Ipv4Addr,
        keys: Vec<crate::external::EncryptionKey>,
    ) -> Result<()> {
        let already_ready = {
            let state = self.state.lock().unwrap();
            state.subnets.iter().find(|s| s.vni == vni).map(|s| s.ready).unwrap_or(false)
        };
        if already_ready {
            return Ok(());
        }

        let subnet = {
            let state = self.state.lock().unwrap();
            state
                .subnets
                .iter()
                .find(|s| s.vni == vni)
                .cloned()
                .ok_or_else(|| DriverError::NotFound(format!("no subnet with vni {}", vni)))?
        };

        let encryption = if self.secure {
            let ctrl = Arc::new(EncryptionController::new(
                local_vtep,
                vni,
                dst_port,
                global_mark,
                keys,
                firewall.clone(),
            ));
            ctrl.install_firewall_rules()?;
            Some(ctrl)
        } else {
            // Not secure: preemptively remove any stale mangle/input rules
            // left over for this VNI (§4.4 "CreateNetwork ... preemptively
            // removes any stale mangle/input rules for each of its VNIs").
            let program = kal::bpf::match_vxlan(vni);
            let bytecode = kal::bpf::render_bytecode(&program);
            if let Err(err) = kal::firewall::remove_vni_rules(firewall, global_mark, &bytecode, dst_port) {
                tracing::warn!(vni, error = %err, "failed to remove stale firewall rules for non-secure vni");
            }
            None
        };

        // The subnet bridge lives inside the sandbox, alongside the VXLAN
        // link it will later be enslaved to (§4.4 "create bridge ... inside
        // the sandbox"), so creation is dispatched onto a thread pinned
        // there rather than run against the root namespace.
        {
            let bridge_name = subnet.bridge_name.clone();
            let gateway = subnet.gateway;
            let prefix_len = subnet.cidr.prefix_len();
            kal::nsthread::run_in_namespace(sandbox_path, move || {
                kal::link::add_bridge(&kal::link::BridgeSpec {
                    name: &bridge_name,
                    gateway: std::net::IpAddr::V4(gateway),
                    prefix_len,
                })
            })
            .map_err(DriverError::from)?;
        }

        let vxlan_mtu = self.max_mtu();
        let vxlan_result = kal::link::add_vxlan(&kal::link::VxlanSpec {
            name: &subnet.vxlan_name,
            vni,
            mtu: vxlan_mtu,
            dst_port,
        });
        if let Err(err) = vxlan_result {
            // Roll back the bridge just created (§4.1 rollback contract).
            if let Err(rollback_err) = kal::link::del_link_in_sandbox(&subnet.bridge_name, sandbox_path) {
                tracing::error!(bridge = %subnet.bridge_name, error = %rollback_err, "failed to roll back bridge after vxlan-add failure");
            }
            return Err(DriverError::from(err));
        }

        kal::link::move_vxlan_into_sandbox(&subnet.vxlan_name, sandbox_path, &subnet.bridge_name)
            .map_err(DriverError::from)?;

        if let Err(err) =
            kal::nsthread::run_in_namespace_with_private_mount(sandbox_path, {
                let bridge_name = subnet.bridge_name.clone();
                move || kal::sysctl::clear_bridge_default_pvid(&bridge_name)
            })
        {
            tracing::warn!(bridge = %subnet.bridge_name, error = %err, "failed to clear bridge default pvid");
        }

        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.subnets.iter_mut().find(|s| s.vni == vni) {
            s.ready = true;
        }
        if let Some(ctrl) = encryption {
            state.encryption.insert(vni, ctrl);
        }
        Ok(())
    }

    pub fn encryption_for(&self, vni: u32) -> Option<Arc<EncryptionController>> {
        self.state.lock().unwrap().encryption.get(&vni).cloned()
    }

    pub fn encryption_controllers(&self) -> Vec<Arc<EncryptionController>> {
        self.state.lock().unwrap().encryption.values().cloned().collect()
    }

    /// Register endpoint metadata at `CreateEndpoint` time, before any
    /// sandbox kernel state exists for it.
    pub fn register_endpoint(&self, endpoint: Endpoint) {
        let mut state = self.state.lock().unwrap();
        state.endpoints.insert(endpoint.id.clone(), endpoint);
    }

    pub fn unregister_endpoint(&self, eid: &str) -> Option<Endpoint> {
        self.state.lock().unwrap().endpoints.remove(eid)
    }

    /// Mark an endpoint as joined, incrementing the sandbox join counter.
    pub fn mark_joined(&self, eid: &str) {
        let mut state = self.state.lock().unwrap();
        state.join_count += 1;
        state.joined.insert(eid.to_string());
    }

    /// Mark an endpoint as left, decrementing the join counter. Returns
    /// whether the sandbox should now be destroyed (`join_count == 0 &&
    /// peer_count == 0`, §3).
    pub fn mark_left(&self, eid: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.join_count > 0 {
            state.join_count -= 1;
        }
        state.joined.remove(eid);
        state.join_count == 0 && state.peer_count == 0
    }

    /// Endpoints currently joined, for re-broadcasting their `PeerRecord`s
    /// once the real advertise address is learned (§6).
    pub fn joined_endpoints(&self) -> Vec<Endpoint> {
        let state = self.state.lock().unwrap();
        state.joined.iter().filter_map(|eid| state.endpoints.get(eid).cloned()).collect()
    }

    /// A non-local peer became known on this network. Returns whether this
    /// is the very first peer (sandbox may need lazy init for peer-only
    /// networks).
    pub fn incr_peer_count(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.peer_count += 1;
        state.peer_count == 1
    }

    /// A non-local peer was forgotten. Returns whether the sandbox should
    /// now be destroyed (§3).
    pub fn decr_peer_count(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.peer_count > 0 {
            state.peer_count -= 1;
        }
        state.join_count == 0 && state.peer_count == 0
    }

    /// Take the sandbox path, clearing it and every subnet's `ready` flag
    /// and dropping all per-VNI encryption controllers. Called once the
    /// join counter reaches zero and the caller is about to actually
    /// destroy the namespace (§3 sandbox lifecycle).
    pub fn take_sandbox_path(&self) -> Option<PathBuf> {
        let mut state = self.state.lock().unwrap();
        for subnet in &mut state.subnets {
            subnet.ready = false;
        }
        state.encryption.clear();
        if let Some(watcher) = state.miss_watcher.take() {
            watcher.stop();
        }
        state.sandbox_path.take()
    }

    pub fn sandbox_path(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().sandbox_path.clone()
    }
}

fn short_id(network_id: &str) -> String {
    network_id.chars().take(12).collect()
}

/// Resolve a `WatchMiss` notification against the peerDB and program the
/// corresponding kernel entry (§4.4 "WatchMiss"). Runs on the watcher's own
/// thread, already `setns`'d into the sandbox, so the `kal::fdb_neigh` calls
/// below operate on the sandbox's link table directly.
fn resolve_and_program_miss(nid: &str, peerdb: &PeerDb, subnets: &[Subnet], event: MissEvent) {
    match event {
        MissEvent::L3 { ifindex, ip } => {
            let Some(vxlan_name) = vxlan_name_for_ifindex(subnets, ifindex) else {
                return;
            };
            let Some((key, _entry)) = peerdb.find_by_ip(nid, IpAddr::V4(ip)) else {
                tracing::debug!(nid, %ip, "miss watcher: no peerDB entry for L3 miss, ignoring");
                return;
            };
            if let Err(err) = kal::fdb_neigh::add_neighbor(&vxlan_name, IpAddr::V4(ip), key.mac) {
                tracing::warn!(nid, %ip, error = %err, "miss watcher: failed to install neighbor entry");
            }
        }
        MissEvent::L2 { ifindex, mac } => {
            let Some(vxlan_name) = vxlan_name_for_ifindex(subnets, ifindex) else {
                return;
            };
            let Some((_key, entry)) = peerdb.find_by_mac(nid, mac) else {
                tracing::debug!(nid, mac = ?mac, "miss watcher: no peerDB entry for L2 miss, ignoring");
                return;
            };
            if entry.is_local() {
                // Nothing to point the bridge FDB at for our own local MAC.
                return;
            }
            if let Err(err) = kal::fdb_neigh::add_fdb(&vxlan_name, entry.vtep, mac) {
                tracing::warn!(nid, mac = ?mac, error = %err, "miss watcher: failed to install fdb entry");
            }
        }
    }
}

/// A miss notification carries only the link's `ifindex`; re-resolve it
/// against the network's known VXLAN link names (there are few subnets per
/// network, so a linear scan is cheap relative to the kernel round trip).
fn vxlan_name_for_ifindex(subnets: &[Subnet], ifindex: u32) -> Option<String> {
    subnets.iter().find_map(|s| match kal::link::host_link_index(&s.vxlan_name) {
        Ok(idx) if idx == ifindex => Some(s.vxlan_name.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_mtu_formula() {
        assert_eq!(max_mtu(1500, false), 1448); // 1450 rounds down to 1448
        assert_eq!(max_mtu(1500, true), 1424); // 1450 - 26 = 1424, already mult of 4
    }

    #[test]
    fn link_names_match_s1_example() {
        let (bridge, vxlan) = subnet_link_names(4097, "n1");
        assert_eq!(bridge, "ov-001001-n1");
        assert_eq!(vxlan, "vx-001001-n1");
    }

    #[test]
    fn mac_derivation_is_deterministic_and_locally_administered() {
        let ip: Ipv4Addr = "10.0.1.5".parse().unwrap();
        let mac = mac_from_ip(ip);
        assert_eq!(mac, [0x02, 0x42, 10, 0, 1, 5]);
    }

    #[test]
    fn create_network_rejects_empty_subnet_list() {
        let err = Network::new("n1", vec![], false, 1500, Arc::new(PeerDb::new())).unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[test]
    fn create_network_rejects_default_route_pool() {
        let spec = SubnetSpec { cidr: "0.0.0.0/0".parse().unwrap(), gateway: "0.0.0.1".parse().unwrap(), vni: 1 };
        let err = Network::new("n1", vec![spec], false, 1500, Arc::new(PeerDb::new())).unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }
}
