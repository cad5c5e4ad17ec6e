//! Event Handler / Join-Leave (§4.5). The top-level driver: dispatches
//! `CreateNetwork`/`CreateEndpoint`/`Join`/`Leave`/`DeleteEndpoint`/
//! `DeleteNetwork` and the discovery callbacks `peerAdd`/`peerDelete`/
//! `NodeJoin`/`KeyUpdate`/`EventNotify`, wiring the Network Lifecycle
//! Manager, PeerDB, and Encryption Controller together under the locking
//! discipline in §5.
//!
//! One struct owns the moving pieces, built through a builder-style
//! `Config`, and dispatches as a long-lived event handler rather than a
//! one-shot operation.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use ipnet::IpNet;

use crate::error::{DriverError, Result};
use crate::external::{
    EncryptionKey, EncryptionKeysConfig, EncryptionKeysUpdate, NodeJoinEvent, PeerRecord, PeerTableEvent,
    TableEventType, TableLayer,
};
use crate::kal;
use crate::kal::firewall::FirewallLock;
use crate::kv::{self, NetworkRecord, Store, SubnetRecord};
use crate::network::{mac_from_ip, subnet_link_names, Endpoint, Network, SubnetSpec};
use crate::peerdb::{PeerDb, INVALID_VTEP};
use crate::sweep::{Sweeper, SweepTarget};
use crate::vni::IdAllocator;

/// UDP destination port VXLAN datagrams use, overridable process-wide
/// (§6 "On-the-wire formats").
pub const DEFAULT_VXLAN_PORT: u16 = 4789;

/// Construction-time configuration for a `Driver`, built via `with_*`
/// methods.
pub struct Config {
    pub store: Arc<dyn Store>,
    pub table_layer: Arc<dyn TableLayer>,
    pub global_mark: u32,
    pub vxlan_port: u16,
}

impl Config {
    pub fn new(store: Arc<dyn Store>, table_layer: Arc<dyn TableLayer>) -> Self {
        Config { store, table_layer, global_mark: 0xD0C4E3, vxlan_port: DEFAULT_VXLAN_PORT }
    }

    pub fn with_global_mark(mut self, mark: u32) -> Self {
        self.global_mark = mark;
        self
    }

    pub fn with_vxlan_port(mut self, port: u16) -> Self {
        self.vxlan_port = port;
        self
    }
}

/// Options accepted by `CreateNetwork` (§6: "option-map (must include VNI
/// list, optional secure flag, optional MTU)").
pub struct CreateNetworkOptions {
    pub subnets: Vec<SubnetSpec>,
    pub secure: bool,
    pub mtu: Option<u32>,
}

/// The join-info-sink `Join` hands back to the caller (§6): enough for the
/// caller to finish wiring up the container side — the interface it should
/// expect to find already renamed and address it, and the gateway to
/// install a default route through.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub interface_name: String,
    pub gateway: Ipv4Addr,
}

const DEFAULT_BASE_MTU: u32 = 1500;

/// The top-level driver object (§4.5). One instance per host; owns every
/// `Network` behind `driver.lock`, the process-wide `vni → nspath` map
/// (§9 "Global mutable state" — modelled as an owned field of this single
/// instance rather than a true process-wide static, a deliberate
/// simplification documented in DESIGN.md), and the cross-network
/// encryption key list delivered by the key-distribution channel.
pub struct Driver {
    store: Arc<dyn Store>,
    table_layer: Arc<dyn TableLayer>,
    firewall: Arc<FirewallLock>,
    global_mark: u32,
    vxlan_port: u16,

    // driver.lock
    networks: Mutex<HashMap<String, Arc<Network>>>,
    vni_allocator: IdAllocator,
    global_vni_nspath: Mutex<HashMap<u32, String>>,

    peerdb: Arc<PeerDb>,
    // peerOpMu (§5): driver-wide, serialises add/delete on the same key so
    // the peerDB's transient-duplicate policy is correct end to end.
    peer_op_mu: Mutex<()>,
    // "per-driver node map" (§4.5 "Encryption triggers"): number of
    // still-known local+remote PeerEntries per (network_id, vtep), so the
    // encryption controller is triggered exactly once on first-seen and
    // exactly once on last-gone.
    secure_peer_refcount: Mutex<HashMap<(String, Ipv4Addr), usize>>,

    advertise_address: Mutex<Option<Ipv4Addr>>,
    bind_address: Mutex<Option<IpAddr>>,
    encryption_keys: Mutex<Vec<EncryptionKey>>,

    // Periodic GC sweep (§5): started explicitly via `start_periodic_sweep`
    // once the driver is behind an `Arc`, stopped on `stop_periodic_sweep`
    // or implicitly on drop.
    sweeper: Mutex<Option<Sweeper>>,
}

/// Feeds the periodic sweeper the set of network ids currently alive, via a
/// weak reference so the sweeper's background thread never keeps the
/// `Driver` itself alive.
struct DriverSweepTarget(std::sync::Weak<Driver>);

impl SweepTarget for DriverSweepTarget {
    fn live_network_ids(&self) -> Vec<String> {
        match self.0.upgrade() {
            Some(driver) => driver.live_network_ids(),
            None => Vec::new(),
        }
    }
}

impl Driver {
    fn live_network_ids(&self) -> Vec<String> {
        self.networks.lock().unwrap().keys().cloned().collect()
    }

    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Driver {
            store: config.store,
            table_layer: config.table_layer,
            firewall: Arc::new(FirewallLock::new()),
            global_mark: config.global_mark,
            vxlan_port: config.vxlan_port,
            networks: Mutex::new(HashMap::new()),
            vni_allocator: IdAllocator::new(),
            global_vni_nspath: Mutex::new(HashMap::new()),
            peerdb: Arc::new(PeerDb::new()),
            peer_op_mu: Mutex::new(()),
            secure_peer_refcount: Mutex::new(HashMap::new()),
            advertise_address: Mutex::new(None),
            bind_address: Mutex::new(None),
            encryption_keys: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
        })
    }

    /// Start the periodic stale-sandbox sweep (default interval 60s, §5).
    /// Idempotent: calling it again replaces and stops the previous
    /// sweeper.
    pub fn start_periodic_sweep(self: &Arc<Self>) {
        let target = DriverSweepTarget(Arc::downgrade(self));
        let sweeper = Sweeper::spawn_default(target);
        let previous = self.sweeper.lock().unwrap().replace(sweeper);
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    /// Stop the periodic sweep, if running. Safe to call even if it was
    /// never started.
    pub fn stop_periodic_sweep(&self) {
        if let Some(sweeper) = self.sweeper.lock().unwrap().take() {
            sweeper.stop();
        }
    }

    /// Apply the host-wide sysctl knobs a driver instance needs regardless
    /// of which networks exist yet (§4.4: bridge-netfilter bypass, neighbor
    /// GC headroom, IPv4 forwarding).
    pub fn apply_global_sysctls(&self, neigh_gc_thresh3: u32) {
        if let Err(err) = kal::sysctl::disable_bridge_nf_call_iptables() {
            tracing::warn!(error = %err, "failed to disable bridge-nf-call-iptables");
        }
        if let Err(err) = kal::sysctl::ipv4_neigh_gc_thresh3(neigh_gc_thresh3) {
            tracing::warn!(error = %err, "failed to raise neigh.gc_thresh3");
        }
        if let Err(err) = kal::sysctl::enable_ipv4_forwarding() {
            tracing::warn!(error = %err, "failed to enable ipv4 forwarding");
        }
    }

    fn network(&self, nid: &str) -> Result<Arc<Network>> {
        self.networks
            .lock()
            .unwrap()
            .get(nid)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("no such network {}", nid)))
    }

    fn local_vtep(&self) -> Ipv4Addr {
        self.advertise_address.lock().unwrap().unwrap_or(INVALID_VTEP)
    }

    // ---- §4.4 CreateNetwork / DeleteNetwork -------------------------------

    /// `CreateNetwork(nid, options)` (§6, §4.4). Requires at least one IPv4
    /// subnet and a pre-allocated VNI per subnet (rejected by
    /// `Network::new`/`SubnetSpec` validation otherwise). Reserves the
    /// supplied VNIs, persists the allocation record, subscribes to the
    /// peer-event table, and — for non-secure networks — preemptively
    /// clears any stale firewall rules left by a previous process for each
    /// VNI.
    pub fn create_network(self: &Arc<Self>, nid: &str, options: CreateNetworkOptions) -> Result<()> {
        {
            let networks = self.networks.lock().unwrap();
            if networks.contains_key(nid) {
                return Err(DriverError::InvalidArgument(format!("network {} already exists", nid)));
            }
        }

        for spec in &options.subnets {
            self.vni_allocator.reserve(spec.vni)?;
        }

        let mtu = options.mtu.unwrap_or(DEFAULT_BASE_MTU);
        let network = match Network::new(nid, options.subnets.clone(), options.secure, mtu, self.peerdb.clone()) {
            Ok(n) => n,
            Err(err) => {
                for spec in &options.subnets {
                    self.vni_allocator.release(spec.vni);
                }
                return Err(err);
            }
        };

        let record = NetworkRecord {
            subnets: options
                .subnets
                .iter()
                .map(|s| SubnetRecord { subnet_ip: s.cidr.to_string(), gw_ip: s.gateway.to_string(), vni: s.vni })
                .collect(),
            secure: options.secure,
            mtu,
        };
        kv::cas_update(self.store.as_ref(), &kv::record_key(nid), |_existing: Option<NetworkRecord>| Ok(record.clone()))?;

        if !options.secure {
            for spec in &options.subnets {
                let program = kal::bpf::match_vxlan(spec.vni);
                let bytecode = kal::bpf::render_bytecode(&program);
                if let Err(err) = kal::firewall::remove_vni_rules(&self.firewall, self.global_mark, &bytecode, self.vxlan_port) {
                    tracing::warn!(nid, vni = spec.vni, error = %err, "failed to clear stale firewall rules on create");
                }
            }
        }

        self.networks.lock().unwrap().insert(nid.to_string(), network);

        let nid_owned = nid.to_string();
        let this = Arc::clone(self);
        self.table_layer.subscribe(
            nid,
            Arc::new(move |event: PeerTableEvent| {
                this.handle_peer_event(&nid_owned, event);
            }),
        );

        Ok(())
    }

    /// `DeleteNetwork(nid)` (§4.4, §5). The driver lock is released before
    /// flushing the peerDB, exactly as §5 requires ("never hold
    /// `driver.lock` across a peerDB write").
    pub fn delete_network(&self, nid: &str) -> Result<()> {
        let network = {
            let mut networks = self.networks.lock().unwrap();
            networks.remove(nid).ok_or_else(|| DriverError::NotFound(format!("no such network {}", nid)))?
        };

        self.table_layer.unsubscribe(nid);

        // Endpoint host-side veths live inside the sandbox namespace
        // alongside the subnet bridge; destroying the sandbox below tears
        // them down with it, so there is nothing to remove individually
        // here.

        for ctrl in network.encryption_controllers() {
            if let Err(err) = ctrl.remove_firewall_rules() {
                tracing::warn!(nid, error = %err, "failed to remove secure-network firewall rules on delete");
            }
        }

        if let Some(path) = network.take_sandbox_path() {
            if let Err(err) = kal::netns::destroy(nid) {
                tracing::warn!(nid, path = %path.display(), error = %err, "failed to destroy sandbox on network delete");
            }
        }

        for vni in network.vnis() {
            self.vni_allocator.release(vni);
            self.global_vni_nspath.lock().unwrap().remove(&vni);
        }

        if let Err(err) = self.store.delete(&kv::record_key(nid)) {
            tracing::warn!(nid, error = %err, "failed to delete persisted network record");
        }

        // Released above already; flush happens without driver.lock held.
        self.peerdb.flush(nid);
        Ok(())
    }

    // ---- §4.5 CreateEndpoint / Join / Leave / DeleteEndpoint --------------

    /// `CreateEndpoint(nid, eid, ip, mac?)` (§6). Registers endpoint
    /// metadata; returns the MAC (generated from the IP when not supplied).
    /// Does not touch kernel state — that happens at `Join`.
    pub fn create_endpoint(&self, nid: &str, eid: &str, ip: IpNet, mac: Option<[u8; 6]>) -> Result<[u8; 6]> {
        let network = self.network(nid)?;
        let IpAddr::V4(ipv4) = ip.addr() else {
            return Err(DriverError::InvalidArgument("overlay driver is IPv4-only".into()));
        };
        let subnet = network
            .subnet_for_ip(ipv4)
            .ok_or_else(|| DriverError::InvalidArgument(format!("{} is not within any subnet of {}", ip, nid)))?;
        let resolved_mac = mac.unwrap_or_else(|| mac_from_ip(ipv4));
        let (bridge_name, _) = subnet_link_names(subnet.vni, nid);
        let container_ifname = format!("eth-{}", &eid[..eid.len().min(8)]);
        let endpoint = Endpoint {
            id: eid.to_string(),
            ip,
            mac: resolved_mac,
            container_ifname,
            host_ifname: format!("veth-{}", &eid[..eid.len().min(8)]),
            guest_ifname: format!("veth-{}-p", &eid[..eid.len().min(8)]),
            vni: subnet.vni,
        };
        let _ = bridge_name;
        network.register_endpoint(endpoint);
        Ok(resolved_mac)
    }

    /// `Join(nid, eid, sandbox-key, join-info-sink)` (§4.5 "Endpoint join").
    /// Rejects if the network is secure and no encryption keys are
    /// configured yet. Materialises the sandbox/subnet kernel state lazily,
    /// creates the veth pair (host side attached to the subnet bridge with
    /// MTU = `maxMTU`, guest side created directly inside `sandbox_key` —
    /// the caller's own container namespace — then renamed to the
    /// endpoint's `container_ifname` with its MAC applied), adds static
    /// routes to every other subnet in the network, and finally registers
    /// the local `PeerEntry` and broadcasts it. Returns the join-info-sink
    /// the caller needs to finish wiring up the container (interface name,
    /// gateway).
    pub fn join(&self, nid: &str, eid: &str, sandbox_key: &std::path::Path) -> Result<JoinInfo> {
        let network = self.network(nid)?;
        if network.secure && self.encryption_keys.lock().unwrap().is_empty() {
            return Err(DriverError::Forbidden(format!("network {} is secure but no encryption keys are configured", nid)));
        }

        let endpoint = network.endpoint(eid).ok_or_else(|| DriverError::NotFound(format!("no such endpoint {}", eid)))?;

        let sandbox_path = network.ensure_sandbox(&self.global_vni_nspath, &self.live_network_ids())?;
        let keys = self.encryption_keys.lock().unwrap().clone();
        network.ensure_subnet_ready(
            endpoint.vni,
            &sandbox_path,
            &self.firewall,
            self.global_mark,
            self.vxlan_port,
            self.local_vtep(),
            keys,
        )?;

        let subnet = network
            .subnets()
            .into_iter()
            .find(|s| s.vni == endpoint.vni)
            .ok_or_else(|| DriverError::NotFound(format!("subnet for vni {} vanished", endpoint.vni)))?;
        let bridge_index = kal::link::host_link_index(&subnet.bridge_name);
        let bridge_index = match bridge_index {
            Ok(idx) => idx,
            Err(_) => {
                // Bridge lives inside the sandbox, not the root namespace;
                // look it up there instead.
                self.bridge_index_in_sandbox(&sandbox_path, &subnet.bridge_name)?
            }
        };

        kal::link::add_veth_pair(&endpoint.host_ifname, &endpoint.guest_ifname, &sandbox_path, sandbox_key, bridge_index)
            .map_err(DriverError::from)?;
        kal::link::finalize_guest_side(sandbox_key, &endpoint.guest_ifname, &endpoint.container_ifname, endpoint.mac)
            .map_err(DriverError::from)?;

        for other in network.subnets() {
            if other.vni == subnet.vni {
                continue;
            }
            if let Err(err) = kal::fdb_neigh::add_route(&other.cidr.into(), subnet.gateway) {
                tracing::warn!(nid, eid, error = %err, "failed to add inter-subnet route");
            }
        }

        network.mark_joined(eid);

        let outcome = self.peerdb.add(nid, eid, endpoint.ip.addr(), endpoint.mac, INVALID_VTEP, endpoint.ip.prefix_len());
        if outcome.cardinality != 1 {
            tracing::warn!(nid, eid, "local endpoint joined onto an (ip, mac) key that already has entries");
        }

        let record = PeerRecord::new(endpoint.ip.to_string(), crate::external::format_mac(endpoint.mac), self.local_vtep().to_string());
        self.table_layer.broadcast(nid, eid, record)?;

        Ok(JoinInfo { interface_name: endpoint.container_ifname.clone(), gateway: subnet.gateway })
    }

    fn bridge_index_in_sandbox(&self, sandbox_path: &std::path::Path, bridge_name: &str) -> Result<u32> {
        let bridge_name = bridge_name.to_string();
        kal::nsthread::run_in_namespace(sandbox_path, move || kal::link::host_link_index(&bridge_name)).map_err(DriverError::from)
    }

    /// `Leave(nid, eid)` (§4.5 "Endpoint leave"): inverse of `Join`.
    /// `peerDelete` with the invalid VTEP, decrement the sandbox join
    /// count, and destroy the sandbox when it (and the peer count) reaches
    /// zero.
    pub fn leave(&self, nid: &str, eid: &str) -> Result<()> {
        let network = self.network(nid)?;
        let endpoint = network.endpoint(eid).ok_or_else(|| DriverError::NotFound(format!("no such endpoint {}", eid)))?;

        let _guard = self.peer_op_mu.lock().unwrap();
        self.peerdb.del(nid, eid, endpoint.ip.addr(), endpoint.mac, INVALID_VTEP, endpoint.ip.prefix_len());
        drop(_guard);

        if let Some(sandbox_path) = network.sandbox_path() {
            if let Err(err) = kal::link::del_link_in_sandbox(&endpoint.host_ifname, &sandbox_path) {
                tracing::warn!(nid, eid, error = %err, "failed to remove host-side veth on leave");
            }
        }

        let should_destroy = network.mark_left(eid);
        if should_destroy {
            if let Some(_path) = network.take_sandbox_path() {
                if let Err(err) = kal::netns::destroy(nid) {
                    tracing::warn!(nid, error = %err, "failed to destroy sandbox on last leave");
                }
            }
        }
        Ok(())
    }

    /// `DeleteEndpoint(nid, eid)` (§6). Unregisters endpoint metadata;
    /// `Leave` must have already been called if the endpoint was joined.
    pub fn delete_endpoint(&self, nid: &str, eid: &str) -> Result<()> {
        let network = self.network(nid)?;
        network
            .unregister_endpoint(eid)
            .ok_or_else(|| DriverError::NotFound(format!("no such endpoint {}", eid)))?;
        Ok(())
    }

    // ---- §6 discovery callbacks -------------------------------------------

    /// `NodeJoin{address, bind_address, self}` (§6): sets the local
    /// advertise/bind address. This driver's PeerDB stores local peers with
    /// the fixed invalid-VTEP sentinel rather than a real address (§3:
    /// "local ⇔ vtep invalid"), so there is no local row to patch — but any
    /// `PeerRecord` already broadcast to remote nodes by a `join()` that ran
    /// before this call carries whatever `local_vtep()` resolved to at the
    /// time (`0.0.0.0` if unset). Re-broadcast a corrected record for every
    /// endpoint already joined on every network so remote peers converge on
    /// the real address.
    pub fn node_join(&self, event: NodeJoinEvent) {
        if !event.is_self {
            return;
        }
        if let IpAddr::V4(v4) = event.address {
            *self.advertise_address.lock().unwrap() = Some(v4);
        }
        *self.bind_address.lock().unwrap() = Some(event.bind_address);

        let vtep = self.local_vtep();
        let networks: Vec<Arc<Network>> = self.networks.lock().unwrap().values().cloned().collect();
        for network in networks {
            for endpoint in network.joined_endpoints() {
                let record = PeerRecord::new(endpoint.ip.to_string(), crate::external::format_mac(endpoint.mac), vtep.to_string());
                if let Err(err) = self.table_layer.broadcast(&network.id, &endpoint.id, record) {
                    tracing::warn!(nid = %network.id, eid = %endpoint.id, error = %err, "failed to re-broadcast peer record after node_join");
                }
            }
        }
    }

    /// `EncryptionKeysConfig{keys}` (§6): initialise the key list.
    pub fn configure_encryption_keys(&self, config: EncryptionKeysConfig) {
        *self.encryption_keys.lock().unwrap() = config.keys;
    }

    /// `EncryptionKeysUpdate{new?, primary?, prune?}` (§6, §4.3 "Key
    /// rotation"): rotate the driver-wide key list and propagate to every
    /// secure network's encryption controller.
    pub fn update_encryption_keys(&self, update: EncryptionKeysUpdate) {
        {
            let mut keys = self.encryption_keys.lock().unwrap();
            if let Some(key) = update.new_key.clone() {
                if !keys.iter().any(|k| k.tag == key.tag) {
                    keys.push(key);
                }
            }
            if let Some(primary_tag) = update.primary_tag {
                if let Some(pos) = keys.iter().position(|k| k.tag == primary_tag) {
                    let key = keys.remove(pos);
                    keys.insert(0, key);
                }
            }
            if let Some(prune_tag) = update.prune_tag {
                keys.retain(|k| k.tag != prune_tag);
            }
        }

        let networks: Vec<Arc<Network>> = self.networks.lock().unwrap().values().cloned().collect();
        for network in networks {
            for ctrl in network.encryption_controllers() {
                ctrl.update_keys(update.new_key.clone(), update.primary_tag, update.prune_tag);
            }
        }
    }

    /// `EventNotify(etype, nid, table, key, value)` (§6): dispatches an
    /// incoming table event to `peerAdd`/`peerDelete`. `table` must be
    /// `"overlay_peer_table"`; anything else is ignored (§1 "only the
    /// narrow interface ... is specified").
    pub fn event_notify(&self, event: PeerTableEvent) {
        self.handle_peer_event(&event.network_id.clone(), event);
    }

    /// Shared implementation for both the direct `EventNotify` entry point
    /// and the subscription callback registered in `create_network`.
    fn handle_peer_event(&self, nid: &str, event: PeerTableEvent) {
        let network = match self.network(nid) {
            Ok(n) => n,
            Err(_) => return,
        };

        let vtep = match event.record.vtep() {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(nid, error = %err, "dropping peer event with unparseable PeerRecord");
                return;
            }
        };
        if vtep == self.local_vtep() {
            // We are the origin of this broadcast; ignore (§4.5 "Remote
            // peer event").
            return;
        }
        let ip_prefix = match event.record.ip_prefix() {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(nid, error = %err, "dropping peer event with unparseable endpoint_ip");
                return;
            }
        };
        let mac = match event.record.mac() {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(nid, error = %err, "dropping peer event with unparseable endpoint_mac");
                return;
            }
        };
        let IpAddr::V4(ipv4) = ip_prefix.addr() else {
            tracing::warn!(nid, "dropping peer event with non-IPv4 endpoint_ip");
            return;
        };

        // peerOpMu: driver-wide, serialises add/delete so PeerDB's
        // transient-duplicate policy is correct end to end (§4.5, §5).
        let _guard = self.peer_op_mu.lock().unwrap();

        match event.event_type {
            TableEventType::Add => {
                let outcome = self.peerdb.add(nid, &event.endpoint_id, ip_prefix.addr(), mac, vtep, ip_prefix.prefix_len());
                if outcome.changed {
                    network.incr_peer_count();
                }
                if outcome.cardinality == 1 {
                    // First-known touch of this network from either a peer
                    // or a local endpoint lazily materialises the sandbox
                    // (and this peer's subnet) per §3/§4.4; a join() on this
                    // node may have already done so, in which case this is a
                    // no-op.
                    if let Err(err) = self.ensure_kernel_ready_for_peer(&network, ip_prefix.addr()) {
                        tracing::warn!(nid, error = %err, "failed to lazily init sandbox/subnet for remote peer event");
                    }
                    self.program_kernel_peer(&network, ip_prefix.addr(), mac, vtep, ip_prefix.prefix_len());
                }
                if outcome.changed {
                    self.on_secure_peer_seen(&network, nid, vtep);
                }
            }
            TableEventType::Delete => {
                let outcome = self.peerdb.del(nid, &event.endpoint_id, ip_prefix.addr(), mac, vtep, ip_prefix.prefix_len());
                if outcome.changed {
                    if outcome.cardinality > 0 {
                        if let Some(head) = self.peerdb.head(nid, ip_prefix.addr(), mac) {
                            self.program_kernel_peer(&network, ip_prefix.addr(), mac, head.vtep, head.prefix_bits);
                        }
                    } else {
                        self.remove_kernel_peer(&network, ip_prefix.addr(), mac);
                    }
                    let should_destroy = network.decr_peer_count();
                    if should_destroy {
                        if let Some(_path) = network.take_sandbox_path() {
                            if let Err(err) = kal::netns::destroy(nid) {
                                tracing::warn!(nid, error = %err, "failed to destroy sandbox after last peer left");
                            }
                        }
                    }
                    self.on_secure_peer_gone(&network, nid, vtep);
                }
            }
        }
        let _ = ipv4;
    }

    /// Lazily materialise the sandbox and the peer's subnet for a remote
    /// peer event arriving before any local endpoint has joined this
    /// network (§3 "sandbox namespace exists iff at least one endpoint is
    /// joined or a peer is known for the network").
    fn ensure_kernel_ready_for_peer(&self, network: &Arc<Network>, ip: IpAddr) -> Result<()> {
        let IpAddr::V4(ipv4) = ip else {
            return Ok(());
        };
        let subnet = network
            .subnet_for_ip(ipv4)
            .ok_or_else(|| DriverError::NotFound(format!("{} is not within any subnet of {}", ip, network.id)))?;
        let sandbox_path = network.ensure_sandbox(&self.global_vni_nspath, &self.live_network_ids())?;
        let keys = self.encryption_keys.lock().unwrap().clone();
        network.ensure_subnet_ready(subnet.vni, &sandbox_path, &self.firewall, self.global_mark, self.vxlan_port, self.local_vtep(), keys)?;
        Ok(())
    }

    /// Install the FDB + neighbor entries for the current head of a
    /// `(ip, mac)` key (§3 invariant: "the sandbox has a neighbor entry
    /// ... and the bridge has an FDB entry ... on the matching subnet's
    /// VXLAN link").
    fn program_kernel_peer(&self, network: &Network, ip: IpAddr, mac: [u8; 6], vtep: Ipv4Addr, prefix_bits: u8) {
        let IpAddr::V4(ipv4) = ip else { return };
        let Some(subnet) = network.subnet_for_ip(ipv4) else {
            tracing::warn!(nid = %network.id, %ip, "peer ip is not within any known subnet, skipping kernel programming");
            return;
        };
        let Some(sandbox_path) = network.sandbox_path() else {
            // Sandbox not yet materialised; WatchMiss/next peer event will
            // retry once an endpoint joins and creates it (§4.4 data-plane
            // convergence is self-healing).
            return;
        };
        let vxlan_name = subnet.vxlan_name.clone();
        let result = kal::nsthread::run_in_namespace(&sandbox_path, move || {
            kal::fdb_neigh::add_neighbor(&vxlan_name, ip, mac)?;
            kal::fdb_neigh::add_fdb(&vxlan_name, vtep, mac)?;
            Ok(())
        });
        if let Err(err) = result {
            tracing::warn!(nid = %network.id, %ip, error = %err, "failed to program kernel peer entries, will retry on next miss/event");
        }
        let _ = prefix_bits;
    }

    fn remove_kernel_peer(&self, network: &Network, ip: IpAddr, mac: [u8; 6]) {
        let IpAddr::V4(ipv4) = ip else { return };
        let Some(subnet) = network.subnet_for_ip(ipv4) else { return };
        let Some(sandbox_path) = network.sandbox_path() else { return };
        let vxlan_name = subnet.vxlan_name.clone();
        let result = kal::nsthread::run_in_namespace(&sandbox_path, move || {
            kal::fdb_neigh::del_neighbor(&vxlan_name, ip)?;
            kal::fdb_neigh::del_fdb(&vxlan_name, mac)?;
            Ok(())
        });
        if let Err(err) = result {
            tracing::warn!(nid = %network.id, %ip, error = %err, "failed to remove kernel peer entries");
        }
    }

    /// `peerAdd` with a valid VTEP on a secure network installs SAs/SP for
    /// that peer exactly once, tracked via the refcount map (§4.5
    /// "Encryption triggers").
    fn on_secure_peer_seen(&self, network: &Network, nid: &str, vtep: Ipv4Addr) {
        if !network.secure {
            return;
        }
        let first = {
            let mut counts = self.secure_peer_refcount.lock().unwrap();
            let entry = counts.entry((nid.to_string(), vtep)).or_insert(0);
            *entry += 1;
            *entry == 1
        };
        if first {
            for ctrl in network.encryption_controllers() {
                ctrl.peer_joined(vtep);
            }
        }
    }

    /// `peerDelete` calls the encryption controller's inverse only when the
    /// last peer for that VTEP is removed (§4.5).
    fn on_secure_peer_gone(&self, network: &Network, nid: &str, vtep: Ipv4Addr) {
        if !network.secure {
            return;
        }
        let last = {
            let mut counts = self.secure_peer_refcount.lock().unwrap();
            match counts.get_mut(&(nid.to_string(), vtep)) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    counts.remove(&(nid.to_string(), vtep));
                    true
                }
                None => false,
            }
        };
        if last {
            for ctrl in network.encryption_controllers() {
                ctrl.peer_left(vtep);
            }
        }
    }

    /// `DecodeTableEntry(table, key, value)` (§6).
    pub fn decode_table_entry(&self, table: &str, key: &str, value: &[u8]) -> Result<(String, HashMap<String, String>)> {
        crate::external::decode_table_entry(table, key, value)
    }

    /// Reclaim XFRM state left by a previous process, for every secure
    /// network's encryption controller (§4.3 "Failure semantics": stale
    /// SAs/SPs reclaimed at startup).
    pub fn reclaim_stale_encryption_state(&self) {
        let networks: Vec<Arc<Network>> = self.networks.lock().unwrap().values().cloned().collect();
        for network in networks {
            for ctrl in network.encryption_controllers() {
                ctrl.reclaim_stale();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryTableLayer;
    use crate::kv::MemoryStore;

    fn test_driver() -> Arc<Driver> {
        let store = Arc::new(MemoryStore::new());
        let table_layer = Arc::new(InMemoryTableLayer::new());
        Driver::new(Config::new(store, table_layer))
    }

    #[test]
    fn create_network_rejects_duplicate_id() {
        let driver = test_driver();
        let spec = SubnetSpec { cidr: "10.0.1.0/24".parse().unwrap(), gateway: "10.0.1.1".parse().unwrap(), vni: 4097 };
        let opts = CreateNetworkOptions { subnets: vec![spec.clone()], secure: false, mtu: None };
        driver.create_network("n1", opts).unwrap();
        let opts2 = CreateNetworkOptions { subnets: vec![spec], secure: false, mtu: None };
        assert!(driver.create_network("n1", opts2).is_err());
    }

    #[test]
    fn join_rejects_secure_network_without_keys() {
        let driver = test_driver();
        let spec = SubnetSpec { cidr: "10.0.1.0/24".parse().unwrap(), gateway: "10.0.1.1".parse().unwrap(), vni: 4097 };
        let opts = CreateNetworkOptions { subnets: vec![spec], secure: true, mtu: None };
        driver.create_network("n1", opts).unwrap();
        driver.create_endpoint("n1", "e1", "10.0.1.5/24".parse().unwrap(), None).unwrap();
        let err = driver.join("n1", "e1", std::path::Path::new("/var/run/netns/dummy")).unwrap_err();
        assert!(matches!(err, DriverError::Forbidden(_)));
    }

    #[test]
    fn create_endpoint_derives_mac_from_ip() {
        let driver = test_driver();
        let spec = SubnetSpec { cidr: "10.0.1.0/24".parse().unwrap(), gateway: "10.0.1.1".parse().unwrap(), vni: 4097 };
        let opts = CreateNetworkOptions { subnets: vec![spec], secure: false, mtu: None };
        driver.create_network("n1", opts).unwrap();
        let mac = driver.create_endpoint("n1", "e1", "10.0.1.5/24".parse().unwrap(), None).unwrap();
        assert_eq!(mac, [0x02, 0x42, 10, 0, 1, 5]);
    }

    #[test]
    fn create_endpoint_rejects_ip_outside_any_subnet() {
        let driver = test_driver();
        let spec = SubnetSpec { cidr: "10.0.1.0/24".parse().unwrap(), gateway: "10.0.1.1".parse().unwrap(), vni: 4097 };
        let opts = CreateNetworkOptions { subnets: vec![spec], secure: false, mtu: None };
        driver.create_network("n1", opts).unwrap();
        let err = driver.create_endpoint("n1", "e1", "192.168.5.5/24".parse().unwrap(), None).unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[test]
    fn node_join_ignores_non_self_events() {
        let driver = test_driver();
        driver.node_join(NodeJoinEvent { address: "10.1.1.1".parse().unwrap(), bind_address: "10.1.1.1".parse().unwrap(), is_self: false });
        assert!(driver.advertise_address.lock().unwrap().is_none());
        driver.node_join(NodeJoinEvent { address: "10.1.1.1".parse().unwrap(), bind_address: "10.1.1.1".parse().unwrap(), is_self: true });
        assert_eq!(*driver.advertise_address.lock().unwrap(), Some("10.1.1.1".parse().unwrap()));
    }
}
