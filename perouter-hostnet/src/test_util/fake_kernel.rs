//! In-memory kernel for reconciliation tests.
//!
//! Keeps one link table per namespace and records every mutation, so a
//! test can assert that a second reconciliation pass changed nothing.

use crate::error::{Error, Result};
use crate::netlink::{
    ArpRequest, IpFamily, Kernel, Link, LinkKind, LinkSpec, MacAddr, NetHandle, Neighbour,
};
use crate::netns::NsPath;
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Namespace key: `None` is the host namespace.
type NsKey = Option<NsPath>;

/// A unicast ARP request captured by the fake kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentArp {
    pub namespace: Option<NsPath>,
    pub index: u32,
    pub request: ArpRequest,
}

#[derive(Debug, Clone)]
struct FakeLink {
    link: Link,
    up: bool,
    addresses: Vec<IpNet>,
    /// Index of the other end of a veth pair.
    peer: Option<u32>,
    addr_gen_none: bool,
    neigh_suppress: bool,
}

#[derive(Debug, Default)]
struct FakeNamespace {
    links: BTreeMap<u32, FakeLink>,
    unreachable_defaults: BTreeSet<(u32, u8)>,
    neighbours: BTreeMap<u32, Vec<Neighbour>>,
}

impl FakeNamespace {
    fn by_name(&self, name: &str) -> Option<&FakeLink> {
        self.links.values().find(|l| l.link.name == name)
    }
}

#[derive(Debug)]
struct FakeState {
    namespaces: BTreeMap<NsKey, FakeNamespace>,
    next_index: u32,
    changes: Vec<String>,
    sent_arps: Vec<SentArp>,
    ovs_bridges: BTreeMap<String, BTreeSet<String>>,
    failing_deletes: HashSet<String>,
    failing_arps: HashSet<Ipv4Addr>,
}

impl FakeState {
    fn ns(&self, key: &NsKey) -> Result<&FakeNamespace> {
        self.namespaces.get(key).ok_or_else(|| missing_namespace(key))
    }

    fn ns_mut(&mut self, key: &NsKey) -> Result<&mut FakeNamespace> {
        self.namespaces
            .get_mut(key)
            .ok_or_else(|| missing_namespace(key))
    }

    fn link_mut(&mut self, key: &NsKey, index: u32) -> Result<&mut FakeLink> {
        self.ns_mut(key)?
            .links
            .get_mut(&index)
            .ok_or_else(|| Error::LinkNotFound(index.to_string()))
    }

    fn allocate_index(&mut self) -> u32 {
        self.next_index += 1;
        self.next_index
    }

    fn record(&mut self, key: &NsKey, change: String) {
        let ns = match key {
            Some(path) => path.to_string(),
            None => "host".to_string(),
        };
        self.changes.push(format!("[{ns}] {change}"));
    }

    fn insert_link(&mut self, key: &NsKey, name: &str, kind: LinkKind, mtu: u32) -> Result<u32> {
        if self.ns(key)?.by_name(name).is_some() {
            return Err(request_failed(format!("add link {name}: exists")));
        }
        let index = self.allocate_index();
        let mac = [0x0a, 0x58, 0x00, 0x00, (index >> 8) as u8, index as u8];
        let link = FakeLink {
            link: Link {
                index,
                name: name.to_string(),
                kind,
                master: None,
                mac: Some(mac),
                mtu,
            },
            up: false,
            addresses: Vec::new(),
            peer: None,
            addr_gen_none: false,
            neigh_suppress: false,
        };
        self.ns_mut(key)?.links.insert(index, link);
        Ok(index)
    }

    /// Remove `index` from namespace `key`, its veth peer wherever it
    /// lives, and release everything enslaved to it.
    fn remove_link(&mut self, key: &NsKey, index: u32) -> Result<()> {
        let removed = self
            .ns_mut(key)?
            .links
            .remove(&index)
            .ok_or_else(|| Error::LinkNotFound(index.to_string()))?;
        release_ports(self.ns_mut(key)?, index);

        if let Some(peer) = removed.peer {
            for ns in self.namespaces.values_mut() {
                if ns.links.remove(&peer).is_some() {
                    release_ports(ns, peer);
                }
            }
        }
        Ok(())
    }
}

fn release_ports(ns: &mut FakeNamespace, master: u32) {
    for link in ns.links.values_mut() {
        if link.link.master == Some(master) {
            link.link.master = None;
        }
    }
}

fn family_key(family: IpFamily) -> u8 {
    match family {
        IpFamily::V4 => 4,
        IpFamily::V6 => 6,
    }
}

fn missing_namespace(key: &NsKey) -> Error {
    let path = key
        .as_ref()
        .map(|p| p.as_path().to_path_buf())
        .unwrap_or_default();
    Error::Namespace {
        path,
        source: io::Error::from(io::ErrorKind::NotFound),
    }
}

fn request_failed(op: String) -> Error {
    Error::netlink(op, rtnetlink::Error::RequestFailed)
}

/// In-memory kernel with per-namespace link tables.
#[derive(Clone)]
pub struct FakeKernel {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    /// A kernel with only the host namespace and a loopback device.
    pub fn new() -> Self {
        let mut namespaces = BTreeMap::new();
        namespaces.insert(None, FakeNamespace::default());
        let mut state = FakeState {
            namespaces,
            next_index: 0,
            changes: Vec::new(),
            sent_arps: Vec::new(),
            ovs_bridges: BTreeMap::new(),
            failing_deletes: HashSet::new(),
            failing_arps: HashSet::new(),
        };
        // Index 1 is always lo.
        let _ = state.insert_link(&None, "lo", LinkKind::Other("loopback".into()), 65536);
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create namespace `ns`.
    pub fn add_namespace(&self, ns: &NsPath) {
        self.lock()
            .namespaces
            .entry(Some(ns.clone()))
            .or_default();
    }

    /// Add a physical NIC. Returns its index.
    pub fn add_nic(
        &self,
        ns: Option<&NsPath>,
        name: &str,
        mac: MacAddr,
        mtu: u32,
        addresses: &[IpNet],
    ) -> u32 {
        let key = ns.cloned();
        let mut state = self.lock();
        let index = state
            .insert_link(&key, name, LinkKind::Other("device".into()), mtu)
            .unwrap_or_else(|e| panic!("add_nic {name}: {e}"));
        if let Ok(link) = state.link_mut(&key, index) {
            link.link.mac = Some(mac);
            link.addresses = addresses.to_vec();
            link.up = true;
        }
        index
    }

    /// Add a link of arbitrary kind without recording a change.
    pub fn add_link(&self, ns: Option<&NsPath>, name: &str, kind: LinkKind) -> u32 {
        self.lock()
            .insert_link(&ns.cloned(), name, kind, 1500)
            .unwrap_or_else(|e| panic!("add_link {name}: {e}"))
    }

    /// Add `addr` to `name` without recording a change.
    pub fn add_address(&self, ns: Option<&NsPath>, name: &str, addr: IpNet) {
        let key = ns.cloned();
        let mut state = self.lock();
        let index = state
            .ns(&key)
            .ok()
            .and_then(|n| n.by_name(name))
            .map(|l| l.link.index)
            .unwrap_or_else(|| panic!("link {name} not found"));
        if let Ok(link) = state.link_mut(&key, index) {
            link.addresses.push(addr);
        }
    }

    /// Enslave `name` to `master` without recording a change.
    pub fn set_master(&self, ns: Option<&NsPath>, name: &str, master: &str) {
        let key = ns.cloned();
        let mut state = self.lock();
        let (index, master) = {
            let table = state.ns(&key).unwrap_or_else(|e| panic!("{e}"));
            let index = table.by_name(name).map(|l| l.link.index);
            let master = table.by_name(master).map(|l| l.link.index);
            (index, master)
        };
        if let (Some(index), Some(master)) = (index, master)
            && let Ok(link) = state.link_mut(&key, index)
        {
            link.link.master = Some(master);
        }
    }

    /// Seed the neighbour table of link `name`.
    pub fn set_neighbours(&self, ns: Option<&NsPath>, name: &str, neighbours: Vec<Neighbour>) {
        let key = ns.cloned();
        let mut state = self.lock();
        let table = state.ns_mut(&key).unwrap_or_else(|e| panic!("{e}"));
        let index = table
            .by_name(name)
            .map(|l| l.link.index)
            .unwrap_or_else(|| panic!("link {name} not found"));
        table.neighbours.insert(index, neighbours);
    }

    /// Make deleting link `name` fail.
    pub fn fail_delete(&self, name: &str) {
        self.lock().failing_deletes.insert(name.to_string());
    }

    /// Make ARP requests for `ip` fail.
    pub fn fail_arp(&self, ip: Ipv4Addr) {
        self.lock().failing_arps.insert(ip);
    }

    pub fn link(&self, ns: Option<&NsPath>, name: &str) -> Option<Link> {
        let state = self.lock();
        state
            .ns(&ns.cloned())
            .ok()?
            .by_name(name)
            .map(|l| l.link.clone())
    }

    /// Names of all links in `ns`, sorted.
    pub fn link_names(&self, ns: Option<&NsPath>) -> Vec<String> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .ns(&ns.cloned())
            .map(|n| n.links.values().map(|l| l.link.name.clone()).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn addresses(&self, ns: Option<&NsPath>, name: &str) -> Vec<IpNet> {
        let state = self.lock();
        state
            .ns(&ns.cloned())
            .ok()
            .and_then(|n| n.by_name(name))
            .map(|l| l.addresses.clone())
            .unwrap_or_default()
    }

    pub fn is_up(&self, ns: Option<&NsPath>, name: &str) -> bool {
        let state = self.lock();
        state
            .ns(&ns.cloned())
            .ok()
            .and_then(|n| n.by_name(name))
            .is_some_and(|l| l.up)
    }

    pub fn addr_gen_mode_none(&self, ns: Option<&NsPath>, name: &str) -> bool {
        let state = self.lock();
        state
            .ns(&ns.cloned())
            .ok()
            .and_then(|n| n.by_name(name))
            .is_some_and(|l| l.addr_gen_none)
    }

    pub fn neigh_suppress(&self, ns: Option<&NsPath>, name: &str) -> bool {
        let state = self.lock();
        state
            .ns(&ns.cloned())
            .ok()
            .and_then(|n| n.by_name(name))
            .is_some_and(|l| l.neigh_suppress)
    }

    pub fn has_unreachable_default(&self, ns: Option<&NsPath>, table: u32, family: IpFamily) -> bool {
        let state = self.lock();
        state
            .ns(&ns.cloned())
            .is_ok_and(|n| n.unreachable_defaults.contains(&(table, family_key(family))))
    }

    /// Ports of OVS bridge `name`, `None` if the bridge does not exist.
    pub fn ovs_ports(&self, name: &str) -> Option<Vec<String>> {
        self.lock()
            .ovs_bridges
            .get(name)
            .map(|ports| ports.iter().cloned().collect())
    }

    /// Every mutation applied through a handle, in order.
    pub fn changes(&self) -> Vec<String> {
        self.lock().changes.clone()
    }

    pub fn change_count(&self) -> usize {
        self.lock().changes.len()
    }

    pub fn sent_arps(&self) -> Vec<SentArp> {
        self.lock().sent_arps.clone()
    }

    fn handle(&self, ns: NsKey) -> FakeHandle {
        FakeHandle {
            state: Arc::clone(&self.state),
            ns,
        }
    }
}

#[async_trait]
impl Kernel for FakeKernel {
    async fn host(&self) -> Result<Arc<dyn NetHandle>> {
        Ok(Arc::new(self.handle(None)))
    }

    async fn namespace(&self, ns: &NsPath) -> Result<Arc<dyn NetHandle>> {
        let key = Some(ns.clone());
        self.lock().ns(&key)?;
        Ok(Arc::new(self.handle(key)))
    }
}

/// [`NetHandle`] bound to one namespace of a [`FakeKernel`].
pub struct FakeHandle {
    state: Arc<Mutex<FakeState>>,
    ns: NsKey,
}

impl FakeHandle {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update<F>(&self, index: u32, change: String, f: F) -> Result<()>
    where
        F: FnOnce(&mut FakeLink) -> bool,
    {
        let mut state = self.lock();
        let link = state.link_mut(&self.ns, index)?;
        if f(link) {
            state.record(&self.ns, change);
        }
        Ok(())
    }
}

#[async_trait]
impl NetHandle for FakeHandle {
    fn namespace(&self) -> Option<&NsPath> {
        self.ns.as_ref()
    }

    async fn links(&self) -> Result<Vec<Link>> {
        let state = self.lock();
        Ok(state
            .ns(&self.ns)?
            .links
            .values()
            .map(|l| l.link.clone())
            .collect())
    }

    async fn link_by_name(&self, name: &str) -> Result<Option<Link>> {
        let state = self.lock();
        Ok(state.ns(&self.ns)?.by_name(name).map(|l| l.link.clone()))
    }

    async fn link_by_index(&self, index: u32) -> Result<Option<Link>> {
        let state = self.lock();
        Ok(state
            .ns(&self.ns)?
            .links
            .get(&index)
            .map(|l| l.link.clone()))
    }

    async fn add_link(&self, spec: &LinkSpec) -> Result<()> {
        let mut state = self.lock();
        match spec {
            LinkSpec::Vrf { name, table } => {
                state.insert_link(&self.ns, name, LinkKind::Vrf { table: *table }, 65575)?;
            }
            LinkSpec::Bridge { name } => {
                state.insert_link(&self.ns, name, LinkKind::Bridge, 1500)?;
            }
            LinkSpec::Vxlan { name, info } => {
                state.insert_link(&self.ns, name, LinkKind::Vxlan(*info), 1450)?;
            }
            LinkSpec::Dummy { name } => {
                state.insert_link(&self.ns, name, LinkKind::Dummy, 1500)?;
            }
            LinkSpec::Veth { name, peer } => {
                if state.ns(&self.ns)?.by_name(peer).is_some() {
                    return Err(request_failed(format!("add link {peer}: exists")));
                }
                let a = state.insert_link(&self.ns, name, LinkKind::Veth, 1500)?;
                let b = state.insert_link(&self.ns, peer, LinkKind::Veth, 1500)?;
                state.link_mut(&self.ns, a)?.peer = Some(b);
                state.link_mut(&self.ns, b)?.peer = Some(a);
            }
        }
        state.record(&self.ns, format!("add {spec:?}"));
        Ok(())
    }

    async fn delete_link(&self, index: u32) -> Result<()> {
        let mut state = self.lock();
        let name = state
            .ns(&self.ns)?
            .links
            .get(&index)
            .map(|l| l.link.name.clone())
            .ok_or_else(|| Error::LinkNotFound(index.to_string()))?;
        if state.failing_deletes.contains(&name) {
            return Err(request_failed(format!("delete link {name}")));
        }
        state.remove_link(&self.ns, index)?;
        state.record(&self.ns, format!("delete {name}"));
        Ok(())
    }

    async fn set_up(&self, index: u32) -> Result<()> {
        self.update(index, format!("set {index} up"), |l| {
            !std::mem::replace(&mut l.up, true)
        })
    }

    async fn set_master(&self, index: u32, master: u32) -> Result<()> {
        if !self.lock().ns(&self.ns)?.links.contains_key(&master) {
            return Err(Error::LinkNotFound(master.to_string()));
        }
        self.update(index, format!("set master of {index} to {master}"), |l| {
            l.link.master.replace(master) != Some(master)
        })
    }

    async fn set_mac(&self, index: u32, mac: MacAddr) -> Result<()> {
        self.update(index, format!("set mac of {index}"), |l| {
            l.link.mac.replace(mac) != Some(mac)
        })
    }

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        self.update(index, format!("set mtu of {index} to {mtu}"), |l| {
            std::mem::replace(&mut l.link.mtu, mtu) != mtu
        })
    }

    async fn move_to_namespace(&self, index: u32, target: &NsPath) -> Result<()> {
        let mut state = self.lock();
        let target_key = Some(target.clone());
        let name = state
            .ns(&self.ns)?
            .links
            .get(&index)
            .map(|l| l.link.name.clone())
            .ok_or_else(|| Error::LinkNotFound(index.to_string()))?;
        if state.ns(&target_key)?.by_name(&name).is_some() {
            return Err(request_failed(format!("move {name} to {target}: exists")));
        }

        let source = state.ns_mut(&self.ns)?;
        let Some(mut link) = source.links.remove(&index) else {
            return Err(Error::LinkNotFound(name));
        };
        release_ports(source, index);
        // Addresses, master and state do not survive a namespace move.
        link.link.master = None;
        link.addresses.clear();
        link.up = false;
        state.ns_mut(&target_key)?.links.insert(index, link);
        state.record(&self.ns, format!("move {name} to {target}"));
        Ok(())
    }

    async fn set_addr_gen_mode_none(&self, link: &Link) -> Result<()> {
        self.update(link.index, format!("addr_gen_mode none on {}", link.name), |l| {
            !std::mem::replace(&mut l.addr_gen_none, true)
        })
    }

    async fn set_neigh_suppress(&self, link: &Link) -> Result<()> {
        if link.master.is_none() {
            return Err(Error::Command {
                command: format!("bridge link set dev {} neigh_suppress on", link.name),
                reason: "not a bridge port".into(),
            });
        }
        self.update(link.index, format!("neigh_suppress on {}", link.name), |l| {
            !std::mem::replace(&mut l.neigh_suppress, true)
        })
    }

    async fn addresses(&self, index: u32) -> Result<Vec<IpNet>> {
        let mut state = self.lock();
        Ok(state.link_mut(&self.ns, index)?.addresses.clone())
    }

    async fn add_address(&self, index: u32, addr: IpNet) -> Result<()> {
        self.update(index, format!("add address {addr} to {index}"), |l| {
            if l.addresses.contains(&addr) {
                return false;
            }
            l.addresses.push(addr);
            true
        })
    }

    async fn delete_address(&self, index: u32, addr: IpNet) -> Result<()> {
        self.update(index, format!("delete address {addr} from {index}"), |l| {
            let before = l.addresses.len();
            l.addresses.retain(|a| *a != addr);
            l.addresses.len() != before
        })
    }

    async fn has_unreachable_default(&self, table: u32, family: IpFamily) -> Result<bool> {
        let state = self.lock();
        Ok(state
            .ns(&self.ns)?
            .unreachable_defaults
            .contains(&(table, family_key(family))))
    }

    async fn add_unreachable_default(&self, table: u32, family: IpFamily) -> Result<()> {
        let mut state = self.lock();
        if state
            .ns_mut(&self.ns)?
            .unreachable_defaults
            .insert((table, family_key(family)))
        {
            state.record(&self.ns, format!("add unreachable default {family:?} table {table}"));
        }
        Ok(())
    }

    async fn neighbours(&self, index: u32) -> Result<Vec<Neighbour>> {
        let state = self.lock();
        Ok(state
            .ns(&self.ns)?
            .neighbours
            .get(&index)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_arp(&self, index: u32, request: &ArpRequest) -> Result<()> {
        let mut state = self.lock();
        if state.failing_arps.contains(&request.target_ip) {
            return Err(request_failed(format!("send arp to {}", request.target_ip)));
        }
        state.sent_arps.push(SentArp {
            namespace: self.ns.clone(),
            index,
            request: *request,
        });
        Ok(())
    }

    async fn ensure_ovs_bridge(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.ovs_bridges.contains_key(name) {
            return Ok(());
        }
        state.insert_link(&None, name, LinkKind::OpenVSwitch, 1500)?;
        state.ovs_bridges.insert(name.to_string(), BTreeSet::new());
        state.record(&None, format!("ovs add-br {name}"));
        Ok(())
    }

    async fn ovs_add_port(&self, bridge: &str, port: &str) -> Result<()> {
        let mut state = self.lock();
        let Some(ports) = state.ovs_bridges.get_mut(bridge) else {
            return Err(Error::Ovs {
                args: format!("--may-exist add-port {bridge} {port}"),
                reason: format!("no bridge named {bridge}"),
            });
        };
        if ports.insert(port.to_string()) {
            state.record(&None, format!("ovs add-port {bridge} {port}"));
        }
        Ok(())
    }

    async fn delete_ovs_bridge(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.ovs_bridges.remove(name).is_none() {
            return Ok(());
        }
        let index = state.ns(&None)?.by_name(name).map(|l| l.link.index);
        if let Some(index) = index {
            state.remove_link(&None, index)?;
        }
        state.record(&None, format!("ovs del-br {name}"));
        Ok(())
    }
}
