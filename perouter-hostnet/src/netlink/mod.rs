//! Kernel access seam.
//!
//! Builders never talk to netlink directly. They receive a [`NetHandle`]
//! bound to one network namespace and re-query it on every call, so the
//! same code runs against the kernel ([`rtnl::SystemKernel`]) or against
//! the in-memory kernel in `test_util`.

pub mod rtnl;

use crate::error::{Error, Result};
use crate::netns::NsPath;
use async_trait::async_trait;
use ipnet::IpNet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

pub use rtnl::SystemKernel;

/// Metric of the VRF unreachable default routes, the highest the kernel
/// accepts so any learned default wins.
pub const UNREACHABLE_DEFAULT_METRIC: u32 = 4_278_198_272;

pub type MacAddr = [u8; 6];

/// Format a MAC address as colon-separated hex.
pub fn format_mac(mac: &MacAddr) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

/// VXLAN device attributes the builders care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VxlanInfo {
    pub id: u32,
    pub port: u16,
    pub learning: bool,
    /// Source address of encapsulated packets.
    pub local: Option<IpAddr>,
    /// Egress device index.
    pub link: Option<u32>,
}

/// Link kind, as reported by `IFLA_INFO_KIND`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Vrf { table: u32 },
    Bridge,
    Vxlan(VxlanInfo),
    Veth,
    Dummy,
    OpenVSwitch,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub kind: LinkKind,
    pub master: Option<u32>,
    pub mac: Option<MacAddr>,
    pub mtu: u32,
}

impl Link {
    pub fn vrf_table(&self) -> Option<u32> {
        match self.kind {
            LinkKind::Vrf { table } => Some(table),
            _ => None,
        }
    }

    pub fn as_vxlan(&self) -> Option<&VxlanInfo> {
        match &self.kind {
            LinkKind::Vxlan(info) => Some(info),
            _ => None,
        }
    }

    pub fn is_vrf(&self) -> bool {
        self.vrf_table().is_some()
    }

    pub fn is_bridge(&self) -> bool {
        self.kind == LinkKind::Bridge
    }

    pub fn is_veth(&self) -> bool {
        self.kind == LinkKind::Veth
    }

    pub fn is_dummy(&self) -> bool {
        self.kind == LinkKind::Dummy
    }

    pub fn is_ovs_bridge(&self) -> bool {
        self.kind == LinkKind::OpenVSwitch
    }
}

/// A link to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    Vrf { name: String, table: u32 },
    Bridge { name: String },
    Vxlan { name: String, info: VxlanInfo },
    /// Both ends are created in the handle's namespace.
    Veth { name: String, peer: String },
    Dummy { name: String },
}

impl LinkSpec {
    pub fn name(&self) -> &str {
        match self {
            LinkSpec::Vrf { name, .. }
            | LinkSpec::Bridge { name }
            | LinkSpec::Vxlan { name, .. }
            | LinkSpec::Veth { name, .. }
            | LinkSpec::Dummy { name } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighbourState {
    Incomplete,
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    NoArp,
    Permanent,
    Other(u16),
}

impl NeighbourState {
    /// Decode the `NUD_*` bits of a neighbour message.
    pub fn from_nud(state: u16) -> Self {
        match state {
            0x01 => NeighbourState::Incomplete,
            0x02 => NeighbourState::Reachable,
            0x04 => NeighbourState::Stale,
            0x08 => NeighbourState::Delay,
            0x10 => NeighbourState::Probe,
            0x20 => NeighbourState::Failed,
            0x40 => NeighbourState::NoArp,
            0x80 => NeighbourState::Permanent,
            other => NeighbourState::Other(other),
        }
    }
}

/// One entry of the kernel neighbour table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbour {
    pub ip: Option<IpAddr>,
    pub mac: Option<MacAddr>,
    pub state: NeighbourState,
}

/// A unicast ARP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpRequest {
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl fmt::Display for ArpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "who-has {} tell {} ({} -> {})",
            self.target_ip,
            self.sender_ip,
            format_mac(&self.sender_mac),
            format_mac(&self.target_mac)
        )
    }
}

/// Kernel operations in one network namespace.
#[async_trait]
pub trait NetHandle: Send + Sync {
    /// Namespace this handle is bound to, `None` for the host.
    fn namespace(&self) -> Option<&NsPath>;

    async fn links(&self) -> Result<Vec<Link>>;

    async fn link_by_name(&self, name: &str) -> Result<Option<Link>>;

    async fn link_by_index(&self, index: u32) -> Result<Option<Link>>;

    async fn add_link(&self, spec: &LinkSpec) -> Result<()>;

    async fn delete_link(&self, index: u32) -> Result<()>;

    async fn set_up(&self, index: u32) -> Result<()>;

    async fn set_master(&self, index: u32, master: u32) -> Result<()>;

    async fn set_mac(&self, index: u32, mac: MacAddr) -> Result<()>;

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()>;

    /// Move a link of this namespace into `target`.
    async fn move_to_namespace(&self, index: u32, target: &NsPath) -> Result<()>;

    /// Disable IPv6 link-local address generation.
    async fn set_addr_gen_mode_none(&self, link: &Link) -> Result<()>;

    /// Turn on ARP/ND suppression on a bridge port.
    async fn set_neigh_suppress(&self, link: &Link) -> Result<()>;

    async fn addresses(&self, index: u32) -> Result<Vec<IpNet>>;

    async fn add_address(&self, index: u32, addr: IpNet) -> Result<()>;

    async fn delete_address(&self, index: u32, addr: IpNet) -> Result<()>;

    async fn has_unreachable_default(&self, table: u32, family: IpFamily) -> Result<bool>;

    async fn add_unreachable_default(&self, table: u32, family: IpFamily) -> Result<()>;

    /// IPv4 neighbours learned on `index`.
    async fn neighbours(&self, index: u32) -> Result<Vec<Neighbour>>;

    async fn send_arp(&self, index: u32, request: &ArpRequest) -> Result<()>;

    async fn ensure_ovs_bridge(&self, name: &str) -> Result<()>;

    async fn ovs_add_port(&self, bridge: &str, port: &str) -> Result<()>;

    async fn delete_ovs_bridge(&self, name: &str) -> Result<()>;

    /// Like [`NetHandle::link_by_name`], but absence is an error.
    async fn require_link(&self, name: &str) -> Result<Link> {
        self.link_by_name(name)
            .await?
            .ok_or_else(|| Error::LinkNotFound(name.to_string()))
    }
}

/// Add `addr` to link `index` unless it already carries it.
///
/// Returns whether the address was added.
pub async fn ensure_address(nl: &dyn NetHandle, index: u32, addr: IpNet) -> Result<bool> {
    if nl.addresses(index).await?.contains(&addr) {
        return Ok(false);
    }
    nl.add_address(index, addr).await?;
    Ok(true)
}

/// Enslave `link` to `master` unless it already is.
pub async fn ensure_master(nl: &dyn NetHandle, link: &Link, master: u32) -> Result<()> {
    if link.master == Some(master) {
        return Ok(());
    }
    nl.set_master(link.index, master).await
}

/// True for IPv6 link-local (`fe80::/10`) addresses.
pub fn is_link_local(addr: &IpNet) -> bool {
    match addr {
        IpNet::V4(_) => false,
        IpNet::V6(net) => (net.addr().segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Hands out [`NetHandle`]s.
#[async_trait]
pub trait Kernel: Send + Sync {
    /// Handle for the namespace the process started in.
    async fn host(&self) -> Result<Arc<dyn NetHandle>>;

    async fn namespace(&self, ns: &NsPath) -> Result<Arc<dyn NetHandle>>;
}
