//! rtnetlink implementation of the kernel access seam.

use super::{
    ArpRequest, IpFamily, Kernel, Link, LinkKind, LinkSpec, MacAddr, NetHandle, Neighbour,
    NeighbourState, UNREACHABLE_DEFAULT_METRIC, VxlanInfo,
};
use crate::bridgerefresh::arp;
use crate::error::{Error, Result};
use crate::netns::{NsPath, in_namespace_path};
use crate::ovs;
use crate::sysctl::{self, PROC_SYS};
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{
    InfoData, InfoKind, InfoVrf, InfoVxlan, LinkAttribute, LinkInfo, LinkMessage,
};
use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute};
use netlink_packet_route::route::{RouteAttribute, RouteMessage, RouteType};
use rtnetlink::{Handle, IpVersion};
use std::net::IpAddr;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tracing::debug;

/// A netlink connection opened inside one network namespace.
///
/// The socket stays bound to the namespace it was created in, so the handle
/// can be used from any task afterwards.
pub struct RtnlHandle {
    handle: Handle,
    ns: Option<NsPath>,
}

impl RtnlHandle {
    /// Connection in the namespace the process runs in.
    pub fn host() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle, ns: None })
    }

    /// Connection in namespace `ns`.
    pub fn open(ns: &NsPath) -> Result<Self> {
        let runtime = tokio::runtime::Handle::current();
        let handle = in_namespace_path(ns, move || {
            let _guard = runtime.enter();
            let (connection, handle, _) = rtnetlink::new_connection()?;
            runtime.spawn(connection);
            Ok(handle)
        })?;
        debug!(netns = %ns, "netlink connection opened");
        Ok(Self {
            handle,
            ns: Some(ns.clone()),
        })
    }

    /// Run blocking work in this handle's namespace.
    fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
        T: Send,
    {
        match &self.ns {
            Some(ns) => in_namespace_path(ns, f),
            None => f(),
        }
    }

    async fn link_message(&self, name: &str) -> Result<Option<LinkMessage>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(msg) => Ok(msg),
            Err(e) if is_errno(&e, libc::ENODEV) => Ok(None),
            Err(e) => Err(Error::netlink(format!("get link {name}"), e)),
        }
    }

    async fn add_with_info(&self, name: &str, kind: InfoKind, data: Option<InfoData>) -> Result<()> {
        let mut request = self.handle.link().add();
        let message = request.message_mut();
        message
            .attributes
            .push(LinkAttribute::IfName(name.to_string()));
        let mut info = vec![LinkInfo::Kind(kind)];
        if let Some(data) = data {
            info.push(LinkInfo::Data(data));
        }
        message.attributes.push(LinkAttribute::LinkInfo(info));

        request
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("add link {name}"), e))
    }

    async fn address_messages(&self, index: u32) -> Result<Vec<AddressMessage>> {
        self.handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await
            .map_err(|e| Error::netlink(format!("list addresses of {index}"), e))
    }

    async fn routes(&self, family: IpFamily) -> Result<Vec<RouteMessage>> {
        let version = match family {
            IpFamily::V4 => IpVersion::V4,
            IpFamily::V6 => IpVersion::V6,
        };
        self.handle
            .route()
            .get(version)
            .execute()
            .try_collect()
            .await
            .map_err(|e| Error::netlink("list routes", e))
    }
}

#[async_trait]
impl NetHandle for RtnlHandle {
    fn namespace(&self) -> Option<&NsPath> {
        self.ns.as_ref()
    }

    async fn links(&self) -> Result<Vec<Link>> {
        let messages: Vec<LinkMessage> = self
            .handle
            .link()
            .get()
            .execute()
            .try_collect()
            .await
            .map_err(|e| Error::netlink("list links", e))?;
        Ok(messages.into_iter().map(parse_link).collect())
    }

    async fn link_by_name(&self, name: &str) -> Result<Option<Link>> {
        Ok(self.link_message(name).await?.map(parse_link))
    }

    async fn link_by_index(&self, index: u32) -> Result<Option<Link>> {
        let mut links = self.handle.link().get().match_index(index).execute();
        match links.try_next().await {
            Ok(msg) => Ok(msg.map(parse_link)),
            Err(e) if is_errno(&e, libc::ENODEV) => Ok(None),
            Err(e) => Err(Error::netlink(format!("get link {index}"), e)),
        }
    }

    async fn add_link(&self, spec: &LinkSpec) -> Result<()> {
        let name = spec.name();
        debug!(name, ?spec, "adding link");
        let result = match spec {
            LinkSpec::Bridge { name } => {
                self.handle
                    .link()
                    .add()
                    .bridge(name.clone())
                    .execute()
                    .await
            }
            LinkSpec::Veth { name, peer } => {
                self.handle
                    .link()
                    .add()
                    .veth(name.clone(), peer.clone())
                    .execute()
                    .await
            }
            LinkSpec::Vxlan { name, info } => {
                let mut request = self
                    .handle
                    .link()
                    .add()
                    .vxlan(name.clone(), info.id)
                    .port(info.port)
                    .learning(info.learning);
                if let Some(link) = info.link {
                    request = request.link(link);
                }
                match info.local {
                    Some(IpAddr::V4(local)) => request = request.local(local),
                    Some(IpAddr::V6(local)) => request = request.local6(local),
                    None => {}
                }
                request.execute().await
            }
            LinkSpec::Vrf { name, table } => {
                return self
                    .add_with_info(
                        name,
                        InfoKind::Vrf,
                        Some(InfoData::Vrf(vec![InfoVrf::TableId(*table)])),
                    )
                    .await;
            }
            LinkSpec::Dummy { name } => {
                return self.add_with_info(name, InfoKind::Dummy, None).await;
            }
        };
        result.map_err(|e| Error::netlink(format!("add link {name}"), e))
    }

    async fn delete_link(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("delete link {index}"), e))
    }

    async fn set_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("set link {index} up"), e))
    }

    async fn set_master(&self, index: u32, master: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .controller(master)
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("set master of {index} to {master}"), e))
    }

    async fn set_mac(&self, index: u32, mac: MacAddr) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .address(mac.to_vec())
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("set mac of {index}"), e))
    }

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("set mtu of {index}"), e))
    }

    async fn move_to_namespace(&self, index: u32, target: &NsPath) -> Result<()> {
        let target_ns = target.open()?;
        self.handle
            .link()
            .set(index)
            .setns_by_fd(target_ns.as_raw_fd())
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("move link {index} to {target}"), e))
    }

    async fn set_addr_gen_mode_none(&self, link: &Link) -> Result<()> {
        let key = sysctl::ipv6_conf_key(&link.name, "addr_gen_mode");
        self.blocking(|| match sysctl::write_if_different(Path::new(PROC_SYS), &key, "1") {
            Ok(_) => Ok(()),
            // IPv6 disabled on this link
            Err(Error::Sysctl { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                debug!(key, "no ipv6 conf for link");
                Ok(())
            }
            Err(e) => Err(e),
        })
    }

    async fn set_neigh_suppress(&self, link: &Link) -> Result<()> {
        let name = link.name.clone();
        self.blocking(move || {
            let output = Command::new("bridge")
                .args(["link", "set", "dev", &name, "neigh_suppress", "on"])
                .output()?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::Command {
                    command: format!("bridge link set dev {name} neigh_suppress on"),
                    reason: stderr.trim().to_string(),
                });
            }
            Ok(())
        })
    }

    async fn addresses(&self, index: u32) -> Result<Vec<IpNet>> {
        let messages = self.address_messages(index).await?;
        Ok(messages.iter().filter_map(parse_address).collect())
    }

    async fn add_address(&self, index: u32, addr: IpNet) -> Result<()> {
        match self
            .handle
            .address()
            .add(index, addr.addr(), addr.prefix_len())
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_errno(&e, libc::EEXIST) => Ok(()),
            Err(e) => Err(Error::netlink(format!("add address {addr} to {index}"), e)),
        }
    }

    async fn delete_address(&self, index: u32, addr: IpNet) -> Result<()> {
        let messages = self.address_messages(index).await?;
        let Some(message) = messages
            .into_iter()
            .find(|m| parse_address(m) == Some(addr))
        else {
            return Ok(());
        };
        self.handle
            .address()
            .del(message)
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("delete address {addr} from {index}"), e))
    }

    async fn has_unreachable_default(&self, table: u32, family: IpFamily) -> Result<bool> {
        let routes = self.routes(family).await?;
        Ok(routes
            .iter()
            .any(|r| is_unreachable_default(r) && route_table(r) == table))
    }

    async fn add_unreachable_default(&self, table: u32, family: IpFamily) -> Result<()> {
        let request = self
            .handle
            .route()
            .add()
            .table_id(table)
            .kind(RouteType::Unreachable);
        let result = match family {
            IpFamily::V4 => {
                let mut request = request.v4();
                request
                    .message_mut()
                    .attributes
                    .push(RouteAttribute::Priority(UNREACHABLE_DEFAULT_METRIC));
                request.execute().await
            }
            IpFamily::V6 => {
                let mut request = request.v6();
                request
                    .message_mut()
                    .attributes
                    .push(RouteAttribute::Priority(UNREACHABLE_DEFAULT_METRIC));
                request.execute().await
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_errno(&e, libc::EEXIST) => Ok(()),
            Err(e) => Err(Error::netlink(
                format!("add unreachable default to table {table}"),
                e,
            )),
        }
    }

    async fn neighbours(&self, index: u32) -> Result<Vec<Neighbour>> {
        let messages: Vec<_> = self
            .handle
            .neighbours()
            .get()
            .execute()
            .try_collect()
            .await
            .map_err(|e| Error::netlink("list neighbours", e))?;

        Ok(messages
            .into_iter()
            .filter(|m| m.header.ifindex == index)
            .filter_map(|m| {
                let mut ip = None;
                let mut mac = None;
                for attr in &m.attributes {
                    match attr {
                        NeighbourAttribute::Destination(NeighbourAddress::Inet(v4)) => {
                            ip = Some(IpAddr::V4(*v4));
                        }
                        // IPv6 entries are not ours to refresh
                        NeighbourAttribute::Destination(_) => return None,
                        NeighbourAttribute::LinkLocalAddress(bytes) => mac = mac_from_bytes(bytes),
                        _ => {}
                    }
                }
                Some(Neighbour {
                    ip,
                    mac,
                    state: NeighbourState::from_nud(u16::from(m.header.state)),
                })
            })
            .collect())
    }

    async fn send_arp(&self, index: u32, request: &ArpRequest) -> Result<()> {
        self.blocking(|| arp::send_request(index, request))
    }

    async fn ensure_ovs_bridge(&self, name: &str) -> Result<()> {
        ovs::ensure_bridge(name).await
    }

    async fn ovs_add_port(&self, bridge: &str, port: &str) -> Result<()> {
        ovs::add_port(bridge, port).await
    }

    async fn delete_ovs_bridge(&self, name: &str) -> Result<()> {
        ovs::delete_bridge(name).await
    }
}

/// Kernel handles backed by rtnetlink.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemKernel;

#[async_trait]
impl Kernel for SystemKernel {
    async fn host(&self) -> Result<Arc<dyn NetHandle>> {
        Ok(Arc::new(RtnlHandle::host()?))
    }

    async fn namespace(&self, ns: &NsPath) -> Result<Arc<dyn NetHandle>> {
        Ok(Arc::new(RtnlHandle::open(ns)?))
    }
}

fn is_errno(err: &rtnetlink::Error, errno: i32) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(e) if e.raw_code() == -errno)
}

fn mac_from_bytes(bytes: &[u8]) -> Option<MacAddr> {
    <MacAddr>::try_from(bytes).ok()
}

fn parse_link(message: LinkMessage) -> Link {
    let mut link = Link {
        index: message.header.index,
        name: String::new(),
        kind: LinkKind::Other(String::new()),
        master: None,
        mac: None,
        mtu: 0,
    };

    for attr in message.attributes {
        match attr {
            LinkAttribute::IfName(name) => link.name = name,
            LinkAttribute::Controller(master) => link.master = Some(master),
            LinkAttribute::Address(bytes) => link.mac = mac_from_bytes(&bytes),
            LinkAttribute::Mtu(mtu) => link.mtu = mtu,
            LinkAttribute::LinkInfo(info) => link.kind = parse_link_info(info),
            _ => {}
        }
    }
    link
}

fn parse_link_info(infos: Vec<LinkInfo>) -> LinkKind {
    let mut kind = None;
    let mut data = None;
    for info in infos {
        match info {
            LinkInfo::Kind(k) => kind = Some(k),
            LinkInfo::Data(d) => data = Some(d),
            _ => {}
        }
    }

    match kind {
        Some(InfoKind::Vrf) => {
            let table = match data {
                Some(InfoData::Vrf(attrs)) => attrs
                    .iter()
                    .find_map(|a| match a {
                        InfoVrf::TableId(table) => Some(*table),
                        _ => None,
                    })
                    .unwrap_or_default(),
                _ => 0,
            };
            LinkKind::Vrf { table }
        }
        Some(InfoKind::Bridge) => LinkKind::Bridge,
        Some(InfoKind::Vxlan) => {
            let attrs = match data {
                Some(InfoData::Vxlan(attrs)) => attrs,
                _ => Vec::new(),
            };
            LinkKind::Vxlan(parse_vxlan(&attrs))
        }
        Some(InfoKind::Veth) => LinkKind::Veth,
        Some(InfoKind::Dummy) => LinkKind::Dummy,
        Some(InfoKind::Other(name)) if name == "openvswitch" => LinkKind::OpenVSwitch,
        Some(other) => LinkKind::Other(format!("{other:?}").to_lowercase()),
        None => LinkKind::Other(String::new()),
    }
}

fn parse_vxlan(attrs: &[InfoVxlan]) -> VxlanInfo {
    let mut info = VxlanInfo {
        id: 0,
        port: 0,
        // Kernel default when the attribute is absent
        learning: true,
        local: None,
        link: None,
    };
    for attr in attrs {
        match attr {
            InfoVxlan::Id(id) => info.id = *id,
            InfoVxlan::Port(port) => info.port = *port,
            InfoVxlan::Learning(learning) => info.learning = *learning,
            InfoVxlan::Local(local) => info.local = Some(IpAddr::V4(*local)),
            InfoVxlan::Local6(local) => info.local = Some(IpAddr::V6(*local)),
            InfoVxlan::Link(link) => info.link = Some(*link),
            _ => {}
        }
    }
    info
}

fn parse_address(message: &AddressMessage) -> Option<IpNet> {
    message.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(ip) => IpNet::new(*ip, message.header.prefix_len).ok(),
        _ => None,
    })
}

fn is_unreachable_default(route: &RouteMessage) -> bool {
    route.header.kind == RouteType::Unreachable && route.header.destination_prefix_length == 0
}

fn route_table(route: &RouteMessage) -> u32 {
    route
        .attributes
        .iter()
        .find_map(|attr| match attr {
            RouteAttribute::Table(table) => Some(*table),
            _ => None,
        })
        .unwrap_or(u32::from(route.header.table))
}
