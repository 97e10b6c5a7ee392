//! Moving the uplink NIC into the router namespace.
//!
//! The NIC that serves as underlay is tagged with a marker address once it
//! has been moved. The marker is how later passes recognise it, and it
//! makes a request to use a different NIC an error instead of a silent
//! swap: moving the underlay is destructive, so a changed NIC means the
//! namespace has to be rebuilt by the caller.

use crate::error::{Error, Result};
use crate::loopback::ensure_loopback;
use crate::netlink::{Kernel, Link, NetHandle, ensure_address};
use crate::netns::NsPath;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info};

/// Marker carried by the underlay interface inside the router namespace.
pub const UNDERLAY_MARKER_IP: Ipv4Addr = Ipv4Addr::new(172, 16, 1, 1);

pub fn underlay_marker() -> IpNet {
    IpNet::from(IpAddr::V4(UNDERLAY_MARKER_IP))
}

/// EVPN overlay parameters of the underlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvpnParams {
    pub vtep_ip: IpNet,
}

/// How the uplink NIC is handed to the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NicMode {
    /// The NIC is moved into the router namespace.
    #[default]
    Dedicated,
    /// The NIC stays on the host; eBPF steers router traffic over a veth.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnderlayParams {
    pub underlay_interface: String,
    pub target_ns: NsPath,
    #[serde(default)]
    pub evpn: Option<EvpnParams>,
    /// Routing peers whose control traffic is steered to the router in
    /// shared mode.
    #[serde(default)]
    pub neighbor_ips: Vec<IpAddr>,
    #[serde(default)]
    pub nic_mode: NicMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicParams {
    pub underlay_interface: String,
    pub target_ns: NsPath,
}

/// Move `params.underlay_interface` into the router namespace.
pub async fn setup_nic(kernel: &dyn Kernel, params: &NicParams) -> Result<()> {
    debug!(nic = %params.underlay_interface, netns = %params.target_ns, "setting up underlay NIC");
    let host = kernel.host().await?;
    let target = kernel.namespace(&params.target_ns).await?;
    move_underlay_interface(host.as_ref(), target.as_ref(), &params.underlay_interface).await
}

/// [`setup_nic`], plus the VTEP loopback when EVPN is configured.
pub async fn setup_underlay(kernel: &dyn Kernel, params: &UnderlayParams) -> Result<()> {
    debug!(nic = %params.underlay_interface, netns = %params.target_ns, "setting up underlay");
    let host = kernel.host().await?;
    let target = kernel.namespace(&params.target_ns).await?;

    if let Some(evpn) = &params.evpn {
        ensure_loopback(target.as_ref(), evpn.vtep_ip).await?;
    }
    move_underlay_interface(host.as_ref(), target.as_ref(), &params.underlay_interface).await
}

/// Whether namespace `ns` already has an underlay interface.
pub async fn has_underlay_interface(kernel: &dyn Kernel, ns: &NsPath) -> Result<bool> {
    let nl = kernel.namespace(ns).await?;
    Ok(find_underlay_interface(nl.as_ref()).await?.is_some())
}

/// The link of `nl` carrying the underlay marker.
pub async fn find_underlay_interface(nl: &dyn NetHandle) -> Result<Option<Link>> {
    let marker = underlay_marker();
    for link in nl.links().await? {
        if nl.addresses(link.index).await?.contains(&marker) {
            return Ok(Some(link));
        }
    }
    Ok(None)
}

async fn move_underlay_interface(
    host: &dyn NetHandle,
    target: &dyn NetHandle,
    name: &str,
) -> Result<()> {
    match find_underlay_interface(target).await? {
        Some(current) if current.name == name => {
            debug!(nic = name, "underlay NIC already in place");
            return Ok(());
        }
        Some(current) => {
            return Err(Error::UnderlayExists {
                current: current.name,
                requested: name.to_string(),
            });
        }
        None => {}
    }

    // A previous pass may have moved the NIC without tagging it.
    if target.link_by_name(name).await?.is_none() {
        let nic = host.require_link(name).await?;
        let target_ns = target
            .namespace()
            .ok_or_else(|| Error::InvalidParams("underlay target must be a namespace".into()))?;
        host.move_to_namespace(nic.index, target_ns).await?;
        info!(nic = name, netns = %target_ns, "underlay NIC moved");
    }

    let nic = target.require_link(name).await?;
    ensure_address(target, nic.index, underlay_marker()).await?;
    target.set_up(nic.index).await?;
    Ok(())
}
