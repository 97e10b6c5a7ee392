//! L2 and L3 VNI orchestration.
//!
//! A VNI is realised as a VRF, a bridge enslaved to it and a VXLAN device
//! enslaved to the bridge, all inside the router namespace, plus a veth
//! pair exposing the segment to the host:
//!
//! ```text
//!   host ns                     router ns
//!   host<VNI> ---- veth ---- pe<VNI> --+
//!                                      |  (L3: pe -> VRF, L2: pe -> bridge)
//!                           VRF <- br-pe-<VNI> <- vni<VNI>
//! ```

use crate::bridge::{
    BRIDGE_PREFIX, HOST_BRIDGE_PREFIX, bridge_name, ensure_bridge, ensure_bridge_fixed_mac,
    ensure_host_bridge, host_bridge_name,
};
use crate::error::{Error, Result};
use crate::netlink::{Kernel, Link, LinkKind, NetHandle, ensure_address, ensure_master};
use crate::netns::NsPath;
use crate::veth::{HOST_VETH_PREFIX, ensure_veth, veth_names};
use crate::vrf::ensure_vrf;
use crate::vxlan::{VXLAN_PREFIX, ensure_vxlan};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Where a VXLAN takes its source address from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VtepSource {
    /// Address held by the `lound` loopback.
    Ip(IpNet),
    /// First IPv4 address of an interface in the router namespace.
    Interface(String),
}

/// Parameters shared by L2 and L3 VNIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VniParams {
    pub vrf: String,
    pub target_ns: NsPath,
    pub vtep: VtepSource,
    pub vni: u32,
    pub vxlan_port: u16,
}

/// Addresses of the veth pair of an L3 VNI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VethAddresses {
    #[serde(default)]
    pub host_ipv4: Option<IpNet>,
    #[serde(default)]
    pub ns_ipv4: Option<IpNet>,
    #[serde(default)]
    pub host_ipv6: Option<IpNet>,
    #[serde(default)]
    pub ns_ipv6: Option<IpNet>,
}

impl VethAddresses {
    fn host(&self) -> Vec<IpNet> {
        self.host_ipv4.into_iter().chain(self.host_ipv6).collect()
    }

    fn namespace(&self) -> Vec<IpNet> {
        self.ns_ipv4.into_iter().chain(self.ns_ipv6).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L3VniParams {
    #[serde(flatten)]
    pub base: VniParams,
    /// `None` for an overlay-only VNI without a host leg.
    #[serde(default)]
    pub veth: Option<VethAddresses>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostMasterKind {
    LinuxBridge,
    Ovs,
}

/// Host-side device the `host<VNI>` leg of an L2 VNI is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMaster {
    pub kind: HostMasterKind,
    /// Create `br-hs-<VNI>` instead of using `name`.
    #[serde(default)]
    pub auto_create: bool,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2VniParams {
    #[serde(flatten)]
    pub base: VniParams,
    /// Distributed gateway addresses assigned to the router bridge.
    #[serde(default)]
    pub gateway_ips: Vec<IpNet>,
    #[serde(default)]
    pub host_master: Option<HostMaster>,
}

/// Set up an L3 VNI.
///
/// With veth addresses, `pe<VNI>` is enslaved to the VRF and both legs get
/// their addresses. Addresses go on after enslavement since joining a VRF
/// flushes IPv6 globals.
pub async fn setup_l3_vni(kernel: &dyn Kernel, params: &L3VniParams) -> Result<()> {
    let base = &params.base;
    debug!(vni = base.vni, vrf = %base.vrf, "setting up L3 VNI");
    let target = kernel.namespace(&base.target_ns).await?;

    let Some(addresses) = &params.veth else {
        let host = kernel.host().await?;
        remove_veth(host.as_ref(), target.as_ref(), base.vni).await?;
        setup_vni_graph(target.as_ref(), base).await?;
        return Ok(());
    };

    let host_addrs = addresses.host();
    let ns_addrs = addresses.namespace();
    if host_addrs.is_empty() || ns_addrs.is_empty() {
        return Err(Error::InvalidParams(format!(
            "vni {}: at least one IP address must be provided (IPv4 or IPv6) for each veth leg",
            base.vni
        )));
    }

    let host = kernel.host().await?;
    let (host_veth, pe_veth) = ensure_veth(host.as_ref(), target.as_ref(), base.vni).await?;
    host.set_up(host_veth.index).await?;
    target.set_up(pe_veth.index).await?;

    let vrf = setup_vni_graph(target.as_ref(), base).await?;
    ensure_master(target.as_ref(), &pe_veth, vrf.index).await?;

    for addr in host_addrs {
        ensure_address(host.as_ref(), host_veth.index, addr).await?;
    }
    for addr in ns_addrs {
        ensure_address(target.as_ref(), pe_veth.index, addr).await?;
    }

    info!(vni = base.vni, vrf = %base.vrf, "L3 VNI ready");
    Ok(())
}

/// Set up an L2 VNI.
///
/// `pe<VNI>` is enslaved to the router bridge directly; it never passes
/// through the VRF, so repeated passes do not move it between masters.
pub async fn setup_l2_vni(kernel: &dyn Kernel, params: &L2VniParams) -> Result<()> {
    let base = &params.base;
    debug!(vni = base.vni, vrf = %base.vrf, "setting up L2 VNI");
    let host = kernel.host().await?;
    let target = kernel.namespace(&base.target_ns).await?;

    let (host_veth, pe_veth) = ensure_veth(host.as_ref(), target.as_ref(), base.vni).await?;
    host.set_up(host_veth.index).await?;
    target.set_up(pe_veth.index).await?;

    setup_vni_graph(target.as_ref(), base).await?;
    let bridge = target.require_link(&bridge_name(base.vni)).await?;
    ensure_master(target.as_ref(), &pe_veth, bridge.index).await?;

    if !params.gateway_ips.is_empty() {
        for addr in &params.gateway_ips {
            ensure_address(target.as_ref(), bridge.index, *addr).await?;
        }
        // Same MAC on every node for the distributed gateway.
        ensure_bridge_fixed_mac(target.as_ref(), &bridge.name, base.vni).await?;
    }

    if let Some(master) = &params.host_master {
        attach_host_master(host.as_ref(), base.vni, master, &host_veth).await?;
    }

    info!(vni = base.vni, vrf = %base.vrf, "L2 VNI ready");
    Ok(())
}

/// VRF, bridge and VXLAN of one VNI. Returns the VRF.
async fn setup_vni_graph(nl: &dyn NetHandle, params: &VniParams) -> Result<Link> {
    let vrf = ensure_vrf(nl, &params.vrf).await?;
    let bridge = ensure_bridge(nl, params.vni, vrf.index).await?;
    ensure_vxlan(nl, params, bridge.index).await?;
    Ok(vrf)
}

async fn attach_host_master(
    host: &dyn NetHandle,
    vni: u32,
    master: &HostMaster,
    host_veth: &Link,
) -> Result<()> {
    let named = || {
        master.name.clone().ok_or_else(|| {
            Error::InvalidParams(format!(
                "vni {vni}: host master needs a name unless auto_create is set"
            ))
        })
    };

    match (master.kind, master.auto_create) {
        (HostMasterKind::LinuxBridge, true) => {
            let bridge = ensure_host_bridge(host, vni).await?;
            ensure_master(host, host_veth, bridge.index).await
        }
        (HostMasterKind::LinuxBridge, false) => {
            let bridge = host.require_link(&named()?).await?;
            ensure_master(host, host_veth, bridge.index).await
        }
        (HostMasterKind::Ovs, true) => {
            let bridge = host_bridge_name(vni);
            host.ensure_ovs_bridge(&bridge).await?;
            host.ovs_add_port(&bridge, &host_veth.name).await
        }
        (HostMasterKind::Ovs, false) => host.ovs_add_port(&named()?, &host_veth.name).await,
    }
}

/// VNI encoded in `name` after `prefix`.
///
/// `None` when the name does not have the prefix or the suffix is not a
/// number: such links are not ours.
pub fn vni_from_name(name: &str, prefix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// Delete the leftovers of VNIs that are no longer declared.
///
/// Host namespace: `br-hs-<N>` bridges (Linux or OVS) and `host<N>` veths.
/// Router namespace: `vni<N>` VXLANs, `br-pe-<N>` bridges and VRFs not in
/// `keep`. Deletion carries on past failures; all of them are returned.
pub async fn remove_non_configured_vnis(
    kernel: &dyn Kernel,
    target_ns: &NsPath,
    keep: &[VniParams],
) -> Result<()> {
    let vnis: HashSet<u32> = keep.iter().map(|p| p.vni).collect();
    let vrfs: HashSet<&str> = keep.iter().map(|p| p.vrf.as_str()).collect();
    let stale = |name: &str, prefix: &str| vni_from_name(name, prefix).is_some_and(|n| !vnis.contains(&n));

    let mut errors = Vec::new();

    let host = kernel.host().await?;
    for link in host.links().await? {
        let result = match &link.kind {
            LinkKind::Bridge if stale(&link.name, HOST_BRIDGE_PREFIX) => {
                delete(host.as_ref(), &link).await
            }
            LinkKind::OpenVSwitch if stale(&link.name, HOST_BRIDGE_PREFIX) => {
                info!(bridge = %link.name, "deleting OVS host bridge");
                host.delete_ovs_bridge(&link.name).await
            }
            LinkKind::Veth if stale(&link.name, HOST_VETH_PREFIX) => {
                delete(host.as_ref(), &link).await
            }
            _ => continue,
        };
        if let Err(e) = result {
            warn!(link = %link.name, error = %e, "failed to delete host link");
            errors.push(e);
        }
    }

    let target = kernel.namespace(target_ns).await?;
    for link in target.links().await? {
        let result = match &link.kind {
            LinkKind::Vxlan(_) if stale(&link.name, VXLAN_PREFIX) => {
                delete(target.as_ref(), &link).await
            }
            LinkKind::Bridge if stale(&link.name, BRIDGE_PREFIX) => {
                delete(target.as_ref(), &link).await
            }
            LinkKind::Vrf { .. } if !vrfs.contains(link.name.as_str()) => {
                delete(target.as_ref(), &link).await
            }
            _ => continue,
        };
        if let Err(e) = result {
            warn!(link = %link.name, netns = %target_ns, error = %e, "failed to delete router link");
            errors.push(e);
        }
    }

    Error::join(errors)
}

/// Remove `host<VNI>`/`pe<VNI>` left over from a configuration that had
/// veth addresses.
async fn remove_veth(host: &dyn NetHandle, target: &dyn NetHandle, vni: u32) -> Result<()> {
    let (host_name, pe_name) = veth_names(vni);
    for (nl, name) in [(host, &host_name), (target, &pe_name)] {
        let Some(link) = nl.link_by_name(name).await? else {
            continue;
        };
        info!(link = %name, vni, "deleting veth of L3 VNI without addresses");
        match nl.delete_link(link.index).await {
            // Went away with its peer.
            Err(Error::LinkNotFound(_)) => {}
            other => other?,
        }
    }
    Ok(())
}

async fn delete(nl: &dyn NetHandle, link: &Link) -> Result<()> {
    info!(link = %link.name, kind = ?link.kind, "deleting link of removed VNI");
    match nl.delete_link(link.index).await {
        // Already gone with its veth peer or master.
        Err(Error::LinkNotFound(_)) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vni_from_name() {
        assert_eq!(vni_from_name("br-pe-100", BRIDGE_PREFIX), Some(100));
        assert_eq!(vni_from_name("host42", HOST_VETH_PREFIX), Some(42));
        assert_eq!(vni_from_name("vni7", VXLAN_PREFIX), Some(7));
        assert_eq!(vni_from_name("hostfoo", HOST_VETH_PREFIX), None);
        assert_eq!(vni_from_name("docker0", BRIDGE_PREFIX), None);
        assert_eq!(vni_from_name("br-hs-100", BRIDGE_PREFIX), None);
    }

    #[test]
    fn test_l3_params_json() {
        let params: L3VniParams = serde_json::from_str(
            r#"{
                "vrf": "red",
                "target_ns": "perouter",
                "vtep": {"ip": "10.0.0.1/32"},
                "vni": 100,
                "vxlan_port": 4789,
                "veth": {"host_ipv4": "192.168.9.2/24", "ns_ipv4": "192.168.9.1/24"}
            }"#,
        )
        .unwrap();
        assert_eq!(params.base.vtep, VtepSource::Ip("10.0.0.1/32".parse().unwrap()));
        let veth = params.veth.unwrap();
        assert_eq!(veth.host(), vec!["192.168.9.2/24".parse::<IpNet>().unwrap()]);
        assert!(veth.host_ipv6.is_none());
    }

    #[test]
    fn test_l2_params_json() {
        let params: L2VniParams = serde_json::from_str(
            r#"{
                "vrf": "red",
                "target_ns": "/proc/1/ns/net",
                "vtep": {"interface": "eth1"},
                "vni": 200,
                "vxlan_port": 4789,
                "host_master": {"kind": "ovs", "auto_create": true}
            }"#,
        )
        .unwrap();
        assert_eq!(params.base.vtep, VtepSource::Interface("eth1".into()));
        assert!(params.gateway_ips.is_empty());
        let master = params.host_master.unwrap();
        assert_eq!(master.kind, HostMasterKind::Ovs);
        assert!(master.auto_create);
        assert!(master.name.is_none());
    }
}
