//! VXLAN tunnel endpoints.

use crate::error::{Error, Result};
use crate::loopback::LOOPBACK_NAME;
use crate::netlink::{Link, LinkSpec, NetHandle, VxlanInfo};
use crate::underlay::underlay_marker;
use crate::vni::{VniParams, VtepSource};
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::{debug, info};

pub const VXLAN_PREFIX: &str = "vni";

pub fn vxlan_name(vni: u32) -> String {
    format!("{VXLAN_PREFIX}{vni}")
}

/// Ensure the VXLAN device of `params.vni` exists with the expected
/// attributes and is enslaved to the bridge at `bridge_index`.
///
/// Any mismatch in master, id, port, learning, source address or egress
/// device replaces the device. The device is then configured for EVPN:
/// no IPv6 link-local address, ARP/ND suppression on, up.
pub async fn ensure_vxlan(nl: &dyn NetHandle, params: &VniParams, bridge_index: u32) -> Result<Link> {
    let vtep_name = match &params.vtep {
        VtepSource::Ip(_) => LOOPBACK_NAME,
        VtepSource::Interface(name) => name.as_str(),
    };
    let vtep = nl.require_link(vtep_name).await?;
    let local = source_address(nl, &params.vtep, &vtep).await?;

    let info = VxlanInfo {
        id: params.vni,
        port: params.vxlan_port,
        learning: false,
        local: Some(local),
        link: Some(vtep.index),
    };

    let name = vxlan_name(params.vni);
    let vxlan = match nl.link_by_name(&name).await? {
        Some(link) if link.as_vxlan() == Some(&info) && link.master == Some(bridge_index) => link,
        Some(link) => {
            info!(vxlan = %name, kind = ?link.kind, master = ?link.master, "vxlan mismatch, recreating");
            nl.delete_link(link.index).await?;
            create_vxlan(nl, &name, info, bridge_index).await?
        }
        None => create_vxlan(nl, &name, info, bridge_index).await?,
    };

    nl.set_addr_gen_mode_none(&vxlan).await?;
    nl.set_neigh_suppress(&vxlan).await?;
    nl.set_up(vxlan.index).await?;
    Ok(vxlan)
}

async fn create_vxlan(
    nl: &dyn NetHandle,
    name: &str,
    info: VxlanInfo,
    bridge_index: u32,
) -> Result<Link> {
    debug!(vxlan = name, ?info, "creating vxlan");
    nl.add_link(&LinkSpec::Vxlan {
        name: name.to_string(),
        info,
    })
    .await?;
    let vxlan = nl.require_link(name).await?;
    nl.set_master(vxlan.index, bridge_index).await?;
    nl.require_link(name).await
}

/// Source address of encapsulated packets: the configured VTEP IP, or the
/// first IPv4 address of the VTEP interface that is not the underlay marker.
async fn source_address(nl: &dyn NetHandle, vtep: &VtepSource, link: &Link) -> Result<IpAddr> {
    match vtep {
        VtepSource::Ip(ip) => Ok(ip.addr()),
        VtepSource::Interface(name) => {
            let marker = underlay_marker();
            nl.addresses(link.index)
                .await?
                .into_iter()
                .find(|addr| matches!(addr, IpNet::V4(_)) && *addr != marker)
                .map(|addr| addr.addr())
                .ok_or_else(|| {
                    Error::InvalidParams(format!("no IPv4 address found on interface {name}"))
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::{Kernel, LinkKind};
    use crate::netns::NsPath;
    use crate::test_util::FakeKernel;

    fn params(vtep: VtepSource) -> VniParams {
        VniParams {
            vrf: "red".into(),
            target_ns: NsPath::new("perouter"),
            vtep,
            vni: 100,
            vxlan_port: 4789,
        }
    }

    fn setup() -> (FakeKernel, NsPath, u32) {
        let kernel = FakeKernel::new();
        let ns = NsPath::new("perouter");
        kernel.add_namespace(&ns);
        kernel.add_link(Some(&ns), "red", LinkKind::Vrf { table: 1 });
        let bridge = kernel.add_link(Some(&ns), "br-pe-100", LinkKind::Bridge);
        kernel.set_master(Some(&ns), "br-pe-100", "red");
        (kernel, ns, bridge)
    }

    #[tokio::test]
    async fn test_vxlan_on_loopback() {
        let (kernel, ns, bridge) = setup();
        let lound = kernel.add_link(Some(&ns), LOOPBACK_NAME, LinkKind::Dummy);
        let nl = kernel.namespace(&ns).await.unwrap();

        let vxlan = ensure_vxlan(nl.as_ref(), &params(VtepSource::Ip("10.0.0.1/32".parse().unwrap())), bridge)
            .await
            .unwrap();

        let info = vxlan.as_vxlan().unwrap();
        assert_eq!(vxlan.name, "vni100");
        assert_eq!(vxlan.master, Some(bridge));
        assert_eq!(info.id, 100);
        assert_eq!(info.port, 4789);
        assert!(!info.learning);
        assert_eq!(info.local, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(info.link, Some(lound));
        assert!(kernel.neigh_suppress(Some(&ns), "vni100"));
        assert!(kernel.is_up(Some(&ns), "vni100"));
    }

    #[tokio::test]
    async fn test_vxlan_source_from_interface_skips_marker() {
        let (kernel, ns, bridge) = setup();
        kernel.add_nic(
            Some(&ns),
            "eth1",
            [0x02, 0, 0, 0, 0, 1],
            1500,
            &["172.16.1.1/32".parse().unwrap(), "192.168.10.3/24".parse().unwrap()],
        );
        let nl = kernel.namespace(&ns).await.unwrap();

        let vxlan = ensure_vxlan(nl.as_ref(), &params(VtepSource::Interface("eth1".into())), bridge)
            .await
            .unwrap();
        assert_eq!(
            vxlan.as_vxlan().unwrap().local,
            Some("192.168.10.3".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_interface_without_ipv4_fails() {
        let (kernel, ns, bridge) = setup();
        kernel.add_nic(
            Some(&ns),
            "eth1",
            [0x02, 0, 0, 0, 0, 1],
            1500,
            &["172.16.1.1/32".parse().unwrap()],
        );
        let nl = kernel.namespace(&ns).await.unwrap();

        let err = ensure_vxlan(nl.as_ref(), &params(VtepSource::Interface("eth1".into())), bridge)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_changed_port_recreates() {
        let (kernel, ns, bridge) = setup();
        kernel.add_link(Some(&ns), LOOPBACK_NAME, LinkKind::Dummy);
        let nl = kernel.namespace(&ns).await.unwrap();
        let mut p = params(VtepSource::Ip("10.0.0.1/32".parse().unwrap()));

        let first = ensure_vxlan(nl.as_ref(), &p, bridge).await.unwrap();
        let changes = kernel.change_count();
        let same = ensure_vxlan(nl.as_ref(), &p, bridge).await.unwrap();
        assert_eq!(first.index, same.index);
        assert_eq!(kernel.change_count(), changes);

        p.vxlan_port = 4790;
        let second = ensure_vxlan(nl.as_ref(), &p, bridge).await.unwrap();
        assert_ne!(first.index, second.index);
        assert_eq!(second.as_vxlan().unwrap().port, 4790);
    }
}
