//! Router-side and host-side Linux bridges.

use crate::error::Result;
use crate::netlink::{Link, LinkSpec, MacAddr, NetHandle, format_mac};
use tracing::{debug, info};

/// Prefix of the bridge backing a VNI inside the router namespace.
pub const BRIDGE_PREFIX: &str = "br-pe-";

/// Prefix of auto-created bridges in the host namespace.
pub const HOST_BRIDGE_PREFIX: &str = "br-hs-";

pub fn bridge_name(vni: u32) -> String {
    format!("{BRIDGE_PREFIX}{vni}")
}

pub fn host_bridge_name(vni: u32) -> String {
    format!("{HOST_BRIDGE_PREFIX}{vni}")
}

/// Ensure the router bridge of `vni` exists, is enslaved to the VRF at
/// `vrf_index`, has no IPv6 link-local address and is up.
pub async fn ensure_bridge(nl: &dyn NetHandle, vni: u32, vrf_index: u32) -> Result<Link> {
    let name = bridge_name(vni);
    let bridge = match nl.link_by_name(&name).await? {
        Some(link) if link.is_bridge() && link.master == Some(vrf_index) => link,
        Some(link) => {
            info!(bridge = %name, kind = ?link.kind, master = ?link.master, "bridge mismatch, recreating");
            nl.delete_link(link.index).await?;
            create_bridge(nl, &name, Some(vrf_index)).await?
        }
        None => create_bridge(nl, &name, Some(vrf_index)).await?,
    };

    nl.set_addr_gen_mode_none(&bridge).await?;
    nl.set_up(bridge.index).await?;
    Ok(bridge)
}

/// Ensure the host bridge `br-hs-<vni>` exists and is up.
pub async fn ensure_host_bridge(nl: &dyn NetHandle, vni: u32) -> Result<Link> {
    let name = host_bridge_name(vni);
    let bridge = match nl.link_by_name(&name).await? {
        Some(link) if link.is_bridge() => link,
        Some(link) => {
            info!(bridge = %name, kind = ?link.kind, "host bridge is not a bridge, recreating");
            nl.delete_link(link.index).await?;
            create_bridge(nl, &name, None).await?
        }
        None => create_bridge(nl, &name, None).await?,
    };

    nl.set_up(bridge.index).await?;
    Ok(bridge)
}

async fn create_bridge(nl: &dyn NetHandle, name: &str, master: Option<u32>) -> Result<Link> {
    debug!(bridge = name, ?master, "creating bridge");
    nl.add_link(&LinkSpec::Bridge {
        name: name.to_string(),
    })
    .await?;
    let bridge = nl.require_link(name).await?;
    if let Some(master) = master {
        nl.set_master(bridge.index, master).await?;
    }
    nl.require_link(name).await
}

/// MAC shared by every node for the distributed gateway of `vni`.
///
/// `02:00` followed by `vni + 1` as a big-endian 32-bit integer.
pub fn fixed_bridge_mac(vni: u32) -> MacAddr {
    let id = (vni.wrapping_add(1) as i32).to_be_bytes();
    [0x02, 0x00, id[0], id[1], id[2], id[3]]
}

/// Give bridge `name` the distributed gateway MAC of `vni`.
///
/// The bridge is re-read first since adding ports can change its MAC.
pub async fn ensure_bridge_fixed_mac(nl: &dyn NetHandle, name: &str, vni: u32) -> Result<()> {
    let bridge = nl.require_link(name).await?;
    let mac = fixed_bridge_mac(vni);
    if bridge.mac == Some(mac) {
        return Ok(());
    }
    debug!(bridge = name, mac = %format_mac(&mac), "setting fixed bridge MAC");
    nl.set_mac(bridge.index, mac).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::{Kernel, LinkKind};
    use crate::netns::NsPath;
    use crate::test_util::FakeKernel;

    #[test]
    fn test_names() {
        assert_eq!(bridge_name(100), "br-pe-100");
        assert_eq!(host_bridge_name(100), "br-hs-100");
    }

    #[test]
    fn test_fixed_mac() {
        assert_eq!(fixed_bridge_mac(100), [0x02, 0x00, 0x00, 0x00, 0x00, 0x65]);
        assert_eq!(fixed_bridge_mac(0xffff), [0x02, 0x00, 0x00, 0x01, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_bridge_enslaved_to_vrf() {
        let kernel = FakeKernel::new();
        let ns = NsPath::new("perouter");
        kernel.add_namespace(&ns);
        let vrf = kernel.add_link(Some(&ns), "red", LinkKind::Vrf { table: 1 });
        let nl = kernel.namespace(&ns).await.unwrap();

        let bridge = ensure_bridge(nl.as_ref(), 100, vrf).await.unwrap();

        assert_eq!(bridge.name, "br-pe-100");
        assert_eq!(bridge.master, Some(vrf));
        assert!(kernel.is_up(Some(&ns), "br-pe-100"));
        assert!(kernel.addr_gen_mode_none(Some(&ns), "br-pe-100"));
    }

    #[tokio::test]
    async fn test_bridge_with_other_master_is_recreated() {
        let kernel = FakeKernel::new();
        let ns = NsPath::new("perouter");
        kernel.add_namespace(&ns);
        kernel.add_link(Some(&ns), "red", LinkKind::Vrf { table: 1 });
        let blue = kernel.add_link(Some(&ns), "blue", LinkKind::Vrf { table: 2 });
        let stale = kernel.add_link(Some(&ns), "br-pe-100", LinkKind::Bridge);
        kernel.set_master(Some(&ns), "br-pe-100", "red");
        let nl = kernel.namespace(&ns).await.unwrap();

        let bridge = ensure_bridge(nl.as_ref(), 100, blue).await.unwrap();
        assert_ne!(bridge.index, stale);
        assert_eq!(bridge.master, Some(blue));
    }

    #[tokio::test]
    async fn test_fixed_mac_written_once() {
        let kernel = FakeKernel::new();
        let bridge = kernel.add_link(None, "br-pe-100", LinkKind::Bridge);
        let nl = kernel.host().await.unwrap();

        ensure_bridge_fixed_mac(nl.as_ref(), "br-pe-100", 100).await.unwrap();
        let changes = kernel.change_count();
        ensure_bridge_fixed_mac(nl.as_ref(), "br-pe-100", 100).await.unwrap();

        assert_eq!(kernel.change_count(), changes);
        let link = kernel.link(None, "br-pe-100").unwrap();
        assert_eq!(link.index, bridge);
        assert_eq!(link.mac, Some(fixed_bridge_mac(100)));
    }
}
