//! The `lound` dummy device carrying the VTEP address.

use crate::error::Result;
use crate::netlink::{Kernel, Link, LinkSpec, NetHandle, ensure_address, is_link_local};
use crate::netns::NsPath;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const LOOPBACK_NAME: &str = "lound";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackParams {
    pub target_ns: NsPath,
    pub vtep_ip: IpNet,
}

/// Ensure `lound` exists in `params.target_ns` carrying the VTEP IP.
pub async fn setup_loopback(kernel: &dyn Kernel, params: &LoopbackParams) -> Result<()> {
    debug!(netns = %params.target_ns, vtep_ip = %params.vtep_ip, "setting up loopback");
    let nl = kernel.namespace(&params.target_ns).await?;
    ensure_loopback(nl.as_ref(), params.vtep_ip).await?;
    Ok(())
}

/// Ensure `lound` exists, is up and carries exactly `vtep_ip`.
///
/// A previous VTEP address is removed. IPv6 link-local addresses are left
/// to the kernel.
pub async fn ensure_loopback(nl: &dyn NetHandle, vtep_ip: IpNet) -> Result<Link> {
    let loopback = match nl.link_by_name(LOOPBACK_NAME).await? {
        Some(link) if link.is_dummy() => link,
        Some(link) => {
            info!(kind = ?link.kind, "{LOOPBACK_NAME} is not a dummy, recreating");
            nl.delete_link(link.index).await?;
            create_loopback(nl).await?
        }
        None => create_loopback(nl).await?,
    };

    for addr in nl.addresses(loopback.index).await? {
        if addr != vtep_ip && !is_link_local(&addr) {
            info!(old = %addr, new = %vtep_ip, "replacing VTEP address");
            nl.delete_address(loopback.index, addr).await?;
        }
    }
    ensure_address(nl, loopback.index, vtep_ip).await?;
    nl.set_up(loopback.index).await?;
    Ok(loopback)
}

async fn create_loopback(nl: &dyn NetHandle) -> Result<Link> {
    debug!("creating {LOOPBACK_NAME}");
    nl.add_link(&LinkSpec::Dummy {
        name: LOOPBACK_NAME.to_string(),
    })
    .await?;
    nl.require_link(LOOPBACK_NAME).await
}
