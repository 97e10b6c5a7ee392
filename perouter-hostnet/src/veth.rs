//! veth pairs crossing from the host into the router namespace.

use crate::error::{Error, Result};
use crate::netlink::{Link, LinkSpec, NetHandle};
use tracing::{debug, info};

pub const HOST_VETH_PREFIX: &str = "host";
pub const PE_VETH_PREFIX: &str = "pe";

/// Host-side and namespace-side names of the veth pair of `vni`.
pub fn veth_names(vni: u32) -> (String, String) {
    (
        format!("{HOST_VETH_PREFIX}{vni}"),
        format!("{PE_VETH_PREFIX}{vni}"),
    )
}

/// Ensure the veth pair of `vni` exists with its namespace side in
/// `target`. Returns `(host side, namespace side)`.
pub async fn ensure_veth(
    host: &dyn NetHandle,
    target: &dyn NetHandle,
    vni: u32,
) -> Result<(Link, Link)> {
    let (host_name, pe_name) = veth_names(vni);
    ensure_namespaced_veth(host, target, &host_name, &pe_name).await
}

/// Ensure veth `host_name` exists in the host namespace with its peer
/// `pe_name` moved into `target`.
///
/// A peer already present in `target` means the pair was transferred
/// before; otherwise the peer is looked up on the host and moved.
pub async fn ensure_namespaced_veth(
    host: &dyn NetHandle,
    target: &dyn NetHandle,
    host_name: &str,
    pe_name: &str,
) -> Result<(Link, Link)> {
    let host_side = match host.link_by_name(host_name).await? {
        Some(link) if link.is_veth() => link,
        Some(link) => {
            info!(veth = host_name, kind = ?link.kind, "link is not a veth, recreating");
            host.delete_link(link.index).await?;
            create_veth(host, host_name, pe_name).await?
        }
        None => create_veth(host, host_name, pe_name).await?,
    };

    if let Some(pe_side) = target.link_by_name(pe_name).await? {
        debug!(veth = pe_name, "namespace leg already in place");
        return Ok((host_side, pe_side));
    }

    let target_ns = target
        .namespace()
        .ok_or_else(|| Error::InvalidParams(format!("{pe_name} must move to a namespace")))?;
    let peer = host.require_link(pe_name).await?;
    host.move_to_namespace(peer.index, target_ns).await?;
    debug!(veth = pe_name, netns = %target_ns, "namespace leg moved");

    let pe_side = target.require_link(pe_name).await?;
    Ok((host_side, pe_side))
}

async fn create_veth(nl: &dyn NetHandle, name: &str, peer: &str) -> Result<Link> {
    debug!(veth = name, peer, "creating veth pair");
    nl.add_link(&LinkSpec::Veth {
        name: name.to_string(),
        peer: peer.to_string(),
    })
    .await?;
    nl.require_link(name).await
}
