//! VRF devices.

use crate::error::{Error, Result};
use crate::netlink::{IpFamily, Link, LinkSpec, NetHandle};
use std::collections::HashSet;
use tracing::{debug, info};

/// Ensure VRF `name` exists, is up, and drops traffic it has no route for.
///
/// An existing VRF is kept with whatever table it was created with. A link
/// of another kind carrying the name is replaced.
pub async fn ensure_vrf(nl: &dyn NetHandle, name: &str) -> Result<Link> {
    let vrf = match nl.link_by_name(name).await? {
        Some(link) if link.is_vrf() => link,
        Some(link) => {
            info!(vrf = name, kind = ?link.kind, "link is not a VRF, recreating");
            nl.delete_link(link.index).await?;
            create_vrf(nl, name).await?
        }
        None => create_vrf(nl, name).await?,
    };

    nl.set_up(vrf.index).await?;

    let table = vrf
        .vrf_table()
        .ok_or_else(|| Error::InvalidParams(format!("{name} has no routing table")))?;
    ensure_unreachable_defaults(nl, table).await?;

    Ok(vrf)
}

async fn create_vrf(nl: &dyn NetHandle, name: &str) -> Result<Link> {
    let table = free_table_id(&nl.links().await?)?;
    debug!(vrf = name, table, "creating VRF");
    nl.add_link(&LinkSpec::Vrf {
        name: name.to_string(),
        table,
    })
    .await?;
    nl.require_link(name).await
}

/// Lowest routing table id, starting at 1, not bound to any VRF in `links`.
pub fn free_table_id(links: &[Link]) -> Result<u32> {
    let taken: HashSet<u32> = links.iter().filter_map(Link::vrf_table).collect();
    (1..u32::MAX)
        .find(|id| !taken.contains(id))
        .ok_or_else(|| Error::InvalidParams("no free routing table id".into()))
}

/// Install IPv4 and IPv6 unreachable default routes in `table` unless
/// present, so lookups that miss the VRF stop there instead of falling
/// through to the next `ip rule`.
async fn ensure_unreachable_defaults(nl: &dyn NetHandle, table: u32) -> Result<()> {
    for family in [IpFamily::V4, IpFamily::V6] {
        if nl.has_unreachable_default(table, family).await? {
            continue;
        }
        debug!(table, ?family, "adding unreachable default route");
        nl.add_unreachable_default(table, family).await?;
    }
    Ok(())
}
