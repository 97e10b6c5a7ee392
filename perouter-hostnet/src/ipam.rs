//! Deterministic per-node address allocation.
//!
//! Every node derives its addresses from a shared pool and its own index,
//! so no allocation state is ever stored.

use crate::error::{Error, Result};
use ipnet::{IpNet, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Host-side and namespace-side address of one veth pair, one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VethIpsForFamily {
    pub host_side: IpNet,
    pub pe_side: IpNet,
}

/// Veth addresses for both families. At least one is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VethIps {
    pub ipv4: Option<VethIpsForFamily>,
    pub ipv6: Option<VethIpsForFamily>,
}

/// Veth endpoints for node `index`.
///
/// The namespace side is the first address of the pool (or the second one
/// when the first ends in a zero byte); the host side sits `index + 1`
/// addresses after it.
pub fn veth_ips(pool_v4: Option<&str>, pool_v6: Option<&str>, index: u32) -> Result<VethIps> {
    if pool_v4.is_none() && pool_v6.is_none() {
        return Err(Error::Ipam(
            "at least one pool must be provided (IPv4 or IPv6)".to_string(),
        ));
    }

    let ipv4 = pool_v4
        .map(|pool| veth_ips_for_family(pool, index))
        .transpose()
        .map_err(|e| Error::Ipam(format!("failed to get IPv4 veth IPs: {e}")))?;
    let ipv6 = pool_v6
        .map(|pool| veth_ips_for_family(pool, index))
        .transpose()
        .map_err(|e| Error::Ipam(format!("failed to get IPv6 veth IPs: {e}")))?;

    Ok(VethIps { ipv4, ipv6 })
}

fn veth_ips_for_family(pool: &str, index: u32) -> Result<VethIpsForFamily> {
    let cidr = parse_pool(pool)?;

    let mut pe_index = 0u128;
    let mut pe = host(&cidr, pe_index)?;
    if last_byte(pe) == 0 {
        pe_index = 1;
        pe = host(&cidr, pe_index)?;
    }
    let host_side = host(&cidr, pe_index + u128::from(index) + 1)?;

    Ok(VethIpsForFamily {
        host_side: with_prefix(host_side, cidr.prefix_len())?,
        pe_side: with_prefix(pe, cidr.prefix_len())?,
    })
}

/// VTEP address of node `index`: the `index`-th pool address as a host route.
pub fn vtep_ip(pool: &str, index: u32) -> Result<IpNet> {
    let cidr = parse_pool(pool)?;
    let ip = host(&cidr, u128::from(index))?;
    with_prefix(ip, cidr.max_prefix_len())
}

/// Router ID of node `index`.
pub fn router_id(pool: &str, index: u32) -> Result<IpAddr> {
    let cidr = parse_pool(pool)?;
    host(&cidr, u128::from(index) + 1).map_err(|e| {
        Error::Ipam(format!(
            "failed to get router id for node {index} from cidr {cidr}: {e}"
        ))
    })
}

/// SRv6 locator of node `index`.
///
/// The index is added to the 16-bit group right after the pool prefix
/// (group 3 for /48, group 2 for /64, group 5 for /96, counted from the
/// most significant group) and carries into higher groups on overflow.
pub fn locator(pool: &str, index: u32) -> Result<Ipv6Net> {
    let cidr = match parse_pool(pool)? {
        IpNet::V6(net) => net,
        IpNet::V4(_) => {
            return Err(Error::Ipam(
                "only IPv6 addresses are supported".to_string(),
            ));
        }
    };

    let group = match cidr.prefix_len() {
        48 => 3,
        64 => 2,
        96 => 5,
        other => {
            return Err(Error::Ipam(format!(
                "only /48, /64, and /96 prefix lengths are supported, got /{other}"
            )));
        }
    };

    let mut segments = cidr.network().segments();
    let mut carry = u64::from(index);
    let mut i = group;
    loop {
        if carry == 0 {
            break;
        }
        let current = u64::from(segments[i]) + carry;
        segments[i] = (current & 0xffff) as u16;
        carry = current >> 16;
        if i == 0 {
            break;
        }
        i -= 1;
    }

    Ipv6Net::new(Ipv6Addr::from(segments), cidr.prefix_len())
        .map_err(|e| Error::Ipam(e.to_string()))
}

/// Number of addresses in a pool.
pub fn ips_in_cidr(pool: &str) -> Result<u128> {
    let cidr = parse_pool(pool)?;
    Ok(address_count(&cidr))
}

fn parse_pool(pool: &str) -> Result<IpNet> {
    pool.parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|e| Error::Ipam(format!("failed to parse pool {pool}: {e}")))
}

fn address_count(cidr: &IpNet) -> u128 {
    let host_bits = u32::from(cidr.max_prefix_len() - cidr.prefix_len());
    1u128.checked_shl(host_bits).unwrap_or(u128::MAX)
}

/// The `n`-th address of `cidr`, counting the network address as 0.
fn host(cidr: &IpNet, n: u128) -> Result<IpAddr> {
    if n >= address_count(cidr) {
        return Err(Error::Ipam(format!(
            "failed to get {n} address from {cidr}: out of range"
        )));
    }
    Ok(match cidr.network() {
        IpAddr::V4(net) => IpAddr::V4(Ipv4Addr::from(u32::from(net) + n as u32)),
        IpAddr::V6(net) => IpAddr::V6(Ipv6Addr::from(u128::from(net) + n)),
    })
}

fn last_byte(ip: IpAddr) -> u8 {
    match ip {
        IpAddr::V4(v4) => v4.octets()[3],
        IpAddr::V6(v6) => v6.octets()[15],
    }
}

fn with_prefix(ip: IpAddr, prefix: u8) -> Result<IpNet> {
    IpNet::new(ip, prefix).map_err(|e| Error::Ipam(e.to_string()))
}
