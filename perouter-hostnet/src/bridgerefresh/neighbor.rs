use crate::netlink::{MacAddr, Neighbour, NeighbourState};
use std::net::{IpAddr, Ipv4Addr};

/// A neighbour that needs an ARP probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleNeighbour {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
}

/// IPv4 entries in STALE state that carry both a MAC and an IP.
pub fn stale_neighbors(neighbours: &[Neighbour]) -> Vec<StaleNeighbour> {
    neighbours
        .iter()
        .filter(|n| n.state == NeighbourState::Stale)
        .filter_map(|n| match (n.ip, n.mac) {
            (Some(IpAddr::V4(ip)), Some(mac)) => Some(StaleNeighbour { ip, mac }),
            _ => None,
        })
        .collect()
}
