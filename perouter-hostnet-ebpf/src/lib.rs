#![no_std]

// Header sizes
pub const ETH_HLEN: usize = 14;
pub const IPV4_MIN_HLEN: usize = 20;
pub const UDP_HLEN: usize = 8;

// EtherTypes
pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_ARP: u16 = 0x0806;

// IP protocols
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// BGP sessions with the underlay neighbors.
pub const BGP_PORT: u16 = 179;
/// BFD single-hop control and echo.
pub const BFD_CTRL_PORT: u16 = 3784;
pub const BFD_ECHO_PORT: u16 = 4784;
/// IANA VXLAN port, the only one steered into the router.
pub const VXLAN_PORT: u16 = 4789;

/// Capacity of the neighbor map (IPv4 address -> presence flag).
pub const NEIGHBOR_MAP_SIZE: u32 = 64;
/// Capacity of the VNI map (VNI -> presence flag).
pub const VNI_MAP_SIZE: u32 = 1024;

/// Slot in CONFIG_MAP holding the peer interface index.
pub const CONFIG_PEER_IFINDEX: u32 = 0;
