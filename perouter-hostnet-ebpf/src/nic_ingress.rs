//! TC ingress program for the shared underlay NIC.
//!
//! The NIC stays in the host namespace. This program picks out the traffic
//! the router namespace must see and redirects it to `ul-host`, whose peer
//! `ul-pe` lives inside the router:
//! - ARP is cloned to the router and still delivered to the host
//! - BGP and BFD from a configured neighbor are redirected
//! - VXLAN for an active VNI is redirected
//!
//! Everything else is left to the host stack.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::TC_ACT_OK,
    helpers::bpf_redirect,
    macros::{classifier, map},
    maps::{Array, HashMap},
    programs::TcContext,
};

use perouter_hostnet_ebpf::{
    BFD_CTRL_PORT, BFD_ECHO_PORT, BGP_PORT, CONFIG_PEER_IFINDEX, ETH_HLEN, ETH_P_ARP, ETH_P_IP,
    IPPROTO_TCP, IPPROTO_UDP, IPV4_MIN_HLEN, NEIGHBOR_MAP_SIZE, UDP_HLEN, VNI_MAP_SIZE, VXLAN_PORT,
};

/// Underlay neighbors whose control traffic belongs to the router
#[map]
static NEIGHBOR_MAP: HashMap<[u8; 4], u8> = HashMap::with_max_entries(NEIGHBOR_MAP_SIZE, 0);

/// VNIs configured in the router
#[map]
static VNI_MAP: HashMap<u32, u8> = HashMap::with_max_entries(VNI_MAP_SIZE, 0);

/// Slot 0: ifindex of ul-host
#[map]
static CONFIG_MAP: Array<u32> = Array::with_max_entries(1, 0);

#[classifier]
pub fn nic_ingress(ctx: TcContext) -> i32 {
    match try_nic_ingress(&ctx) {
        Ok(action) => action,
        Err(_) => TC_ACT_OK, // Truncated packet: let the host handle it
    }
}

#[inline(always)]
fn try_nic_ingress(ctx: &TcContext) -> Result<i32, i64> {
    let ul_host_ifindex = match CONFIG_MAP.get(CONFIG_PEER_IFINDEX) {
        Some(ifindex) => *ifindex,
        None => return Ok(TC_ACT_OK),
    };

    let eth_type = u16::from_be(ctx.load::<u16>(12)?);

    if eth_type == ETH_P_ARP {
        // Both the host and the router resolve on this wire
        let _ = ctx.clone_redirect(ul_host_ifindex, 0);
        return Ok(TC_ACT_OK);
    }

    if eth_type != ETH_P_IP {
        return Ok(TC_ACT_OK);
    }

    let version_ihl: u8 = ctx.load(ETH_HLEN)?;
    let ip_hlen = ((version_ihl & 0x0f) as usize) * 4;
    if ip_hlen < IPV4_MIN_HLEN {
        return Ok(TC_ACT_OK);
    }

    let protocol: u8 = ctx.load(ETH_HLEN + 9)?;
    let src_addr: [u8; 4] = ctx.load(ETH_HLEN + 12)?;
    let l4 = ETH_HLEN + ip_hlen;

    match protocol {
        IPPROTO_TCP => {
            let sport = u16::from_be(ctx.load::<u16>(l4)?);
            let dport = u16::from_be(ctx.load::<u16>(l4 + 2)?);

            if (sport == BGP_PORT || dport == BGP_PORT) && is_neighbor(&src_addr) {
                return Ok(redirect(ul_host_ifindex));
            }
            Ok(TC_ACT_OK)
        }
        IPPROTO_UDP => {
            let dport = u16::from_be(ctx.load::<u16>(l4 + 2)?);

            if dport == BFD_CTRL_PORT || dport == BFD_ECHO_PORT {
                if is_neighbor(&src_addr) {
                    return Ok(redirect(ul_host_ifindex));
                }
                return Ok(TC_ACT_OK);
            }

            if dport == VXLAN_PORT {
                // VNI is the upper 24 bits of the second VXLAN header word
                let word = u32::from_be(ctx.load::<u32>(l4 + UDP_HLEN + 4)?);
                let vni = word >> 8;
                if VNI_MAP.get_ptr(&vni).is_some() {
                    return Ok(redirect(ul_host_ifindex));
                }
            }
            Ok(TC_ACT_OK)
        }
        _ => Ok(TC_ACT_OK),
    }
}

#[inline(always)]
fn is_neighbor(addr: &[u8; 4]) -> bool {
    NEIGHBOR_MAP.get_ptr(addr).is_some()
}

#[inline(always)]
fn redirect(ifindex: u32) -> i32 {
    unsafe { bpf_redirect(ifindex, 0) as i32 }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
