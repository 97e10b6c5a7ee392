//! TC ingress program for `ul-host`.
//!
//! Whatever the router sends out of `ul-pe` arrives here and is pushed
//! straight out of the physical NIC.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::TC_ACT_OK,
    helpers::bpf_redirect,
    macros::{classifier, map},
    maps::Array,
    programs::TcContext,
};

use perouter_hostnet_ebpf::CONFIG_PEER_IFINDEX;

/// Slot 0: ifindex of the physical NIC
#[map]
static CONFIG_MAP: Array<u32> = Array::with_max_entries(1, 0);

#[classifier]
pub fn ul_host_ingress(_ctx: TcContext) -> i32 {
    match CONFIG_MAP.get(CONFIG_PEER_IFINDEX) {
        Some(nic_ifindex) => unsafe { bpf_redirect(*nic_ifindex, 0) as i32 },
        None => TC_ACT_OK,
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
