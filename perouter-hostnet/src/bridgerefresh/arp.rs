//! Unicast ARP requests over an `AF_PACKET` socket.

use crate::error::Result;
use crate::netlink::{ArpRequest, MacAddr};
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Ipv4Address,
};
use socket2::{Domain, SockAddr, Socket, Type};
use std::mem;
use tracing::trace;

/// Ethernet header size
const ETHERNET_HEADER_SIZE: usize = 14;

/// ARP payload size for Ethernet + IPv4
const ARP_PACKET_SIZE: usize = 28;

/// Build the Ethernet frame carrying `request`.
///
/// The frame is addressed to the target's MAC, not broadcast, so only the
/// neighbour being refreshed sees it.
pub fn build_request(request: &ArpRequest) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HEADER_SIZE + ARP_PACKET_SIZE];

    let sender = EthernetAddress(request.sender_mac);
    let target = EthernetAddress(request.target_mac);

    let eth_repr = EthernetRepr {
        src_addr: sender,
        dst_addr: target,
        ethertype: EthernetProtocol::Arp,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut frame[..]);
    eth_repr.emit(&mut eth_frame);

    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: sender,
        source_protocol_addr: Ipv4Address(request.sender_ip.octets()),
        target_hardware_addr: target,
        target_protocol_addr: Ipv4Address(request.target_ip.octets()),
    };
    let mut arp_packet = ArpPacket::new_unchecked(eth_frame.payload_mut());
    arp_repr.emit(&mut arp_packet);

    frame
}

/// Send `request` out of interface `if_index` in the calling thread's
/// network namespace.
pub fn send_request(if_index: u32, request: &ArpRequest) -> Result<()> {
    let frame = build_request(request);

    // Protocol 0: send only, nothing is queued for receive.
    let socket = Socket::new(Domain::PACKET, Type::RAW, None)?;

    let addr = packet_addr(if_index, &request.target_mac);
    let sent = socket.send_to(&frame, &addr)?;

    trace!(if_index, bytes = sent, %request, "ARP request sent");
    Ok(())
}

/// `link_layer_addr` as a socket address for `Socket::send_to`.
fn packet_addr(if_index: u32, dst: &MacAddr) -> SockAddr {
    let ll = link_layer_addr(if_index, dst);
    // SAFETY: sockaddr_storage is zeroed, and large and aligned enough for
    // any address family; the length covers exactly the sockaddr_ll written.
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        std::ptr::write(
            (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_ll>(),
            ll,
        );
        SockAddr::new(storage, mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t)
    }
}

fn link_layer_addr(if_index: u32, dst: &MacAddr) -> libc::sockaddr_ll {
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
    addr.sll_ifindex = if_index as i32;
    addr.sll_halen = 6;
    addr.sll_addr[..6].copy_from_slice(dst);
    addr
}
