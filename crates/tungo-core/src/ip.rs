//! Minimal IP header views.
//!
//! The data plane needs exactly three things from a packet: whether it is
//! plausibly IP at all, its source (ingress filtering), and its destination
//! (TUN demux and service-frame diversion). No options, no payload.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const V4_HEADER_LEN: usize = 20;
const V6_HEADER_LEN: usize = 40;

/// Source and destination of an IP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpHeader {
    /// Inner source address.
    pub src: IpAddr,
    /// Inner destination address.
    pub dst: IpAddr,
}

/// Parse the addresses out of an IPv4 or IPv6 packet.
///
/// Returns `None` for anything too short or with an unknown version nibble.
#[must_use]
pub fn parse(packet: &[u8]) -> Option<IpHeader> {
    match packet.first()? >> 4 {
        4 if packet.len() >= V4_HEADER_LEN => {
            let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
            let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
            Some(IpHeader {
                src: src.into(),
                dst: dst.into(),
            })
        }
        6 if packet.len() >= V6_HEADER_LEN => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&packet[8..24]);
            dst.copy_from_slice(&packet[24..40]);
            Some(IpHeader {
                src: Ipv6Addr::from(src).into(),
                dst: Ipv6Addr::from(dst).into(),
            })
        }
        _ => None,
    }
}

/// Build a minimal IPv4 packet for tests and keepalive-style traffic.
#[must_use]
pub fn v4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = V4_HEADER_LEN + payload.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64; // ttl
    packet[9] = 0xFD; // protocol: experimental
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet[20..].copy_from_slice(payload);
    packet
}
