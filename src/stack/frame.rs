//! Lightweight frame inspection
//!
//! Reads just enough of an IP frame to classify it before it reaches the
//! stack: the network protocol from the version nibble, and for TCP/UDP the
//! flow tuple and TCP flags. Nothing here validates checksums.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

const TCP_FLAG_FIN: u8 = 0x01;
const TCP_FLAG_SYN: u8 = 0x02;
const TCP_FLAG_RST: u8 = 0x04;
const TCP_FLAG_ACK: u8 = 0x10;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

/// Network-layer protocol of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkProtocol {
    Ipv4,
    Ipv6,
}

impl NetworkProtocol {
    /// Classify a frame by the high nibble of its first byte
    ///
    /// Returns `None` for empty frames and any version other than 4 or 6.
    #[must_use]
    pub fn classify(frame: &[u8]) -> Option<Self> {
        match frame.first()? >> 4 {
            4 => Some(Self::Ipv4),
            6 => Some(Self::Ipv6),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "IPv4"),
            Self::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// Transport flow carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowInfo {
    /// Originating endpoint (the local client)
    pub src: SocketAddr,
    /// Original destination endpoint
    pub dst: SocketAddr,
    /// IP protocol number
    pub protocol: u8,
    /// TCP flags byte, zero for UDP
    pub tcp_flags: u8,
}

impl FlowInfo {
    #[must_use]
    pub const fn is_tcp(&self) -> bool {
        self.protocol == IPPROTO_TCP
    }

    #[must_use]
    pub const fn is_udp(&self) -> bool {
        self.protocol == IPPROTO_UDP
    }

    /// Initial SYN of a new TCP connection
    #[must_use]
    pub const fn is_tcp_syn(&self) -> bool {
        self.is_tcp()
            && self.tcp_flags & TCP_FLAG_SYN != 0
            && self.tcp_flags & (TCP_FLAG_ACK | TCP_FLAG_RST | TCP_FLAG_FIN) == 0
    }
}

/// Extract the TCP/UDP flow of a frame
///
/// Returns `None` for other protocols, truncated headers, non-initial IPv4
/// fragments and IPv6 frames with extension headers.
#[must_use]
pub fn inspect(frame: &[u8]) -> Option<FlowInfo> {
    match NetworkProtocol::classify(frame)? {
        NetworkProtocol::Ipv4 => inspect_ipv4(frame),
        NetworkProtocol::Ipv6 => inspect_ipv6(frame),
    }
}

fn inspect_ipv4(frame: &[u8]) -> Option<FlowInfo> {
    if frame.len() < IPV4_MIN_HEADER {
        return None;
    }

    let ihl = usize::from(frame[0] & 0x0f) * 4;
    if ihl < IPV4_MIN_HEADER || frame.len() < ihl {
        return None;
    }

    // Only the first fragment carries the transport header
    let fragment_offset = u16::from_be_bytes([frame[6], frame[7]]) & 0x1fff;
    if fragment_offset != 0 {
        return None;
    }

    let src = IpAddr::V4(Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]));
    transport(frame[9], src, dst, &frame[ihl..])
}

fn inspect_ipv6(frame: &[u8]) -> Option<FlowInfo> {
    if frame.len() < IPV6_HEADER {
        return None;
    }

    let mut src_octets = [0u8; 16];
    let mut dst_octets = [0u8; 16];
    src_octets.copy_from_slice(&frame[8..24]);
    dst_octets.copy_from_slice(&frame[24..40]);

    let src = IpAddr::V6(Ipv6Addr::from(src_octets));
    let dst = IpAddr::V6(Ipv6Addr::from(dst_octets));
    transport(frame[6], src, dst, &frame[IPV6_HEADER..])
}

fn transport(protocol: u8, src: IpAddr, dst: IpAddr, payload: &[u8]) -> Option<FlowInfo> {
    let tcp_flags = match protocol {
        IPPROTO_TCP if payload.len() >= 14 => payload[13],
        IPPROTO_UDP if payload.len() >= 8 => 0,
        _ => return None,
    };

    let src_port = u16::from_be_bytes([payload[0], payload[1]]);
    let dst_port = u16::from_be_bytes([payload[2], payload[3]]);

    Some(FlowInfo {
        src: SocketAddr::new(src, src_port),
        dst: SocketAddr::new(dst, dst_port),
        protocol,
        tcp_flags,
    })
}
