//! IPv4 frame construction and parsing with `smoltcp::wire`

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::Bytes;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, TcpControl, TcpPacket, TcpRepr,
    TcpSeqNumber, UdpPacket, UdpRepr,
};

const UDP_HEADER_LEN: usize = 8;

fn v4(addr: SocketAddrV4) -> Ipv4Address {
    let [a, b, c, d] = addr.ip().octets();
    Ipv4Address::new(a, b, c, d)
}

fn emit_ipv4(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    protocol: IpProtocol,
    payload_len: usize,
) -> (Vec<u8>, Ipv4Repr) {
    let repr = Ipv4Repr {
        src_addr: v4(src),
        dst_addr: v4(dst),
        next_header: protocol,
        payload_len,
        hop_limit: 64,
    };
    let mut buf = vec![0u8; repr.buffer_len() + payload_len];
    repr.emit(
        &mut Ipv4Packet::new_unchecked(&mut buf[..]),
        &ChecksumCapabilities::default(),
    );
    (buf, repr)
}

/// TCP flag set for [`tcp_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flags {
    Syn,
    Ack,
    Psh,
    Fin,
    Rst,
}

/// Build an IPv4 TCP segment
pub fn tcp_frame(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    flags: Flags,
    seq: u32,
    ack: Option<u32>,
    payload: &[u8],
) -> Bytes {
    let control = match flags {
        Flags::Syn => TcpControl::Syn,
        Flags::Fin => TcpControl::Fin,
        Flags::Rst => TcpControl::Rst,
        Flags::Psh => TcpControl::Psh,
        Flags::Ack => TcpControl::None,
    };
    let repr = TcpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
        control,
        seq_number: TcpSeqNumber(seq as i32),
        ack_number: ack.map(|a| TcpSeqNumber(a as i32)),
        window_len: 65535,
        window_scale: None,
        max_seg_size: if flags == Flags::Syn { Some(1460) } else { None },
        sack_permitted: false,
        sack_ranges: [None, None, None],
        timestamp: None,
        payload,
    };

    let (mut buf, ip_repr) = emit_ipv4(src, dst, IpProtocol::Tcp, repr.buffer_len());
    let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
    repr.emit(
        &mut TcpPacket::new_unchecked(ip.payload_mut()),
        &IpAddress::Ipv4(ip_repr.src_addr),
        &IpAddress::Ipv4(ip_repr.dst_addr),
        &ChecksumCapabilities::default(),
    );
    Bytes::from(buf)
}

/// Build an IPv4 UDP datagram
pub fn udp_frame(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Bytes {
    let repr = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    let (mut buf, ip_repr) =
        emit_ipv4(src, dst, IpProtocol::Udp, UDP_HEADER_LEN + payload.len());
    let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
    repr.emit(
        &mut UdpPacket::new_unchecked(ip.payload_mut()),
        &IpAddress::Ipv4(ip_repr.src_addr),
        &IpAddress::Ipv4(ip_repr.dst_addr),
        payload.len(),
        |out| out.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );
    Bytes::from(buf)
}

/// Decoded TCP segment
#[derive(Debug, Clone)]
pub struct Segment {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub has_ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
}

/// Decoded UDP datagram
#[derive(Debug, Clone)]
pub struct Datagram {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: Vec<u8>,
}

fn endpoints(ip: &Ipv4Packet<&[u8]>, src_port: u16, dst_port: u16) -> (SocketAddr, SocketAddr) {
    let src = Ipv4Addr::from(ip.src_addr());
    let dst = Ipv4Addr::from(ip.dst_addr());
    (
        SocketAddr::from((src, src_port)),
        SocketAddr::from((dst, dst_port)),
    )
}

/// Parse a frame as an IPv4 TCP segment
pub fn parse_tcp(frame: &[u8]) -> Option<Segment> {
    let ip = Ipv4Packet::new_checked(frame).ok()?;
    if ip.next_header() != IpProtocol::Tcp {
        return None;
    }
    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
    let (src, dst) = endpoints(&ip, tcp.src_port(), tcp.dst_port());
    Some(Segment {
        src,
        dst,
        seq: tcp.seq_number().0 as u32,
        ack: tcp.ack_number().0 as u32,
        syn: tcp.syn(),
        has_ack: tcp.ack(),
        fin: tcp.fin(),
        rst: tcp.rst(),
        payload: tcp.payload().to_vec(),
    })
}

/// Parse a frame as an IPv4 UDP datagram
pub fn parse_udp(frame: &[u8]) -> Option<Datagram> {
    let ip = Ipv4Packet::new_checked(frame).ok()?;
    if ip.next_header() != IpProtocol::Udp {
        return None;
    }
    let udp = UdpPacket::new_checked(ip.payload()).ok()?;
    let (src, dst) = endpoints(&ip, udp.src_port(), udp.dst_port());
    Some(Datagram {
        src,
        dst,
        payload: udp.payload().to_vec(),
    })
}
