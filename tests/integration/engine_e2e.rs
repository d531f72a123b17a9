//! End-to-end engine tests
//!
//! A full engine runs on an in-memory device: raw IPv4 frames go in through
//! the device handle, the mock SOCKS5 server and resolver sit upstream, and
//! the frames the engine writes back are decoded and checked.

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::time::timeout;

use tun2socks::config::EngineConfig;
use tun2socks::device::{ChannelDevice, DeviceHandle};
use tun2socks::Engine;

use super::frames::{parse_tcp, parse_udp, tcp_frame, udp_frame, Datagram, Flags, Segment};
use super::mock::{answer_for, MockSocks5, MockSocks5Config, MockUdpResolver};

const WAIT: Duration = Duration::from_secs(5);

fn client() -> SocketAddrV4 {
    "10.0.0.2:40000".parse().unwrap()
}

fn server() -> SocketAddrV4 {
    "93.184.216.34:80".parse().unwrap()
}

fn engine_config(proxy: &MockSocks5, resolver: &MockUdpResolver) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.proxy.url = proxy.url();
    config.forward.dns_resolver = resolver.addr;
    config.device.mtu = 1500;
    config
}

/// Next TCP segment matching `want`, skipping everything else
async fn next_segment(handle: &mut DeviceHandle, want: impl Fn(&Segment) -> bool) -> Segment {
    timeout(WAIT, async {
        loop {
            let frame = handle.recv_frame().await.expect("device closed");
            if let Some(segment) = parse_tcp(&frame) {
                if want(&segment) {
                    return segment;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for a segment")
}

async fn next_datagram(handle: &mut DeviceHandle) -> Datagram {
    timeout(WAIT, async {
        loop {
            let frame = handle.recv_frame().await.expect("device closed");
            if let Some(datagram) = parse_udp(&frame) {
                return datagram;
            }
        }
    })
    .await
    .expect("timed out waiting for a datagram")
}

/// Complete a handshake from `from`; returns the next sequence number the
/// stack will use
async fn handshake(handle: &mut DeviceHandle, from: SocketAddrV4, isn: u32) -> u32 {
    handle
        .send_frame(tcp_frame(from, server(), Flags::Syn, isn, None, &[]))
        .await
        .unwrap();
    let syn_ack = next_segment(handle, |s| s.syn && s.has_ack).await;
    assert_eq!(syn_ack.src, SocketAddr::V4(server()));
    assert_eq!(syn_ack.dst, SocketAddr::V4(from));
    assert_eq!(syn_ack.ack, isn.wrapping_add(1));

    let their_seq = syn_ack.seq.wrapping_add(1);
    handle
        .send_frame(tcp_frame(
            from,
            server(),
            Flags::Ack,
            isn.wrapping_add(1),
            Some(their_seq),
            &[],
        ))
        .await
        .unwrap();
    their_seq
}

#[tokio::test]
async fn test_tcp_flow_through_proxy() {
    let proxy = MockSocks5::start(MockSocks5Config::default()).await;
    let resolver = MockUdpResolver::start(true).await;
    let (device, mut handle) = ChannelDevice::pair(256);

    let mut engine = Engine::new(engine_config(&proxy, &resolver));
    engine.start(device).unwrap();

    let mut their_seq = handshake(&mut handle, client(), 1000).await;
    let mut our_seq = 1001u32;

    handle
        .send_frame(tcp_frame(
            client(),
            server(),
            Flags::Psh,
            our_seq,
            Some(their_seq),
            b"hello",
        ))
        .await
        .unwrap();
    our_seq = our_seq.wrapping_add(5);

    // The mock echoes, so the payload comes back from the original destination
    let mut received = Vec::new();
    while received.len() < 5 {
        let segment = next_segment(&mut handle, |s| !s.payload.is_empty()).await;
        assert_eq!(segment.src, SocketAddr::V4(server()));
        their_seq = segment.seq.wrapping_add(segment.payload.len() as u32);
        received.extend_from_slice(&segment.payload);
        handle
            .send_frame(tcp_frame(
                client(),
                server(),
                Flags::Ack,
                our_seq,
                Some(their_seq),
                &[],
            ))
            .await
            .unwrap();
    }
    assert_eq!(received, b"hello");
    assert_eq!(
        proxy.destinations.lock().as_slice(),
        &[SocketAddr::V4(server())]
    );

    // Client half-close propagates upstream; the echo side closes in turn
    handle
        .send_frame(tcp_frame(
            client(),
            server(),
            Flags::Fin,
            our_seq,
            Some(their_seq),
            &[],
        ))
        .await
        .unwrap();
    let fin = next_segment(&mut handle, |s| s.fin).await;
    assert_eq!(fin.src, SocketAddr::V4(server()));

    let stats = engine.stats();
    assert!(stats.stack.tcp_accepted >= 1);
    assert!(stats.forward.tcp_total >= 1);

    engine.stop().await;
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_udp_dns_through_engine() {
    let proxy = MockSocks5::start(MockSocks5Config::default()).await;
    let resolver = MockUdpResolver::start(true).await;
    let (device, mut handle) = ChannelDevice::pair(256);

    let mut engine = Engine::new(engine_config(&proxy, &resolver));
    engine.start(device).unwrap();

    let dns: SocketAddrV4 = "10.0.0.1:53".parse().unwrap();
    let query = b"\xab\xcd\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x01\x00\x01";
    handle
        .send_frame(udp_frame(client(), dns, query))
        .await
        .unwrap();

    let reply = next_datagram(&mut handle).await;
    assert_eq!(reply.src, SocketAddr::V4(dns));
    assert_eq!(reply.dst, SocketAddr::V4(client()));
    assert_eq!(reply.payload, answer_for(query));

    engine.stop().await;
    let stats = engine.stats();
    assert_eq!(stats.forward.dns_queries, 1);
    assert_eq!(proxy.destinations.lock().len(), 0);
}

#[tokio::test]
async fn test_connection_limit_resets_new_syn() {
    let proxy = MockSocks5::start(MockSocks5Config::default()).await;
    let resolver = MockUdpResolver::start(true).await;
    let (device, mut handle) = ChannelDevice::pair(256);

    let mut config = engine_config(&proxy, &resolver);
    config.stack.max_tcp_connections = 1;
    let mut engine = Engine::new(config);
    engine.start(device).unwrap();

    handshake(&mut handle, client(), 5000).await;

    let second: SocketAddrV4 = "10.0.0.2:40001".parse().unwrap();
    handle
        .send_frame(tcp_frame(second, server(), Flags::Syn, 7000, None, &[]))
        .await
        .unwrap();
    let rst = next_segment(&mut handle, |s| s.dst == SocketAddr::V4(second)).await;
    assert!(rst.rst);

    assert_eq!(engine.stats().stack.tcp_rejected, 1);
    engine.stop().await;
}

#[tokio::test]
async fn test_stop_closes_device() {
    let proxy = MockSocks5::start(MockSocks5Config::default()).await;
    let resolver = MockUdpResolver::start(true).await;
    let (device, mut handle) = ChannelDevice::pair(16);

    let mut engine = Engine::new(engine_config(&proxy, &resolver));
    engine.start(device).unwrap();
    engine.stop().await;

    // The pump shuts the device writer down, ending the frame stream
    let drained = timeout(WAIT, async {
        while handle.recv_frame().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok());

    // Stopping again is a no-op
    engine.stop().await;
}
