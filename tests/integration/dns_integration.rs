//! DNS relay integration tests
//!
//! UDP queries are driven through a real stack: frames are injected on the
//! link endpoint and the replies read back from it. DNS over TCP is tested
//! with an in-memory client against a mock TCP resolver.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use tun2socks::config::{ForwardConfig, ProxyConfig, StackConfig};
use tun2socks::error::ForwardError;
use tun2socks::forward::{relay_dns_tcp, Forwarder};
use tun2socks::socks5::ProxyUrl;
use tun2socks::stack::{build_stack, LinkEndpoint, NetworkProtocol};

use super::frames::{parse_udp, udp_frame};
use super::mock::{answer_for, closed_port, start_tcp_resolver, DuplexClient, MockUdpResolver};

const QUERY: &[u8] = &[
    0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, b'e', b'x',
    b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00, 0x01, 0x00, 0x01,
];

fn client() -> SocketAddrV4 {
    "10.0.0.2:53533".parse().unwrap()
}

fn dns_server() -> SocketAddrV4 {
    "10.0.0.1:53".parse().unwrap()
}

struct StackHarness {
    link: LinkEndpoint,
    forwarder: Forwarder,
    cancel: CancellationToken,
}

impl StackHarness {
    fn start(config: &ForwardConfig) -> Self {
        let proxy = ProxyUrl::parse("socks5://127.0.0.1:1").unwrap();
        let forwarder = Forwarder::new(proxy, &ProxyConfig::default(), config);
        let (stack, link) =
            build_stack(&StackConfig::default(), 1500, Arc::new(forwarder.clone())).unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(stack.run(cancel.clone()));
        Self {
            link,
            forwarder,
            cancel,
        }
    }

    async fn send(&self, frame: bytes::Bytes) {
        self.link
            .inject_inbound(NetworkProtocol::Ipv4, frame)
            .await
            .unwrap();
    }

    /// Next UDP datagram the stack emits, if any arrives within `wait`
    async fn next_datagram(&mut self, wait: Duration) -> Option<super::frames::Datagram> {
        let cancel = self.cancel.clone();
        timeout(wait, async {
            loop {
                let frame = self.link.read_outbound(&cancel).await?;
                if let Some(datagram) = parse_udp(&frame) {
                    return Some(datagram);
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    async fn wait_for(&self, check: impl Fn(&tun2socks::forward::ForwardStatsSnapshot) -> bool) {
        let stats = self.forwarder.stats();
        timeout(Duration::from_secs(5), async {
            while !check(&stats.snapshot()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}

impl Drop for StackHarness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn test_udp_query_relayed_to_resolver() {
    let resolver = MockUdpResolver::start(true).await;
    let config = ForwardConfig {
        dns_resolver: resolver.addr,
        ..ForwardConfig::default()
    };
    let mut harness = StackHarness::start(&config);

    harness.send(udp_frame(client(), dns_server(), QUERY)).await;

    let reply = harness
        .next_datagram(Duration::from_secs(5))
        .await
        .expect("no DNS reply");
    assert_eq!(reply.src, SocketAddr::V4(dns_server()));
    assert_eq!(reply.dst, SocketAddr::V4(client()));
    assert_eq!(reply.payload, answer_for(QUERY));

    // Exactly one query reached the resolver, verbatim
    assert_eq!(resolver.queries.lock().as_slice(), &[QUERY.to_vec()]);
    harness.wait_for(|s| s.dns_queries == 1).await;
}

#[tokio::test]
async fn test_any_destination_on_port_53_is_intercepted() {
    let resolver = MockUdpResolver::start(true).await;
    let config = ForwardConfig {
        dns_resolver: resolver.addr,
        ..ForwardConfig::default()
    };
    let mut harness = StackHarness::start(&config);
    let public_dns: SocketAddrV4 = "8.8.8.8:53".parse().unwrap();

    harness.send(udp_frame(client(), public_dns, QUERY)).await;

    let reply = harness
        .next_datagram(Duration::from_secs(5))
        .await
        .expect("no DNS reply");
    assert_eq!(reply.src, SocketAddr::V4(public_dns));
    assert_eq!(reply.payload, answer_for(QUERY));
}

#[tokio::test]
async fn test_non_dns_udp_is_dropped() {
    let resolver = MockUdpResolver::start(true).await;
    let config = ForwardConfig {
        dns_resolver: resolver.addr,
        ..ForwardConfig::default()
    };
    let mut harness = StackHarness::start(&config);

    let other: SocketAddrV4 = "10.0.0.1:9999".parse().unwrap();
    harness.send(udp_frame(client(), other, b"not dns")).await;

    harness.wait_for(|s| s.udp_ignored == 1).await;
    assert!(harness
        .next_datagram(Duration::from_millis(200))
        .await
        .is_none());
    assert!(resolver.queries.lock().is_empty());
}

#[tokio::test]
async fn test_silent_resolver_times_out() {
    let resolver = MockUdpResolver::start(false).await;
    let config = ForwardConfig {
        dns_resolver: resolver.addr,
        dns_timeout_secs: 1,
        ..ForwardConfig::default()
    };
    let mut harness = StackHarness::start(&config);

    harness.send(udp_frame(client(), dns_server(), QUERY)).await;

    harness.wait_for(|s| s.dns_failures == 1).await;
    assert_eq!(resolver.queries.lock().len(), 1);
    assert!(harness
        .next_datagram(Duration::from_millis(100))
        .await
        .is_none());
}

#[tokio::test]
async fn test_tcp_dns_relay() {
    let resolver = start_tcp_resolver().await;
    let (conn, mut app) = DuplexClient::pair("10.0.0.1:53".parse().unwrap());
    let relay = tokio::spawn(relay_dns_tcp(conn, resolver, Duration::from_secs(5), 4096));

    // Two pipelined length-prefixed queries on one connection
    for _ in 0..2 {
        let mut framed = (QUERY.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(QUERY);
        app.write_all(&framed).await.unwrap();

        let mut len = [0u8; 2];
        app.read_exact(&mut len).await.unwrap();
        let mut reply = vec![0u8; u16::from_be_bytes(len) as usize];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, answer_for(QUERY));
    }

    app.shutdown().await.unwrap();
    let mut rest = Vec::new();
    app.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let copied = relay.await.unwrap().unwrap();
    assert_eq!(copied.client_to_upstream, 2 * (QUERY.len() as u64 + 2));
}

#[tokio::test]
async fn test_tcp_dns_relay_unreachable_resolver() {
    let resolver = closed_port().await;
    let (conn, _app) = DuplexClient::pair("10.0.0.1:53".parse().unwrap());

    let err = relay_dns_tcp(conn, resolver, Duration::from_secs(5), 4096)
        .await
        .unwrap_err();
    assert!(matches!(err, ForwardError::Dns { resolver: r, .. } if r == resolver));
}
