//! SOCKS5 client integration tests
//!
//! The client is run against a mock SOCKS5 server to verify RFC 1928/1929
//! compliance and error reporting.
//!
//! # Test Categories
//!
//! 1. **Protocol Tests**: method negotiation, CONNECT encoding, bound address
//! 2. **Authentication Tests**: username/password flow
//! 3. **Error Handling Tests**: failure replies, malformed replies, timeouts

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tun2socks::error::Socks5Error;
use tun2socks::socks5::{dial, AuthMethod, Command, ProxyUrl};

use super::mock::{
    closed_port, AfterConnect, MockSocks5, MockSocks5Config, AUTH_METHOD_NONE,
    AUTH_METHOD_PASSWORD, REPLY_CONNECTION_REFUSED,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn target() -> SocketAddr {
    "93.184.216.34:80".parse().unwrap()
}

// ============================================================================
// Protocol Tests
// ============================================================================

#[tokio::test]
async fn test_connect_without_auth() {
    let server = MockSocks5::start(MockSocks5Config::default()).await;
    let proxy = ProxyUrl::parse(&server.url()).unwrap();

    let mut session = dial(&proxy, TIMEOUT).await.unwrap();
    assert_eq!(session.auth(), AuthMethod::None);

    let bound = session.send_command(Command::Connect, target()).await.unwrap();
    assert_eq!(bound.ip().to_string(), "127.0.0.1");
    assert_eq!(bound.port(), server.addr.port());

    assert_eq!(server.offered_methods.lock()[0], vec![AUTH_METHOD_NONE]);
    assert_eq!(server.destinations.lock()[0], target());
}

#[tokio::test]
async fn test_connect_ipv6_destination() {
    let server = MockSocks5::start(MockSocks5Config::default()).await;
    let proxy = ProxyUrl::parse(&server.url()).unwrap();
    let dst: SocketAddr = "[2606:2800:220:1:248:1893:25c8:1946]:443".parse().unwrap();

    let mut session = dial(&proxy, TIMEOUT).await.unwrap();
    session.send_command(Command::Connect, dst).await.unwrap();

    assert_eq!(server.destinations.lock()[0], dst);
}

#[tokio::test]
async fn test_stream_usable_after_connect() {
    let server = MockSocks5::start(MockSocks5Config {
        after_connect: AfterConnect::Greet(b"hello from upstream"),
        ..MockSocks5Config::default()
    })
    .await;
    let proxy = ProxyUrl::parse(&server.url()).unwrap();

    let mut session = dial(&proxy, TIMEOUT).await.unwrap();
    session.send_command(Command::Connect, target()).await.unwrap();

    let mut stream = session.into_stream();
    let mut greeting = Vec::new();
    stream.read_to_end(&mut greeting).await.unwrap();
    assert_eq!(greeting, b"hello from upstream");
}

#[tokio::test]
async fn test_echo_through_session() {
    let server = MockSocks5::start(MockSocks5Config::default()).await;
    let proxy = ProxyUrl::parse(&server.url()).unwrap();

    let mut session = dial(&proxy, TIMEOUT).await.unwrap();
    session.send_command(Command::Connect, target()).await.unwrap();
    let mut stream = session.into_stream();

    stream.write_all(b"ping").await.unwrap();
    stream.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    stream.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"ping");
}

// ============================================================================
// Authentication Tests
// ============================================================================

#[tokio::test]
async fn test_password_auth_success() {
    let server = MockSocks5::start(MockSocks5Config {
        require_auth: true,
        credentials: Some(("alice".into(), "p@ss".into())),
        ..MockSocks5Config::default()
    })
    .await;
    let proxy = ProxyUrl::parse(&server.url_with_auth("alice", "p%40ss")).unwrap();

    let mut session = dial(&proxy, TIMEOUT).await.unwrap();
    assert_eq!(session.auth(), AuthMethod::Password);
    session.send_command(Command::Connect, target()).await.unwrap();

    assert_eq!(
        server.offered_methods.lock()[0],
        vec![AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
    );
}

#[tokio::test]
async fn test_password_auth_rejected() {
    let server = MockSocks5::start(MockSocks5Config {
        require_auth: true,
        credentials: Some(("alice".into(), "secret".into())),
        ..MockSocks5Config::default()
    })
    .await;
    let proxy = ProxyUrl::parse(&server.url_with_auth("alice", "wrong")).unwrap();

    let err = dial(&proxy, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, Socks5Error::AuthFailed(0x01)));
}

#[tokio::test]
async fn test_auth_required_without_credentials() {
    let server = MockSocks5::start(MockSocks5Config {
        require_auth: true,
        ..MockSocks5Config::default()
    })
    .await;
    let proxy = ProxyUrl::parse(&server.url()).unwrap();

    let err = dial(&proxy, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, Socks5Error::AuthNotConfigured));
    assert!(!err.is_recoverable());
}

// ============================================================================
// Error Handling Tests
// ============================================================================

#[tokio::test]
async fn test_failure_reply_is_an_error() {
    let server = MockSocks5::start(MockSocks5Config {
        reply_code: REPLY_CONNECTION_REFUSED,
        ..MockSocks5Config::default()
    })
    .await;
    let proxy = ProxyUrl::parse(&server.url()).unwrap();

    let mut session = dial(&proxy, TIMEOUT).await.unwrap();
    let err = session
        .send_command(Command::Connect, target())
        .await
        .unwrap_err();
    match err {
        Socks5Error::ServerReply { code, message } => {
            assert_eq!(code, REPLY_CONNECTION_REFUSED);
            assert!(message.to_lowercase().contains("refused"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_malformed_method_selection() {
    let server = MockSocks5::start(MockSocks5Config {
        send_malformed: true,
        ..MockSocks5Config::default()
    })
    .await;
    let proxy = ProxyUrl::parse(&server.url()).unwrap();

    let err = dial(&proxy, TIMEOUT).await.unwrap_err();
    assert!(matches!(
        err,
        Socks5Error::InvalidVersion {
            expected: 5,
            actual: 4
        }
    ));
}

#[tokio::test]
async fn test_unreachable_proxy() {
    let addr = closed_port().await;
    let proxy = ProxyUrl::parse(&format!("socks5://{addr}")).unwrap();

    let err = dial(&proxy, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, Socks5Error::ConnectionError { .. }));
}

#[tokio::test]
async fn test_handshake_timeout() {
    let server = MockSocks5::start(MockSocks5Config {
        silent: true,
        ..MockSocks5Config::default()
    })
    .await;
    let proxy = ProxyUrl::parse(&server.url()).unwrap();

    let err = dial(&proxy, Duration::from_millis(200)).await.unwrap_err();
    assert!(matches!(
        err,
        Socks5Error::Timeout {
            stage: "handshake",
            ..
        }
    ));
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sessions_are_not_reused() {
    let server = MockSocks5::start(MockSocks5Config::default()).await;
    let proxy = ProxyUrl::parse(&server.url()).unwrap();

    for _ in 0..3 {
        let mut session = dial(&proxy, TIMEOUT).await.unwrap();
        session.send_command(Command::Connect, target()).await.unwrap();
    }
    assert_eq!(server.connections.load(Ordering::SeqCst), 3);
}
