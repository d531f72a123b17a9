//! Mock servers and client streams shared by the integration tests

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use tun2socks::forward::InterceptedStream;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const AUTH_METHOD_NONE: u8 = 0x00;
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_IPV6: u8 = 0x04;
pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;

// ============================================================================
// Mock SOCKS5 Server
// ============================================================================

/// What the mock does once a CONNECT succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterConnect {
    /// Echo everything back, half-closing when the client does
    Echo,
    /// Answer with a fixed greeting and close
    Greet(&'static [u8]),
}

/// Configuration for mock SOCKS5 server behavior
#[derive(Debug, Clone)]
pub struct MockSocks5Config {
    /// Demand username/password authentication
    pub require_auth: bool,
    /// Expected credentials (any are accepted when `None`)
    pub credentials: Option<(String, String)>,
    /// Reply code sent after the command
    pub reply_code: u8,
    /// Send a SOCKS4 version byte in the method selection
    pub send_malformed: bool,
    /// Accept the connection but never answer
    pub silent: bool,
    pub after_connect: AfterConnect,
}

impl Default for MockSocks5Config {
    fn default() -> Self {
        Self {
            require_auth: false,
            credentials: None,
            reply_code: REPLY_SUCCEEDED,
            send_malformed: false,
            silent: false,
            after_connect: AfterConnect::Echo,
        }
    }
}

/// Running mock SOCKS5 server
pub struct MockSocks5 {
    pub addr: SocketAddr,
    /// Methods offered by each client, in arrival order
    pub offered_methods: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Destinations requested with CONNECT
    pub destinations: Arc<Mutex<Vec<SocketAddr>>>,
    pub connections: Arc<AtomicU32>,
}

impl MockSocks5 {
    pub async fn start(config: MockSocks5Config) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let offered_methods = Arc::new(Mutex::new(Vec::new()));
        let destinations = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicU32::new(0));

        let methods = Arc::clone(&offered_methods);
        let dests = Arc::clone(&destinations);
        let count = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                let config = config.clone();
                let methods = Arc::clone(&methods);
                let dests = Arc::clone(&dests);
                tokio::spawn(async move {
                    let _ = serve_socks5(socket, config, methods, dests).await;
                });
            }
        });

        Self {
            addr,
            offered_methods,
            destinations,
            connections,
        }
    }

    pub fn url(&self) -> String {
        format!("socks5://{}", self.addr)
    }

    pub fn url_with_auth(&self, user: &str, pass: &str) -> String {
        format!("socks5://{user}:{pass}@{}", self.addr)
    }
}

async fn serve_socks5(
    mut socket: TcpStream,
    config: MockSocks5Config,
    offered_methods: Arc<Mutex<Vec<Vec<u8>>>>,
    destinations: Arc<Mutex<Vec<SocketAddr>>>,
) -> io::Result<()> {
    if config.silent {
        let mut sink = Vec::new();
        socket.read_to_end(&mut sink).await?;
        return Ok(());
    }

    // VER | NMETHODS | METHODS
    let mut header = [0u8; 2];
    socket.read_exact(&mut header).await?;
    let mut methods = vec![0u8; header[1] as usize];
    socket.read_exact(&mut methods).await?;
    offered_methods.lock().push(methods);

    if config.send_malformed {
        socket.write_all(&[0x04, AUTH_METHOD_NONE]).await?;
        return Ok(());
    }

    if config.require_auth {
        socket
            .write_all(&[SOCKS5_VERSION, AUTH_METHOD_PASSWORD])
            .await?;

        let mut auth_header = [0u8; 2];
        socket.read_exact(&mut auth_header).await?;
        let mut username = vec![0u8; auth_header[1] as usize];
        socket.read_exact(&mut username).await?;
        let mut plen = [0u8; 1];
        socket.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        socket.read_exact(&mut password).await?;

        let accepted = config.credentials.as_ref().map_or(true, |(u, p)| {
            username == u.as_bytes() && password == p.as_bytes()
        });
        if !accepted {
            socket.write_all(&[AUTH_PASSWORD_VERSION, 0x01]).await?;
            return Ok(());
        }
        socket.write_all(&[AUTH_PASSWORD_VERSION, 0x00]).await?;
    } else {
        socket.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE]).await?;
    }

    // VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
    let mut request = [0u8; 4];
    socket.read_exact(&mut request).await?;
    let destination = match request[3] {
        ATYP_IPV4 => {
            let mut raw = [0u8; 6];
            socket.read_exact(&mut raw).await?;
            SocketAddr::from((
                [raw[0], raw[1], raw[2], raw[3]],
                u16::from_be_bytes([raw[4], raw[5]]),
            ))
        }
        ATYP_IPV6 => {
            let mut raw = [0u8; 18];
            socket.read_exact(&mut raw).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            SocketAddr::from((octets, u16::from_be_bytes([raw[16], raw[17]])))
        }
        _ => return Ok(()),
    };
    destinations.lock().push(destination);

    let port = socket.local_addr()?.port().to_be_bytes();
    socket
        .write_all(&[
            SOCKS5_VERSION,
            config.reply_code,
            0x00,
            ATYP_IPV4,
            127,
            0,
            0,
            1,
            port[0],
            port[1],
        ])
        .await?;
    if config.reply_code != REPLY_SUCCEEDED {
        return Ok(());
    }

    match config.after_connect {
        AfterConnect::Echo => {
            let (mut reader, mut writer) = socket.split();
            tokio::io::copy(&mut reader, &mut writer).await?;
            writer.shutdown().await?;
        }
        AfterConnect::Greet(greeting) => {
            socket.write_all(greeting).await?;
            socket.shutdown().await?;
        }
    }
    Ok(())
}

/// An address nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

// ============================================================================
// Mock DNS resolvers
// ============================================================================

/// Mark a DNS query as a response, leaving everything else untouched
pub fn answer_for(query: &[u8]) -> Vec<u8> {
    let mut reply = query.to_vec();
    if reply.len() > 2 {
        reply[2] |= 0x80;
    }
    reply.extend_from_slice(b"answer");
    reply
}

/// UDP resolver answering every query with [`answer_for`]
pub struct MockUdpResolver {
    pub addr: SocketAddr,
    pub queries: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockUdpResolver {
    pub async fn start(answer: bool) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let queries = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&queries);

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                seen.lock().push(buf[..n].to_vec());
                if answer {
                    let _ = socket.send_to(&answer_for(&buf[..n]), from).await;
                }
            }
        });

        Self { addr, queries }
    }
}

/// TCP resolver answering length-prefixed queries until the client closes
pub async fn start_tcp_resolver() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                loop {
                    let mut len = [0u8; 2];
                    if socket.read_exact(&mut len).await.is_err() {
                        break;
                    }
                    let mut query = vec![0u8; u16::from_be_bytes(len) as usize];
                    if socket.read_exact(&mut query).await.is_err() {
                        break;
                    }
                    let reply = answer_for(&query);
                    let mut framed = (reply.len() as u16).to_be_bytes().to_vec();
                    framed.extend_from_slice(&reply);
                    if socket.write_all(&framed).await.is_err() {
                        break;
                    }
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

// ============================================================================
// In-memory intercepted stream
// ============================================================================

/// Duplex stream posing as a connection intercepted for `dst`
pub struct DuplexClient {
    inner: DuplexStream,
    dst: SocketAddr,
}

impl DuplexClient {
    /// Returns the intercepted side and the application's side
    pub fn pair(dst: SocketAddr) -> (Self, DuplexStream) {
        let (inner, app) = tokio::io::duplex(64 * 1024);
        (Self { inner, dst }, app)
    }
}

impl AsyncRead for DuplexClient {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexClient {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl InterceptedStream for DuplexClient {
    fn local_addr(&self) -> SocketAddr {
        self.dst
    }

    fn peer_addr(&self) -> SocketAddr {
        "10.0.0.2:40000".parse().unwrap()
    }
}
