//! SOCKS5 client (RFC 1928 CONNECT with RFC 1929 username/password auth)
//!
//! Each intercepted connection gets its own proxy session; sessions are never
//! pooled or reused.
//!
//! # Protocol Overview
//!
//! 1. Client sends version identifier/method selection (VER, NMETHODS, METHODS)
//! 2. Server replies with selected method (VER, METHOD)
//! 3. If the server picked username/password, client authenticates (RFC 1929)
//! 4. Client sends a command request with the destination address
//! 5. Server replies with status and bound address
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tun2socks::socks5::{dial, Command, ProxyUrl};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let proxy = ProxyUrl::parse("socks5://127.0.0.1:1080")?;
//! let mut session = dial(&proxy, Duration::from_secs(10)).await?;
//! session.send_command(Command::Connect, "93.184.216.34:80".parse()?).await?;
//! let stream = session.into_stream();
//! # Ok(())
//! # }
//! ```

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::common::{
    Reply, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD,
    AUTH_PASSWORD_VERSION, AUTH_STATUS_SUCCESS, CMD_BIND, CMD_CONNECT, CMD_UDP_ASSOCIATE,
    SOCKS5_VERSION,
};
use super::proxy_url::ProxyUrl;
use crate::error::Socks5Error;

/// TCP keepalive applied to the proxy-facing socket
const PROXY_KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const PROXY_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// SOCKS5 command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Establish a TCP relay to the destination
    Connect,
    /// Ask the proxy to accept one inbound connection
    Bind,
    /// Establish a UDP relay
    UdpAssociate,
}

impl Command {
    /// Wire code for this command
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Connect => CMD_CONNECT,
            Self::Bind => CMD_BIND,
            Self::UdpAssociate => CMD_UDP_ASSOCIATE,
        }
    }
}

/// Authentication state negotiated with the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Server accepted the unauthenticated method
    None,
    /// Username/password sub-negotiation succeeded
    Password,
}

/// A negotiated SOCKS5 session ready for a command
#[derive(Debug)]
pub struct Socks5Session {
    stream: TcpStream,
    auth: AuthMethod,
}

impl Socks5Session {
    /// Authentication method the session was established with
    #[must_use]
    pub const fn auth(&self) -> AuthMethod {
        self.auth
    }

    /// Issue a command on this session
    ///
    /// # Errors
    ///
    /// See [`send_command`].
    pub async fn send_command(
        &mut self,
        cmd: Command,
        dest: SocketAddr,
    ) -> Result<SocketAddr, Socks5Error> {
        send_command(&mut self.stream, cmd, dest).await
    }

    /// Take the underlying proxy stream for relaying
    #[must_use]
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Dial the proxy and complete method negotiation
///
/// `connect_timeout` bounds the TCP connect and, separately, the handshake.
///
/// # Errors
///
/// Returns `Socks5Error` if the proxy is unreachable, the negotiation fails,
/// or either stage times out.
pub async fn dial(proxy: &ProxyUrl, connect_timeout: Duration) -> Result<Socks5Session, Socks5Error> {
    let authority = proxy.authority();

    let mut stream = match timeout(connect_timeout, TcpStream::connect((proxy.host(), proxy.port())))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(Socks5Error::connection(&authority, e.to_string())),
        Err(_) => {
            return Err(Socks5Error::Timeout {
                stage: "connect",
                timeout_secs: connect_timeout.as_secs(),
            })
        }
    };

    tune_proxy_socket(&stream);
    trace!("TCP connection to proxy {} established", authority);

    let auth = timeout(connect_timeout, negotiate(&mut stream, proxy))
        .await
        .map_err(|_| Socks5Error::Timeout {
            stage: "handshake",
            timeout_secs: connect_timeout.as_secs(),
        })??;

    debug!("SOCKS5 session with {} established ({:?})", authority, auth);
    Ok(Socks5Session { stream, auth })
}

fn tune_proxy_socket(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(PROXY_KEEPALIVE_IDLE)
        .with_interval(PROXY_KEEPALIVE_INTERVAL);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!("Failed to set keepalive on proxy socket: {}", e);
    }
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY on proxy socket: {}", e);
    }
}

/// Perform method selection and, when requested, username/password auth
///
/// Only the no-auth method is offered unless the proxy URL carries
/// credentials, in which case username/password is offered as well.
///
/// # Errors
///
/// Returns `Socks5Error` on protocol violations, rejected authentication or
/// a method the client does not support.
pub async fn negotiate<S>(stream: &mut S, proxy: &ProxyUrl) -> Result<AuthMethod, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request: &[u8] = if proxy.has_auth() {
        &[SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
    };
    stream.write_all(request).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    trace!("SOCKS5 method selection: {:02x?}", response);

    if response[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion {
            expected: SOCKS5_VERSION,
            actual: response[0],
        });
    }

    match response[1] {
        AUTH_METHOD_NONE => Ok(AuthMethod::None),
        AUTH_METHOD_PASSWORD => {
            authenticate(stream, proxy).await?;
            Ok(AuthMethod::Password)
        }
        other => Err(Socks5Error::NoAcceptableMethod(other)),
    }
}

async fn authenticate<S>(stream: &mut S, proxy: &ProxyUrl) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let username = proxy.username().unwrap_or_default();
    let password = proxy.password().unwrap_or_default();

    if username.is_empty() || password.is_empty() {
        return Err(Socks5Error::AuthNotConfigured);
    }
    if username.len() > 255 {
        return Err(Socks5Error::CredentialsTooLong {
            field: "username",
            len: username.len(),
        });
    }
    if password.len() > 255 {
        return Err(Socks5Error::CredentialsTooLong {
            field: "password",
            len: password.len(),
        });
    }

    // VER | ULEN | UNAME | PLEN | PASSWD
    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(AUTH_PASSWORD_VERSION);
    #[allow(clippy::cast_possible_truncation)]
    request.push(username.len() as u8);
    request.extend_from_slice(username.as_bytes());
    #[allow(clippy::cast_possible_truncation)]
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());

    stream.write_all(&request).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    trace!("SOCKS5 auth response: {:02x?}", response);

    if response[1] != AUTH_STATUS_SUCCESS {
        return Err(Socks5Error::AuthFailed(response[1]));
    }
    Ok(())
}

/// Build a command request for a socket address
///
/// IPv4 destinations use ATYP 0x01; IPv6 destinations use ATYP 0x04.
#[must_use]
pub fn build_command_request(cmd: Command, dest: SocketAddr) -> Vec<u8> {
    let mut request = Vec::with_capacity(22);

    // VER | CMD | RSV
    request.extend_from_slice(&[SOCKS5_VERSION, cmd.code(), 0x00]);

    match dest {
        SocketAddr::V4(v4) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&v6.ip().octets());
        }
    }

    request.extend_from_slice(&dest.port().to_be_bytes());
    request
}

/// Send a command and read the proxy's reply
///
/// A reply with a non-zero status is treated as a hard failure.
///
/// # Errors
///
/// Returns `Socks5Error::ServerReply` for a failure status, or a protocol /
/// I/O error if the reply is malformed.
pub async fn send_command<S>(stream: &mut S, cmd: Command, dest: SocketAddr) -> Result<SocketAddr, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build_command_request(cmd, dest);
    trace!("Sending SOCKS5 {:?} to {}: {:02x?}", cmd, dest, request);
    stream.write_all(&request).await?;

    let bound = read_reply(stream).await?;
    debug!("SOCKS5 {:?} to {} succeeded (bound {})", cmd, dest, bound);
    Ok(bound)
}

async fn read_reply<S>(stream: &mut S) -> Result<SocketAddr, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    // VER | REP | RSV | ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    trace!("SOCKS5 reply header: {:02x?}", header);

    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion {
            expected: SOCKS5_VERSION,
            actual: header[0],
        });
    }

    let bound = match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 6];
            stream.read_exact(&mut addr).await?;
            SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]),
                u16::from_be_bytes([addr[4], addr[5]]),
            ))
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 18];
            stream.read_exact(&mut addr).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addr[..16]);
            SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                u16::from_be_bytes([addr[16], addr[17]]),
                0,
                0,
            ))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            // Domain is skipped; only the port is meaningful to us
            let mut rest = vec![0u8; usize::from(len[0]) + 2];
            stream.read_exact(&mut rest).await?;
            let port = u16::from_be_bytes([rest[rest.len() - 2], rest[rest.len() - 1]]);
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        }
        other => return Err(Socks5Error::InvalidAddressType(other)),
    };

    // Status is checked after the full reply is consumed so the stream is
    // left at a message boundary either way.
    let reply = Reply::from_code(header[1]);
    if !reply.is_success() {
        return Err(Socks5Error::ServerReply {
            code: reply.code(),
            message: reply.message().to_string(),
        });
    }

    Ok(bound)
}
