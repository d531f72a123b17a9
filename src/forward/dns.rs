//! DNS relays to the local resolver
//!
//! UDP DNS is handled one exchange per flow: one query in, one reply out,
//! then the flow is closed. DNS over TCP is length-prefixed and may carry
//! several messages, so it is piped to the resolver as a plain byte stream.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace};

use super::tcp::{relay_pair, InterceptedStream};
use crate::error::ForwardError;
use crate::io::CopyResult;
use crate::stack::InterceptedUdp;

/// Well-known DNS port
pub const DNS_PORT: u16 = 53;

/// Largest DNS message carried over UDP
const MAX_DNS_DATAGRAM: usize = 65535;

/// Whether a flow's destination is a DNS server
#[must_use]
pub const fn is_dns(dst: SocketAddr) -> bool {
    dst.port() == DNS_PORT
}

fn describe(message: &[u8]) -> Option<String> {
    let parsed = Message::from_bytes(message).ok()?;
    let query = parsed.queries().first()?;
    Some(format!(
        "id={} {} {} rcode={}",
        parsed.id(),
        query.name(),
        query.query_type(),
        parsed.response_code()
    ))
}

fn unspecified_for(resolver: SocketAddr) -> SocketAddr {
    match resolver {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

/// Relay exactly one query from `conn` to `resolver` and its reply back
///
/// The query and reply are forwarded verbatim. `conn` is closed on return
/// whatever the outcome. Returns the size of the reply.
///
/// # Errors
///
/// Returns `ForwardError::Dns` if no query arrives, the resolver cannot be
/// reached, no reply arrives within `reply_timeout`, or the reply cannot be
/// delivered to the client.
pub async fn relay_dns_udp(
    mut conn: InterceptedUdp,
    resolver: SocketAddr,
    reply_timeout: Duration,
) -> Result<usize, ForwardError> {
    let client = conn.peer_addr();

    let query = conn
        .recv_datagram()
        .await
        .map_err(|e| ForwardError::dns(resolver, format!("no query from {client}: {e}")))?;
    trace!(
        src = %client,
        "DNS query ({} bytes) {}",
        query.len(),
        describe(&query).unwrap_or_default()
    );

    let socket = UdpSocket::bind(unspecified_for(resolver))
        .await
        .map_err(|e| ForwardError::dns(resolver, format!("bind: {e}")))?;
    socket
        .connect(resolver)
        .await
        .map_err(|e| ForwardError::dns(resolver, format!("connect: {e}")))?;
    socket
        .send(&query)
        .await
        .map_err(|e| ForwardError::dns(resolver, format!("send: {e}")))?;

    let mut buf = vec![0u8; MAX_DNS_DATAGRAM];
    let n = match timeout(reply_timeout, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(ForwardError::dns(resolver, format!("recv: {e}"))),
        Err(_) => {
            return Err(ForwardError::dns(
                resolver,
                format!("no reply within {}s", reply_timeout.as_secs()),
            ))
        }
    };
    let reply = &buf[..n];
    trace!(
        src = %client,
        "DNS reply ({} bytes) {}",
        n,
        describe(reply).unwrap_or_default()
    );

    conn.send(reply)
        .await
        .map_err(|e| ForwardError::dns(resolver, format!("deliver reply: {e}")))?;
    conn.close();

    debug!(src = %client, "DNS exchange via {} complete", resolver);
    Ok(n)
}

/// Pipe a DNS-over-TCP connection to `resolver`
///
/// `lifetime` bounds the whole exchange, connect included. Once connected the
/// two directions run as a forwarding pair, so a failure on either side ends
/// both and resets the client.
///
/// # Errors
///
/// - `ForwardError::Dns` if the resolver is unreachable or the exchange
///   outlives `lifetime`
/// - `ForwardError::Relay` for a copy error in either direction
pub async fn relay_dns_tcp<S>(
    conn: S,
    resolver: SocketAddr,
    lifetime: Duration,
    buf_size: usize,
) -> Result<CopyResult, ForwardError>
where
    S: InterceptedStream,
{
    let started = Instant::now();
    let exceeded = || {
        ForwardError::dns(
            resolver,
            format!("TCP exchange exceeded {}s", lifetime.as_secs()),
        )
    };

    let upstream = match timeout(lifetime, TcpStream::connect(resolver)).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => return Err(ForwardError::dns(resolver, format!("connect: {e}"))),
        Err(_) => {
            if let Some(reset) = conn.reset_handle() {
                reset.reset();
            }
            return Err(exceeded());
        }
    };

    let remaining = lifetime.saturating_sub(started.elapsed());
    match relay_pair(conn, upstream, remaining, buf_size).await {
        Err(ForwardError::Timeout { .. }) => Err(exceeded()),
        other => other,
    }
}
