//! TCP forwarding pairs
//!
//! A pair joins one intercepted connection to one proxied connection with a
//! copy task per direction. The pair is supervised as a unit: both tasks are
//! joined before it is reported closed, and a pair that outlives its ceiling
//! has both tasks aborted and the client reset.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::ForwardError;
use crate::io::{copy_half, CopyResult};
use crate::stack::{InterceptedTcp, TcpResetHandle};

/// A client-side stream the forwarder can relay
///
/// `local_addr` is the destination the client dialed, which is what the
/// proxy is asked to connect to.
pub trait InterceptedStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn local_addr(&self) -> SocketAddr;

    fn peer_addr(&self) -> SocketAddr;

    /// Handle used to abort the client when the pair is torn down forcibly
    fn reset_handle(&self) -> Option<TcpResetHandle> {
        None
    }
}

impl InterceptedStream for InterceptedTcp {
    fn local_addr(&self) -> SocketAddr {
        InterceptedTcp::local_addr(self)
    }

    fn peer_addr(&self) -> SocketAddr {
        InterceptedTcp::peer_addr(self)
    }

    fn reset_handle(&self) -> Option<TcpResetHandle> {
        Some(InterceptedTcp::reset_handle(self))
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Upload,
    Download,
}

type CopyOutcome = (Direction, io::Result<u64>);

/// Relay `client` and `proxy` until both directions finish
///
/// Each direction copies until its source reaches EOF, then shuts down the
/// write side of its destination. The first copy error ends the pair.
///
/// # Errors
///
/// - `ForwardError::Relay` for a copy error in either direction
/// - `ForwardError::Timeout` if the pair is still running after `pair_timeout`
pub async fn relay_pair<C, P>(
    client: C,
    proxy: P,
    pair_timeout: Duration,
    buf_size: usize,
) -> Result<CopyResult, ForwardError>
where
    C: InterceptedStream,
    P: AsyncRead + AsyncWrite + Send + 'static,
{
    let dst = client.local_addr();
    let reset = client.reset_handle();

    let (client_read, client_write) = tokio::io::split(client);
    let (proxy_read, proxy_write) = tokio::io::split(proxy);

    let mut copies: JoinSet<CopyOutcome> = JoinSet::new();
    copies.spawn(async move {
        (
            Direction::Upload,
            copy_half(client_read, proxy_write, buf_size).await,
        )
    });
    copies.spawn(async move {
        (
            Direction::Download,
            copy_half(proxy_read, client_write, buf_size).await,
        )
    });

    let outcome = timeout(pair_timeout, join_copies(&mut copies)).await;

    if !matches!(outcome, Ok(Ok(_))) {
        if let Some(reset) = &reset {
            reset.reset();
        }
        copies.abort_all();
        while copies.join_next().await.is_some() {}
    }

    match outcome {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(ForwardError::Relay(e)),
        Err(_) => {
            warn!(dst = %dst, "Forwarding pair abandoned after {}s", pair_timeout.as_secs());
            Err(ForwardError::Timeout {
                dst,
                timeout_secs: pair_timeout.as_secs(),
            })
        }
    }
}

async fn join_copies(copies: &mut JoinSet<CopyOutcome>) -> io::Result<CopyResult> {
    let mut result = CopyResult::default();
    while let Some(joined) = copies.join_next().await {
        let (direction, copied) = joined.map_err(io::Error::other)?;
        let n = match copied {
            Ok(n) => n,
            Err(e) => {
                debug!("{:?} copy failed: {}", direction, e);
                return Err(e);
            }
        };
        trace!("{:?} copy finished after {} bytes", direction, n);
        match direction {
            Direction::Upload => result.client_to_upstream = n,
            Direction::Download => result.upstream_to_client = n,
        }
    }
    Ok(result)
}
