//! Connection forwarder
//!
//! Receives the connections the stack terminates and decides what happens to
//! them:
//!
//! - TCP: a fresh SOCKS5 session is dialed per connection, CONNECT is issued
//!   for the connection's original destination and the two streams are
//!   relayed as a forwarding pair.
//! - UDP to port 53: one query is relayed to the local resolver and its reply
//!   written back.
//! - Any other UDP flow is closed.
//!
//! With `hijack_dns_tcp` set, TCP connections to port 53 are piped to the
//! resolver instead of the proxy.
//!
//! Every forward runs as its own task on a [`TaskTracker`] so the engine can
//! wait for them on shutdown.

mod dns;
mod stats;
mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{ForwardConfig, ProxyConfig};
use crate::error::{ForwardError, Socks5Error};
use crate::io::CopyResult;
use crate::socks5::{self, Command, ProxyUrl};
use crate::stack::{ConnectionAcceptor, FlowEndpoint, InterceptedTcp, InterceptedUdp};

pub use dns::{is_dns, relay_dns_tcp, relay_dns_udp, DNS_PORT};
pub use stats::{ActiveTcpGuard, ForwardStats, ForwardStatsSnapshot};
pub use tcp::{relay_pair, InterceptedStream};

struct ForwarderInner {
    proxy: ProxyUrl,
    connect_timeout: Duration,
    pair_timeout: Duration,
    copy_buffer_size: usize,
    dns_resolver: SocketAddr,
    dns_timeout: Duration,
    hijack_dns_tcp: bool,
    tasks: TaskTracker,
    stats: Arc<ForwardStats>,
}

/// Forwards intercepted connections through the SOCKS5 proxy
#[derive(Clone)]
pub struct Forwarder {
    inner: Arc<ForwarderInner>,
}

impl Forwarder {
    /// Create a forwarder for an already parsed proxy URL
    #[must_use]
    pub fn new(proxy: ProxyUrl, proxy_config: &ProxyConfig, config: &ForwardConfig) -> Self {
        Self {
            inner: Arc::new(ForwarderInner {
                proxy,
                connect_timeout: proxy_config.connect_timeout(),
                pair_timeout: config.pair_timeout(),
                copy_buffer_size: config.copy_buffer_size,
                dns_resolver: config.dns_resolver,
                dns_timeout: config.dns_timeout(),
                hijack_dns_tcp: config.hijack_dns_tcp,
                tasks: TaskTracker::new(),
                stats: Arc::new(ForwardStats::new()),
            }),
        }
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.inner.stats)
    }

    /// Tracker owning every spawned forward task
    pub fn tasks(&self) -> &TaskTracker {
        &self.inner.tasks
    }

    /// Forward one TCP connection through a new SOCKS5 session
    ///
    /// The client and the proxy connection are both closed when this returns,
    /// on every path.
    ///
    /// # Errors
    ///
    /// - `ForwardError::Socks5` if dialing, negotiation or CONNECT fails; the
    ///   client is closed without any data relayed
    /// - `ForwardError::Relay` / `ForwardError::Timeout` from the relay
    pub async fn handle_tcp<S>(&self, conn: S) -> Result<CopyResult, ForwardError>
    where
        S: InterceptedStream,
    {
        let inner = &self.inner;
        let dst = conn.local_addr();

        let mut session = socks5::dial(&inner.proxy, inner.connect_timeout)
            .await
            .map_err(|e| ForwardError::socks5(dst, e))?;

        let bound = tokio::time::timeout(
            inner.connect_timeout,
            session.send_command(Command::Connect, dst),
        )
        .await
        .map_err(|_| {
            ForwardError::socks5(
                dst,
                Socks5Error::Timeout {
                    stage: "connect command",
                    timeout_secs: inner.connect_timeout.as_secs(),
                },
            )
        })?
        .map_err(|e| ForwardError::socks5(dst, e))?;
        debug!(dst = %dst, "Proxy bound {}", bound);

        relay_pair(
            conn,
            session.into_stream(),
            inner.pair_timeout,
            inner.copy_buffer_size,
        )
        .await
    }

    /// Handle one UDP flow
    ///
    /// Flows to port 53 get a single DNS exchange with the resolver; every
    /// other flow is closed. Returns the DNS reply size, or 0 for an ignored
    /// flow.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError::Dns` if the DNS exchange fails.
    pub async fn handle_udp(
        &self,
        conn: InterceptedUdp,
        endpoint: FlowEndpoint,
    ) -> Result<usize, ForwardError> {
        let inner = &self.inner;
        if !is_dns(endpoint.local) {
            debug!(src = %endpoint.remote, dst = %endpoint.local, "Closing non-DNS UDP flow");
            inner.stats.record_udp_ignored();
            conn.close();
            return Ok(0);
        }

        inner.stats.record_dns_query();
        relay_dns_udp(conn, inner.dns_resolver, inner.dns_timeout).await
    }

    /// Pipe a TCP connection to the resolver
    ///
    /// # Errors
    ///
    /// See [`relay_dns_tcp`].
    pub async fn handle_dns_tcp<S>(&self, conn: S) -> Result<CopyResult, ForwardError>
    where
        S: InterceptedStream,
    {
        let inner = &self.inner;
        inner.stats.record_dns_tcp_relay();
        relay_dns_tcp(
            conn,
            inner.dns_resolver,
            inner.pair_timeout,
            inner.copy_buffer_size,
        )
        .await
    }

    fn record_tcp_outcome(
        &self,
        src: SocketAddr,
        dst: SocketAddr,
        outcome: &Result<CopyResult, ForwardError>,
    ) {
        let stats = &self.inner.stats;
        match outcome {
            Ok(result) => {
                stats.record_transfer(result.client_to_upstream, result.upstream_to_client);
                debug!(
                    src = %src,
                    dst = %dst,
                    "Connection closed, {} up / {} down bytes",
                    result.client_to_upstream,
                    result.upstream_to_client
                );
            }
            Err(ForwardError::Timeout { .. }) => {
                stats.record_tcp_timeout();
                stats.record_tcp_failure();
            }
            Err(e) => {
                stats.record_tcp_failure();
                warn!(src = %src, dst = %dst, "TCP forward failed: {}", e);
            }
        }
    }
}

impl ConnectionAcceptor for Forwarder {
    fn accept_tcp(&self, conn: InterceptedTcp) {
        let forwarder = self.clone();
        let src = conn.peer_addr();
        let dst = conn.local_addr();
        let hijack = self.inner.hijack_dns_tcp && is_dns(dst);

        self.inner.tasks.spawn(async move {
            let _active = forwarder.inner.stats.track_tcp();
            let outcome = if hijack {
                debug!(src = %src, dst = %dst, "Relaying TCP DNS to {}", forwarder.inner.dns_resolver);
                forwarder.handle_dns_tcp(conn).await
            } else {
                info!(src = %src, dst = %dst, "Proxying TCP connection");
                forwarder.handle_tcp(conn).await
            };
            forwarder.record_tcp_outcome(src, dst, &outcome);
        });
    }

    fn accept_udp(&self, conn: InterceptedUdp, endpoint: FlowEndpoint) {
        let forwarder = self.clone();
        self.inner.tasks.spawn(async move {
            if let Err(e) = forwarder.handle_udp(conn, endpoint).await {
                forwarder.inner.stats.record_dns_failure();
                warn!(src = %endpoint.remote, dst = %endpoint.local, "DNS relay failed: {}", e);
            }
        });
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("proxy", &self.inner.proxy)
            .field("dns_resolver", &self.inner.dns_resolver)
            .finish_non_exhaustive()
    }
}
