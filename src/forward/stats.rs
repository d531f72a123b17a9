//! Forwarding statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Atomic forwarding counters shared by all forwarder tasks
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// TCP connections handed to the forwarder
    tcp_total: AtomicU64,
    /// TCP connections currently being forwarded
    tcp_active: AtomicU64,
    /// TCP connections that ended with an error
    tcp_failed: AtomicU64,
    /// Forwarding pairs abandoned at the lifetime ceiling
    tcp_timeouts: AtomicU64,
    /// Bytes relayed client -> proxy
    bytes_up: AtomicU64,
    /// Bytes relayed proxy -> client
    bytes_down: AtomicU64,
    /// DNS exchanges attempted over UDP
    dns_queries: AtomicU64,
    /// DNS exchanges that failed
    dns_failures: AtomicU64,
    /// TCP connections relayed to the resolver
    dns_tcp_relays: AtomicU64,
    /// Non-DNS UDP flows closed without relaying
    udp_ignored: AtomicU64,
}

impl ForwardStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new TCP connection; the gauge drops when the guard does
    pub fn track_tcp(self: &Arc<Self>) -> ActiveTcpGuard {
        self.tcp_total.fetch_add(1, Ordering::Relaxed);
        self.tcp_active.fetch_add(1, Ordering::Relaxed);
        ActiveTcpGuard {
            stats: Arc::clone(self),
        }
    }

    /// Record bytes relayed by a finished pair
    pub fn record_transfer(&self, up: u64, down: u64) {
        self.bytes_up.fetch_add(up, Ordering::Relaxed);
        self.bytes_down.fetch_add(down, Ordering::Relaxed);
    }

    pub fn record_tcp_failure(&self) {
        self.tcp_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_timeout(&self) {
        self.tcp_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_query(&self) {
        self.dns_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_failure(&self) {
        self.dns_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_tcp_relay(&self) {
        self.dns_tcp_relays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_ignored(&self) {
        self.udp_ignored.fetch_add(1, Ordering::Relaxed);
    }

    /// Currently active TCP forwards
    #[must_use]
    pub fn tcp_active(&self) -> u64 {
        self.tcp_active.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> ForwardStatsSnapshot {
        ForwardStatsSnapshot {
            tcp_total: self.tcp_total.load(Ordering::Relaxed),
            tcp_active: self.tcp_active(),
            tcp_failed: self.tcp_failed.load(Ordering::Relaxed),
            tcp_timeouts: self.tcp_timeouts.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            dns_queries: self.dns_queries.load(Ordering::Relaxed),
            dns_failures: self.dns_failures.load(Ordering::Relaxed),
            dns_tcp_relays: self.dns_tcp_relays.load(Ordering::Relaxed),
            udp_ignored: self.udp_ignored.load(Ordering::Relaxed),
        }
    }
}

/// Keeps a TCP forward counted as active
#[derive(Debug)]
pub struct ActiveTcpGuard {
    stats: Arc<ForwardStats>,
}

impl Drop for ActiveTcpGuard {
    fn drop(&mut self) {
        self.stats.tcp_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Snapshot of forwarding statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForwardStatsSnapshot {
    pub tcp_total: u64,
    pub tcp_active: u64,
    pub tcp_failed: u64,
    pub tcp_timeouts: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub dns_queries: u64,
    pub dns_failures: u64,
    pub dns_tcp_relays: u64,
    pub udp_ignored: u64,
}
