//! Connection acceptance hook

use super::tcp::InterceptedTcp;
use super::udp::{FlowEndpoint, InterceptedUdp};

/// Receives connections as the stack terminates them
///
/// Both methods are called from the stack driver task and must return
/// promptly: spawn any work that waits on I/O.
pub trait ConnectionAcceptor: Send + Sync + 'static {
    /// Called once per TCP connection after its handshake completed
    fn accept_tcp(&self, conn: InterceptedTcp);

    /// Called once per new UDP flow, with its first datagram already queued
    fn accept_udp(&self, conn: InterceptedUdp, endpoint: FlowEndpoint);
}
