//! User-space TCP/IP stack adapter
//!
//! Terminates the TCP connections and UDP flows carried by raw IP frames and
//! exposes them as [`InterceptedTcp`] streams and [`InterceptedUdp`] flows.
//!
//! # Architecture
//!
//! ```text
//!              inject_inbound                      accept_tcp / accept_udp
//! Packet pump ---------------> NetStack (smoltcp) -------------------------> ConnectionAcceptor
//!             <---------------                    <------------------------
//!              read_outbound                        InterceptedTcp / Udp I/O
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use tun2socks::config::StackConfig;
//! use tun2socks::stack::{build_stack, ConnectionAcceptor, FlowEndpoint, InterceptedTcp, InterceptedUdp};
//!
//! struct LogOnly;
//!
//! impl ConnectionAcceptor for LogOnly {
//!     fn accept_tcp(&self, conn: InterceptedTcp) {
//!         println!("{} -> {}", conn.peer_addr(), conn.local_addr());
//!     }
//!     fn accept_udp(&self, _conn: InterceptedUdp, _endpoint: FlowEndpoint) {}
//! }
//!
//! # async fn example() -> Result<(), tun2socks::error::StackError> {
//! let (stack, link) = build_stack(&StackConfig::default(), 1420, Arc::new(LogOnly))?;
//! let cancel = CancellationToken::new();
//! tokio::spawn(stack.run(cancel.clone()));
//! # drop(link);
//! # Ok(())
//! # }
//! ```

mod acceptor;
mod device;
pub mod frame;
mod link;
mod netstack;
mod tcp;
mod udp;

pub use acceptor::ConnectionAcceptor;
pub use device::{FrameQueue, StackDevice};
pub use frame::NetworkProtocol;
pub use link::{InboundFrame, LinkEndpoint, LinkInjector, LinkReader};
pub use netstack::{
    build_stack, parse_congestion_control, parse_link_address, NetStack, StackStats,
    StackStatsSnapshot, KEEPALIVE_IDLE_SECS, KEEPALIVE_INTERVAL_SECS, KEEPALIVE_PROBES,
};
pub use tcp::{InterceptedTcp, TcpResetHandle};
pub use udp::{FlowEndpoint, InterceptedUdp};
