//! tun2socks: relay TUN traffic through a SOCKS5 proxy
//!
//! Raw IP frames read from a virtual interface are terminated by a
//! user-space TCP/IP stack. Each TCP connection the stack accepts is relayed
//! through its own SOCKS5 CONNECT session; UDP DNS queries are relayed to a
//! local resolver.
//!
//! # Architecture
//!
//! ```text
//! TUN device -> pump -> stack (smoltcp) -> forwarder -> SOCKS5 client -> proxy
//!            <-      <-                 <-           <-
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use tun2socks::config::load_config;
//! use tun2socks::device::open_tun_fd;
//! use tun2socks::engine::Engine;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tun2socks/config.json")?;
//! let device = open_tun_fd(3)?;
//!
//! let mut engine = Engine::new(config);
//! engine.start(device)?;
//! engine.wait().await?;
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`device`]: Virtual interface handles
//! - [`engine`]: Engine lifecycle
//! - [`error`]: Error types
//! - [`forward`]: Connection forwarding (SOCKS5 relay, DNS relay)
//! - [`io`]: Stream copy helpers
//! - [`pump`]: Frame pump between device and stack
//! - [`socks5`]: SOCKS5 client
//! - [`stack`]: User-space TCP/IP stack adapter

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod forward;
pub mod io;
pub mod pump;
pub mod socks5;
pub mod stack;

pub use config::{EngineConfig, ForwardConfig, ProxyConfig, StackConfig};
pub use engine::{Engine, EngineStatsSnapshot};
pub use error::{ConfigError, ForwardError, PumpError, Socks5Error, StackError, Tun2SocksError};
pub use forward::Forwarder;
pub use socks5::ProxyUrl;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
