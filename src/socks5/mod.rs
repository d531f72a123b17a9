//! SOCKS5 client
//!
//! Dials the configured proxy, negotiates authentication and issues commands.
//! Only the client role is implemented; CONNECT is the command used by the
//! forwarding paths, BIND and UDP ASSOCIATE codes are encodable but unused.

mod client;
pub mod common;
mod proxy_url;

pub use client::{
    build_command_request, dial, negotiate, send_command, AuthMethod, Command, Socks5Session,
};
pub use common::Reply;
pub use proxy_url::ProxyUrl;
