//! Error types for tun2socks
//!
//! Errors are grouped by subsystem. Each subsystem enum reports whether the
//! failure is confined to a single connection (`is_recoverable`) or is fatal
//! to the engine.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for tun2socks
#[derive(Debug, Error)]
pub enum Tun2SocksError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// User-space stack construction or runtime errors
    #[error("Stack error: {0}")]
    Stack(#[from] StackError),

    /// SOCKS5 client errors
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    /// Packet pump errors
    #[error("Pump error: {0}")]
    Pump(#[from] PumpError),

    /// Per-connection forwarding errors
    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    /// Engine lifecycle misuse
    #[error("Engine error: {0}")]
    Engine(String),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Tun2SocksError {
    /// Check if this error is recoverable (affects a single connection only)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Engine(_) => false,
            Self::Stack(e) => e.is_recoverable(),
            Self::Socks5(e) => e.is_recoverable(),
            Self::Pump(e) => e.is_recoverable(),
            Self::Forward(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create an engine lifecycle error
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are never recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Create an environment override error
    pub fn env(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EnvError {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// User-space stack errors
#[derive(Debug, Error)]
pub enum StackError {
    /// Synthetic link-layer address could not be parsed
    #[error("Invalid link address {address:?}: {reason}")]
    InvalidLinkAddress { address: String, reason: String },

    /// Interface identifier rejected
    #[error("Invalid interface id {0}")]
    InvalidInterfaceId(u32),

    /// MTU outside the supported range
    #[error("Invalid MTU {mtu}: must be between {min} and {max}")]
    InvalidMtu { mtu: usize, min: usize, max: usize },

    /// Congestion control algorithm not available
    #[error("Unsupported congestion control algorithm: {0}")]
    UnsupportedCongestionControl(String),

    /// Interface setup failed (addresses, routes)
    #[error("Failed to create interface: {0}")]
    InterfaceCreation(String),

    /// The stack task has stopped
    #[error("Stack is closed")]
    Closed,
}

impl StackError {
    /// Only a closed stack is transient; everything else aborts startup
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Create an invalid link address error
    pub fn invalid_link_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLinkAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create an interface creation error
    pub fn interface(reason: impl Into<String>) -> Self {
        Self::InterfaceCreation(reason.into())
    }
}

/// SOCKS5 client errors
#[derive(Debug, Error)]
pub enum Socks5Error {
    /// Proxy URL could not be parsed or uses another scheme
    #[error("Invalid proxy URL {url:?}: {reason}")]
    InvalidProxyUrl { url: String, reason: String },

    /// Invalid protocol version in a server message
    #[error("Invalid SOCKS version: expected {expected}, got {actual}")]
    InvalidVersion { expected: u8, actual: u8 },

    /// Server selected a method we do not support
    #[error("No acceptable authentication methods (server selected {0:#04x})")]
    NoAcceptableMethod(u8),

    /// Server demands username/password but none are configured
    #[error("Proxy requires username/password authentication but credentials are not configured")]
    AuthNotConfigured,

    /// Username or password longer than RFC 1929 allows
    #[error("SOCKS5 {field} too long: {len} bytes (max 255)")]
    CredentialsTooLong { field: &'static str, len: usize },

    /// Authentication rejected by the server
    #[error("SOCKS5 authentication failed (status {0:#04x})")]
    AuthFailed(u8),

    /// Server returned a non-success reply to a command
    #[error("SOCKS5 server error (code {code:#04x}): {message}")]
    ServerReply { code: u8, message: String },

    /// Invalid address type in a server reply
    #[error("Invalid address type: {0:#04x}")]
    InvalidAddressType(u8),

    /// Destination cannot be encoded in a command request
    #[error("Unsupported destination: {0}")]
    UnsupportedDestination(String),

    /// Could not reach the proxy
    #[error("Failed to connect to proxy {addr}: {reason}")]
    ConnectionError { addr: String, reason: String },

    /// Dial or handshake exceeded the configured timeout
    #[error("SOCKS5 {stage} timed out after {timeout_secs}s")]
    Timeout { stage: &'static str, timeout_secs: u64 },

    /// I/O error during negotiation
    #[error("SOCKS5 I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Socks5Error {
    /// SOCKS5 failures only ever tear down the affected connection
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidProxyUrl { .. } | Self::AuthNotConfigured | Self::CredentialsTooLong { .. } => {
                false
            }
            Self::Io(e) => !matches!(e.kind(), io::ErrorKind::InvalidInput),
            _ => true,
        }
    }

    /// Create an invalid proxy URL error
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProxyUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a proxy connection error
    pub fn connection(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionError {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

/// Packet pump errors
#[derive(Debug, Error)]
pub enum PumpError {
    /// The engine cancelled the pump
    #[error("Packet pump cancelled")]
    Cancelled,

    /// The device returned a non-clean read error
    #[error("Device read failed: {0}")]
    DeviceRead(#[source] io::Error),

    /// The device rejected a frame write
    #[error("Device write failed: {0}")]
    DeviceWrite(#[source] io::Error),
}

impl PumpError {
    /// Cancellation is expected on shutdown; device failures are fatal
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Per-connection forwarding errors
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Proxy dial, handshake or command failure
    #[error("Proxy negotiation for {dst} failed: {source}")]
    Socks5 {
        dst: SocketAddr,
        #[source]
        source: Socks5Error,
    },

    /// Copy failure while relaying
    #[error("Relay error: {0}")]
    Relay(#[from] io::Error),

    /// DNS relay failure
    #[error("DNS relay via {resolver} failed: {reason}")]
    Dns { resolver: SocketAddr, reason: String },

    /// Forwarding pair exceeded its lifetime ceiling
    #[error("Forwarding to {dst} abandoned after {timeout_secs}s")]
    Timeout { dst: SocketAddr, timeout_secs: u64 },
}

impl ForwardError {
    /// Forwarding errors never affect other connections
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Wrap a SOCKS5 failure for a destination
    pub const fn socks5(dst: SocketAddr, source: Socks5Error) -> Self {
        Self::Socks5 { dst, source }
    }

    /// Create a DNS relay error
    pub fn dns(resolver: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Dns {
            resolver,
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with Tun2SocksError
pub type Result<T> = std::result::Result<T, Tun2SocksError>;
