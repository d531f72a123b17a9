//! Proxy URL parsing
//!
//! Accepts `socks5://[user[:password]@]host[:port]`. `socks5h` is treated
//! the same way since destinations are always resolved addresses here.

use std::fmt;

use percent_encoding::percent_decode_str;
use url::{Host, Url};

use super::common::DEFAULT_PORT;
use crate::error::Socks5Error;

/// Parsed SOCKS5 proxy location and credentials
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyUrl {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

impl ProxyUrl {
    /// Parse a proxy URL
    ///
    /// # Errors
    ///
    /// Returns `Socks5Error::InvalidProxyUrl` for unparsable URLs, other
    /// schemes, or a missing host.
    pub fn parse(raw: &str) -> Result<Self, Socks5Error> {
        let url = Url::parse(raw).map_err(|e| Socks5Error::invalid_url(raw, e.to_string()))?;

        match url.scheme() {
            "socks5" | "socks5h" => {}
            other => {
                return Err(Socks5Error::invalid_url(
                    raw,
                    format!("unsupported scheme {other:?}"),
                ))
            }
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(Socks5Error::invalid_url(raw, "missing host")),
        };

        let username = decode(url.username()).filter(|u| !u.is_empty());
        let password = url.password().and_then(decode);

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            username,
            password,
        })
    }

    /// Proxy host (domain or IP literal, without brackets)
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Proxy port
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Configured username, if any
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Configured password, if any
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Whether any credential was supplied
    #[must_use]
    pub const fn has_auth(&self) -> bool {
        self.username.is_some() || self.password.is_some()
    }

    /// `host:port` form usable for display and dialing
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

// Credentials stay out of logs
impl fmt::Debug for ProxyUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyUrl")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("has_auth", &self.has_auth())
            .finish()
    }
}

impl fmt::Display for ProxyUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socks5://{}", self.authority())
    }
}

fn decode(raw: &str) -> Option<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}
