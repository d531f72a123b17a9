//! Configuration loading
//!
//! Loads configuration from JSON files and applies environment overrides.

use std::path::Path;

use tracing::{debug, info};

use super::types::EngineConfig;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: EngineConfig = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: proxy={}, mtu={}",
        config.proxy.url, config.device.mtu
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TUN2SOCKS_PROXY_URL`: Override proxy URL
/// - `TUN2SOCKS_MTU`: Override device MTU
/// - `TUN2SOCKS_LOG_LEVEL`: Override log level
/// - `TUN2SOCKS_DNS_RESOLVER`: Override DNS resolver address
/// - `TUN2SOCKS_PAIR_TIMEOUT_SECS`: Override forwarding pair timeout
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or an override fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

/// Apply overrides from a variable lookup function
///
/// Split out from [`load_config_with_env`] so overrides can be exercised
/// without touching the process environment.
pub(crate) fn apply_env_overrides(
    config: &mut EngineConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(url) = lookup("TUN2SOCKS_PROXY_URL") {
        config.proxy.url = url;
        debug!("Proxy URL overridden to {}", config.proxy.url);
    }

    if let Some(mtu) = lookup("TUN2SOCKS_MTU") {
        config.device.mtu = mtu
            .parse()
            .map_err(|_| ConfigError::env("TUN2SOCKS_MTU", format!("Invalid number: {mtu}")))?;
        debug!("MTU overridden to {}", config.device.mtu);
    }

    if let Some(level) = lookup("TUN2SOCKS_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(resolver) = lookup("TUN2SOCKS_DNS_RESOLVER") {
        config.forward.dns_resolver = resolver.parse().map_err(|_| {
            ConfigError::env(
                "TUN2SOCKS_DNS_RESOLVER",
                format!("Invalid socket address: {resolver}"),
            )
        })?;
        debug!("DNS resolver overridden to {}", config.forward.dns_resolver);
    }

    if let Some(secs) = lookup("TUN2SOCKS_PAIR_TIMEOUT_SECS") {
        config.forward.pair_timeout_secs = secs.parse().map_err(|_| {
            ConfigError::env(
                "TUN2SOCKS_PAIR_TIMEOUT_SECS",
                format!("Invalid number: {secs}"),
            )
        })?;
        debug!(
            "Pair timeout overridden to {}s",
            config.forward.pair_timeout_secs
        );
    }

    Ok(())
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = EngineConfig::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
