//! Configuration module for tun2socks
//!
//! # Example
//!
//! ```no_run
//! use tun2socks::config::load_config;
//!
//! let config = load_config("/etc/tun2socks/config.json").unwrap();
//! println!("Proxy: {}", config.proxy.url);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    DeviceConfig, EngineConfig, ForwardConfig, LogConfig, ProxyConfig, StackConfig, MAX_MTU,
    MIN_MTU,
};
