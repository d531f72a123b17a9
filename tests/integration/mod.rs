//! Integration tests for tun2socks
//!
//! These tests drive the crate's components against mock upstreams over
//! loopback: a SOCKS5 server and UDP/TCP DNS resolvers.
//!
//! # Test Organization
//!
//! - `frames`: IPv4 TCP/UDP frame builders and decoders
//! - `mock`: mock SOCKS5 server, DNS resolvers and in-memory client streams
//! - `socks5_integration`: SOCKS5 client against the mock server
//! - `forward_integration`: forwarding pairs, failures and timeouts
//! - `dns_integration`: UDP DNS through a live stack, DNS over TCP relay
//! - `engine_e2e`: full engine on an in-memory device
//!
//! # Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test --test integration_tests
//!
//! # Run specific test module
//! cargo test --test integration_tests engine_e2e
//! ```
//!
//! # Test Requirements
//!
//! - Everything runs on loopback; no TUN device or privileges are needed

pub mod frames;
pub mod mock;

pub mod dns_integration;
pub mod engine_e2e;
pub mod socks5_integration;
