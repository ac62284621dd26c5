//! Shared utilities for the JFK handshake: configuration, logging, error types.
//!
//! This crate provides common infrastructure used by the wire, crypto and
//! node crates.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod helpers;

pub use config::HandshakeConfig;
pub use error::{Error, Result};
pub use helpers::{constant_time_eq, LogGate};

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing with a specific default level.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Initialize tracing for tests; safe to call more than once.
pub fn try_init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
