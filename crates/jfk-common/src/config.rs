//! Handshake tuning knobs.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration. Environment variables prefixed with `JFK_` override values
//! loaded from a file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Pre-generated key-agreement contexts kept per algorithm.
    pub context_pool_size: usize,
    /// Seconds between background context generations.
    pub context_generation_interval_secs: u64,
    /// Whether the ECDH (negotiation type 8) pool is maintained.
    pub enable_ecdh: bool,
    /// Minimum seconds between transient key rotations.
    pub transient_key_rekey_interval_secs: u64,
    pub authenticator_cache_capacity: usize,
    /// Cache capacity used when anonymous initiators are accepted.
    pub open_authenticator_cache_capacity: usize,
    pub accept_anonymous_initiators: bool,
    /// Window during which a second M1 from the same address is refused.
    pub rekey_throttle_millis: u64,
    pub rekey_throttle_table_size: usize,
    pub max_nonces_per_peer: usize,
    pub message3_resend_secs: u64,
    pub max_auth_padding: usize,
    pub no_contexts_log_interval_secs: u64,
    /// Authentication failures are not logged for this long after start.
    pub startup_grace_secs: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            context_pool_size: 20,
            context_generation_interval_secs: 30,
            enable_ecdh: true,
            transient_key_rekey_interval_secs: 30 * 60,
            authenticator_cache_capacity: 250,
            open_authenticator_cache_capacity: 5000,
            accept_anonymous_initiators: false,
            rekey_throttle_millis: 1000,
            rekey_throttle_table_size: 1024,
            max_nonces_per_peer: 10,
            message3_resend_secs: 5,
            max_auth_padding: 100,
            no_contexts_log_interval_secs: 60,
            startup_grace_secs: 20,
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl HandshakeConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Apply `JFK_*` environment overrides on top of the current values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("JFK_CONTEXT_POOL_SIZE") {
            self.context_pool_size = v;
        }
        if let Some(v) = env_parse("JFK_CONTEXT_GENERATION_INTERVAL_SECS") {
            self.context_generation_interval_secs = v;
        }
        if let Some(v) = env_bool("JFK_ENABLE_ECDH") {
            self.enable_ecdh = v;
        }
        if let Some(v) = env_parse("JFK_TRANSIENT_KEY_REKEY_INTERVAL_SECS") {
            self.transient_key_rekey_interval_secs = v;
        }
        if let Some(v) = env_bool("JFK_ACCEPT_ANONYMOUS_INITIATORS") {
            self.accept_anonymous_initiators = v;
        }
        if let Some(v) = env_parse("JFK_REKEY_THROTTLE_MILLIS") {
            self.rekey_throttle_millis = v;
        }
        if let Some(v) = env_parse("JFK_MAX_AUTH_PADDING") {
            self.max_auth_padding = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.context_pool_size == 0 {
            return Err(Error::config("context_pool_size must be at least 1"));
        }
        if self.context_generation_interval_secs == 0 {
            return Err(Error::config(
                "context_generation_interval_secs must be at least 1",
            ));
        }
        if self.authenticator_cache_capacity == 0 || self.open_authenticator_cache_capacity == 0 {
            return Err(Error::config("authenticator cache capacity must be at least 1"));
        }
        if self.rekey_throttle_table_size == 0 {
            return Err(Error::config("rekey_throttle_table_size must be at least 1"));
        }
        if self.max_nonces_per_peer == 0 {
            return Err(Error::config("max_nonces_per_peer must be at least 1"));
        }
        if self.transient_key_rekey_interval_secs == 0 {
            return Err(Error::config(
                "transient_key_rekey_interval_secs must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn context_generation_interval(&self) -> Duration {
        Duration::from_secs(self.context_generation_interval_secs)
    }

    /// How long an initiator keeps using the same context for one peer.
    pub fn context_reuse_window(&self) -> Duration {
        self.context_generation_interval() * self.context_pool_size as u32
    }

    pub fn transient_key_rekey_interval(&self) -> Duration {
        Duration::from_secs(self.transient_key_rekey_interval_secs)
    }

    pub fn rekey_throttle_window(&self) -> Duration {
        Duration::from_millis(self.rekey_throttle_millis)
    }

    pub fn message3_resend_delay(&self) -> Duration {
        Duration::from_secs(self.message3_resend_secs)
    }

    pub fn no_contexts_log_interval(&self) -> Duration {
        Duration::from_secs(self.no_contexts_log_interval_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    /// Capacity of the authenticator cache for this node.
    pub fn effective_authenticator_cache_capacity(&self) -> usize {
        if self.accept_anonymous_initiators {
            self.open_authenticator_cache_capacity
        } else {
            self.authenticator_cache_capacity
        }
    }
}
