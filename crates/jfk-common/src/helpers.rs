//! Common helper functions.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Performs a constant-time comparison of two byte strings.
/// Used for digests and MAC tags received from the network.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

/// Time-based gate for noisy log lines.
///
/// `allow` returns true at most once per interval. A gate can also be held
/// closed until a start-up grace deadline has passed.
pub struct LogGate {
    interval: Duration,
    not_before: Option<Instant>,
    last: Mutex<Option<Instant>>,
}

impl LogGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            not_before: None,
            last: Mutex::new(None),
        }
    }

    /// Keep the gate closed until `deadline`.
    pub fn with_grace_until(mut self, deadline: Instant) -> Self {
        self.not_before = Some(deadline);
        self
    }

    pub fn allow(&self, now: Instant) -> bool {
        if let Some(deadline) = self.not_before {
            if now < deadline {
                return false;
            }
        }

        let mut guard = match self.last.lock() {
            Ok(v) => v,
            Err(_) => return false,
        };

        match *guard {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                *guard = Some(now);
                true
            }
        }
    }
}
