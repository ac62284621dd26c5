//! Rekey throttling for initiators we cannot identify yet.
//!
//! Known peers keep their last-rekey time in their handshake state; anyone
//! else is tracked by source IP in a bounded LRU table. The port is not
//! part of the key.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::lock_or_recover;

pub struct RekeyThrottle {
    window: Duration,
    capacity: usize,
    recent: Mutex<LruCache<IpAddr, Instant>>,
}

impl RekeyThrottle {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = capacity.max(1);
        let bound = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            window,
            capacity,
            recent: Mutex::new(LruCache::new(bound)),
        }
    }

    /// Record an M1 from `source`. Returns true if a previous one from the
    /// same IP arrived less than the window ago, in which case this one must
    /// be dropped.
    pub fn throttle(&self, source: SocketAddr, now: Instant) -> bool {
        let address = source.ip();
        let mut recent = lock_or_recover(&self.recent);

        let previous = recent.get(&address).copied();
        if previous.map_or(true, |last| now > last) {
            recent.put(address, now);
        }

        while let Some(oldest) = recent.peek_lru().map(|(_, at)| *at) {
            let stale = now.saturating_duration_since(oldest) > self.window;
            if recent.len() > self.capacity || stale {
                recent.pop_lru();
            } else {
                break;
            }
        }

        match previous {
            Some(last) => now.saturating_duration_since(last) < self.window,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.recent).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-peer variant for known initiators.
pub(crate) fn peer_rekey_throttled(
    last_rekey: &mut Option<Instant>,
    window: Duration,
    now: Instant,
) -> bool {
    let throttled = matches!(*last_rekey, Some(last) if now.saturating_duration_since(last) < window);
    if !throttled {
        *last_rekey = Some(now);
    }
    throttled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, host], 4100))
    }

    #[test]
    fn test_second_attempt_inside_window_is_throttled() {
        let throttle = RekeyThrottle::new(16, Duration::from_secs(1));
        let now = Instant::now();

        assert!(!throttle.throttle(addr(1), now));
        assert!(throttle.throttle(addr(1), now + Duration::from_millis(300)));
        assert!(!throttle.throttle(addr(2), now + Duration::from_millis(300)));
    }

    #[test]
    fn test_changing_source_port_does_not_escape() {
        let throttle = RekeyThrottle::new(16, Duration::from_secs(1));
        let now = Instant::now();

        assert!(!throttle.throttle(SocketAddr::from(([10, 0, 0, 1], 4100)), now));
        assert!(throttle.throttle(
            SocketAddr::from(([10, 0, 0, 1], 4101)),
            now + Duration::from_millis(100)
        ));
        assert_eq!(throttle.len(), 1);
    }

    #[test]
    fn test_attempt_after_window_proceeds() {
        let throttle = RekeyThrottle::new(16, Duration::from_secs(1));
        let now = Instant::now();

        assert!(!throttle.throttle(addr(1), now));
        assert!(!throttle.throttle(addr(1), now + Duration::from_millis(1500)));
    }

    #[test]
    fn test_stale_entries_are_evicted() {
        let throttle = RekeyThrottle::new(16, Duration::from_secs(1));
        let now = Instant::now();
        for host in 0..10 {
            throttle.throttle(addr(host), now);
        }
        assert_eq!(throttle.len(), 10);

        throttle.throttle(addr(100), now + Duration::from_secs(5));
        assert_eq!(throttle.len(), 1);
    }

    #[test]
    fn test_table_is_bounded() {
        let throttle = RekeyThrottle::new(4, Duration::from_secs(60));
        let now = Instant::now();
        for host in 0..20 {
            throttle.throttle(addr(host), now);
        }
        assert_eq!(throttle.len(), 4);
    }

    #[test]
    fn test_peer_rekey_window() {
        let mut last = None;
        let now = Instant::now();
        let window = Duration::from_secs(1);

        assert!(!peer_rekey_throttled(&mut last, window, now));
        assert!(peer_rekey_throttled(&mut last, window, now + Duration::from_millis(10)));
        assert!(!peer_rekey_throttled(&mut last, window, now + Duration::from_secs(2)));
    }
}
