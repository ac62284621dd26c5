//! Authenticator cache and transient key.
//!
//! The responder stays stateless between M1 and M3 by binding the exchange
//! into an authenticator, `HMAC(transient_key, g^r ‖ g^i ‖ Nr ‖ Ni ‖ address)`.
//! Replies computed for an authenticator are cached so that duplicates get
//! the same bytes back instead of a second round of signatures.
//!
//! Rotating the transient key clears the cache under the same lock: any
//! exchange still in flight has to restart from M1.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use jfk_common::constant_time_eq;
use jfk_core::MAC_LENGTH;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::kdf::hmac_sha256;
use crate::lock_or_recover;

pub const TRANSIENT_KEY_SIZE: usize = 32;

pub type AuthenticatorTag = [u8; MAC_LENGTH];

enum CacheEntry {
    /// Reply to resend on a duplicate (M3 at the initiator, M4 at the
    /// responder).
    Reply(Bytes),
    /// When an M4 was accepted.
    Completed(Instant),
}

struct CacheInner {
    transient_key: Zeroizing<[u8; TRANSIENT_KEY_SIZE]>,
    entries: HashMap<AuthenticatorTag, CacheEntry>,
    last_rotation: Instant,
    shut_down: bool,
}

impl CacheInner {
    fn rotate(&mut self, now: Instant) {
        OsRng.fill_bytes(&mut self.transient_key[..]);
        self.entries.clear();
        self.last_rotation = now;
    }

    fn needs_rotation(&self, capacity: usize, min_interval: Duration, now: Instant) -> bool {
        self.entries.len() >= capacity
            || now.saturating_duration_since(self.last_rotation) > min_interval
    }
}

pub struct AuthenticatorCache {
    capacity: usize,
    min_rotation_interval: Duration,
    inner: Mutex<CacheInner>,
}

impl AuthenticatorCache {
    pub fn new(capacity: usize, min_rotation_interval: Duration, now: Instant) -> Self {
        let mut inner = CacheInner {
            transient_key: Zeroizing::new([0u8; TRANSIENT_KEY_SIZE]),
            entries: HashMap::with_capacity(capacity.min(1024)),
            last_rotation: now,
            shut_down: false,
        };
        inner.rotate(now);
        Self {
            capacity: capacity.max(1),
            min_rotation_interval,
            inner: Mutex::new(inner),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_rotation_interval(&self) -> Duration {
        self.min_rotation_interval
    }

    /// HMAC over the concatenation of `parts` under the current transient key.
    pub fn authenticate(&self, parts: &[&[u8]]) -> AuthenticatorTag {
        let inner = lock_or_recover(&self.inner);
        hmac_sha256(&inner.transient_key[..], parts)
    }

    pub fn verify(&self, parts: &[&[u8]], tag: &AuthenticatorTag) -> bool {
        let expected = self.authenticate(parts);
        constant_time_eq(&expected, tag)
    }

    /// Cached reply for `tag`, if any.
    pub fn cached_reply(&self, tag: &AuthenticatorTag) -> Option<Bytes> {
        let inner = lock_or_recover(&self.inner);
        match inner.entries.get(tag) {
            Some(CacheEntry::Reply(reply)) => Some(reply.clone()),
            _ => None,
        }
    }

    /// Atomic check-and-insert. A hit returns the reply stored earlier and
    /// leaves it in place. On a miss, `reply` is stored unless storing would
    /// first trigger a rotation, which empties the cache.
    pub fn lookup_or_store_reply(
        &self,
        tag: AuthenticatorTag,
        reply: Bytes,
        now: Instant,
    ) -> Option<Bytes> {
        let mut inner = lock_or_recover(&self.inner);
        if inner.shut_down {
            return None;
        }
        if let Some(CacheEntry::Reply(existing)) = inner.entries.get(&tag) {
            return Some(existing.clone());
        }
        if !self.maybe_rotate_locked(&mut inner, now) {
            inner.entries.insert(tag, CacheEntry::Reply(reply));
        }
        None
    }

    /// Record that an M4 with this MAC was accepted. Returns the earlier
    /// acceptance time if it is a duplicate.
    pub fn mark_completed(&self, tag: AuthenticatorTag, now: Instant) -> Option<Instant> {
        let mut inner = lock_or_recover(&self.inner);
        if inner.shut_down {
            return None;
        }
        if let Some(CacheEntry::Completed(at)) = inner.entries.get(&tag) {
            return Some(*at);
        }
        if !self.maybe_rotate_locked(&mut inner, now) {
            inner.entries.insert(tag, CacheEntry::Completed(now));
        }
        None
    }

    fn maybe_rotate_locked(&self, inner: &mut CacheInner, now: Instant) -> bool {
        if !inner.needs_rotation(self.capacity, self.min_rotation_interval, now) {
            return false;
        }
        debug!(
            "rotating transient key ({} cached authenticators)",
            inner.entries.len()
        );
        inner.rotate(now);
        true
    }

    /// Rotate if the interval has elapsed or the cache is full.
    pub fn maybe_rotate_transient_key(&self, now: Instant) -> bool {
        let mut inner = lock_or_recover(&self.inner);
        if inner.shut_down {
            return false;
        }
        let rotated = self.maybe_rotate_locked(&mut inner, now);
        if rotated {
            info!("transient key rotated");
        }
        rotated
    }

    /// Delay until the interval-based rotation is due, plus a second of
    /// slack so the check lands after the deadline.
    pub fn next_rotation_check(&self, now: Instant) -> Duration {
        let inner = lock_or_recover(&self.inner);
        (inner.last_rotation + self.min_rotation_interval).saturating_duration_since(now)
            + Duration::from_secs(1)
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut_down(&self) -> bool {
        lock_or_recover(&self.inner).shut_down
    }

    /// Forget everything and wipe the transient key.
    pub fn shutdown(&self) {
        let mut inner = lock_or_recover(&self.inner);
        inner.shut_down = true;
        inner.entries.clear();
        inner.transient_key.iter_mut().for_each(|b| *b = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> (AuthenticatorCache, Instant) {
        let now = Instant::now();
        (
            AuthenticatorCache::new(capacity, Duration::from_secs(1800), now),
            now,
        )
    }

    #[test]
    fn test_authenticate_and_verify() {
        let (cache, _) = cache(10);
        let tag = cache.authenticate(&[&b"g^r"[..], &b"g^i"[..], &b"nonces"[..]]);
        assert!(cache.verify(&[&b"g^r"[..], &b"g^i"[..], &b"nonces"[..]], &tag));

        let mut flipped = tag;
        flipped[0] ^= 0x80;
        assert!(!cache.verify(&[&b"g^r"[..], &b"g^i"[..], &b"nonces"[..]], &flipped));
    }

    #[test]
    fn test_lookup_or_store_returns_first_reply() {
        let (cache, now) = cache(10);
        let tag = [1u8; MAC_LENGTH];

        assert_eq!(cache.lookup_or_store_reply(tag, Bytes::from_static(b"first"), now), None);
        assert_eq!(
            cache.lookup_or_store_reply(tag, Bytes::from_static(b"second"), now),
            Some(Bytes::from_static(b"first"))
        );
        assert_eq!(cache.cached_reply(&tag), Some(Bytes::from_static(b"first")));
    }

    #[test]
    fn test_mark_completed_detects_duplicates() {
        let (cache, now) = cache(10);
        let tag = [2u8; MAC_LENGTH];
        assert_eq!(cache.mark_completed(tag, now), None);
        assert_eq!(cache.mark_completed(tag, now + Duration::from_secs(1)), Some(now));
        assert_eq!(cache.cached_reply(&tag), None);
    }

    #[test]
    fn test_full_cache_rotates_instead_of_storing() {
        let (cache, now) = cache(2);
        let before = cache.authenticate(&[&b"data"[..]]);

        cache.lookup_or_store_reply([1; MAC_LENGTH], Bytes::new(), now);
        cache.lookup_or_store_reply([2; MAC_LENGTH], Bytes::new(), now);
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.lookup_or_store_reply([3; MAC_LENGTH], Bytes::new(), now), None);
        assert!(cache.is_empty());
        assert!(!cache.verify(&[&b"data"[..]], &before));
    }

    #[test]
    fn test_rotation_after_interval() {
        let (cache, now) = cache(10);
        cache.lookup_or_store_reply([1; MAC_LENGTH], Bytes::new(), now);

        assert!(!cache.maybe_rotate_transient_key(now + Duration::from_secs(60)));
        assert_eq!(cache.len(), 1);

        assert!(cache.maybe_rotate_transient_key(now + Duration::from_secs(1801)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_shutdown_refuses_new_entries() {
        let (cache, now) = cache(10);
        cache.shutdown();
        cache.lookup_or_store_reply([1; MAC_LENGTH], Bytes::new(), now);
        assert!(cache.is_empty());
        assert!(!cache.maybe_rotate_transient_key(now + Duration::from_secs(4000)));
    }
}
