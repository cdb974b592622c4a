//! Session Deduplication Cache
//!
//! Bounded LRU + TTL set of recently observed session keys. Pollers and
//! realtime feeds consult it before emitting a session so that the same
//! playback is published once per TTL window.
//!
//! # Guarantees
//!
//! - `len() <= capacity` at all times; inserting a new key into a full
//!   cache evicts the least-recently-touched entry.
//! - An entry older than the TTL never reports a duplicate hit, even if
//!   the periodic sweep has not yet removed it.
//! - Re-adding a tracked key refreshes its timestamp and recency without
//!   growing the cache.
//! - [`DedupCache::is_duplicate`] is an atomic check-and-mark: when many
//!   tasks race on the same unseen key, exactly one of them observes
//!   `false`.
//!
//! A TTL of zero disables expiry entirely; entries then leave the cache
//! only through capacity eviction.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

/// Default number of tracked sessions per cache.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Bounded, TTL-aware set of recently seen session keys.
///
/// All operations take a single internal lock and run in O(1), except
/// [`cleanup_expired`](Self::cleanup_expired) which walks the cache.
#[derive(Debug)]
pub struct DedupCache {
    entries: Mutex<LruCache<String, Instant>>,
    ttl: Duration,
}

impl DedupCache {
    /// Create a cache holding at most `capacity` keys for `ttl` each.
    ///
    /// A capacity of zero is clamped to one.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Create a cache with [`DEFAULT_CAPACITY`].
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::new(DEFAULT_CAPACITY, ttl)
    }

    /// Maximum number of tracked keys.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    /// Entry time-to-live. Zero means entries never expire.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether `key` is tracked and unexpired. Does not touch recency.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock();
        entries
            .peek(key)
            .is_some_and(|seen_at| !self.is_expired(*seen_at, Instant::now()))
    }

    /// Insert `key` seen at `seen_at`, or refresh it if already tracked.
    pub fn add(&self, key: &str, seen_at: Instant) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get_mut(key) {
            *existing = seen_at;
            return;
        }
        entries.push(key.to_owned(), seen_at);
    }

    /// Atomically check whether `key` was already seen, marking it if not.
    ///
    /// Returns `true` and leaves the cache untouched when `key` is tracked
    /// and unexpired. Otherwise records `key` as seen now and returns
    /// `false`.
    pub fn is_duplicate(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.peek(key).copied() {
            Some(seen_at) if !self.is_expired(seen_at, now) => true,
            Some(_) => {
                // Expired entries count as unseen; refresh in place.
                if let Some(existing) = entries.get_mut(key) {
                    *existing = now;
                }
                false
            }
            None => {
                entries.push(key.to_owned(), now);
                false
            }
        }
    }

    /// Remove every entry older than the TTL. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, seen_at)| self.is_expired(**seen_at, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Number of tracked keys, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache tracks no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every tracked key.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn is_expired(&self, seen_at: Instant, now: Instant) -> bool {
        !self.ttl.is_zero() && now.saturating_duration_since(seen_at) > self.ttl
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, Duration::from_secs(3600))
    }
}

// =============================================================================
// Tests
// =============================================================================
