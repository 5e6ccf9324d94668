//! Seen-CLSIG cache for dedup and inventory answering.
//!
//! Every chain-lock signature hash that reaches the handler is recorded
//! here with its first-receipt time, whatever its fate afterwards: accepted,
//! stale or conflicting. That makes the cache double as the inventory
//! "already have" answer, so a peer re-advertising a rejected CLSIG never
//! triggers a re-fetch.
//!
//! ## Eviction
//!
//! Entries are evicted by age during the periodic cleanup pass; the handler
//! passes a cutoff derived from `CLEANUP_SEEN_TIMEOUT`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use granite_types::H256;
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Timestamped set of chain-lock hashes the handler has already seen.
#[derive(Debug, Default)]
pub struct SeenCache {
    /// CLSIG hash → first-receipt time in milliseconds.
    entries: Mutex<HashMap<H256, i64>>,
}

impl SeenCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `hash` at `now_ms`.
    ///
    /// Returns `true` when the hash is new; `false` when it was already
    /// present (the dedup gate). The original receipt time is kept.
    pub fn observe(&self, hash: H256, now_ms: i64) -> bool {
        let mut entries = self.entries.lock();
        match entries.entry(hash) {
            Entry::Occupied(_) => {
                trace!(hash = %hash.short_hex(), "duplicate CLSIG hash");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(now_ms);
                true
            }
        }
    }

    /// Whether `hash` has been seen (accepted or not).
    pub fn contains(&self, hash: &H256) -> bool {
        self.entries.lock().contains_key(hash)
    }

    /// Drops entries first seen strictly before `cutoff_ms`.
    ///
    /// Returns the number of evicted entries.
    pub fn evict_older_than(&self, cutoff_ms: i64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, seen_ms| *seen_ms >= cutoff_ms);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "evicted seen CLSIG hashes");
        }
        evicted
    }

    /// Number of cached hashes.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> H256 {
        H256::keccak256(&[n])
    }

    #[test]
    fn test_first_observation_is_new() {
        let cache = SeenCache::new();
        assert!(cache.observe(hash(1), 100));
        assert!(cache.contains(&hash(1)));
    }

    #[test]
    fn test_second_observation_is_duplicate() {
        let cache = SeenCache::new();
        assert!(cache.observe(hash(1), 100));
        assert!(!cache.observe(hash(1), 200));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_by_age() {
        let cache = SeenCache::new();
        cache.observe(hash(1), 100);
        cache.observe(hash(2), 500);

        assert_eq!(cache.evict_older_than(200), 1);
        assert!(!cache.contains(&hash(1)));
        assert!(cache.contains(&hash(2)));
    }

    #[test]
    fn test_eviction_keeps_entries_at_cutoff() {
        let cache = SeenCache::new();
        cache.observe(hash(1), 200);
        assert_eq!(cache.evict_older_than(200), 0);
        assert!(cache.contains(&hash(1)));
    }

    #[test]
    fn test_duplicate_keeps_original_timestamp() {
        let cache = SeenCache::new();
        cache.observe(hash(1), 100);
        // Re-observing must not refresh the entry past the cutoff.
        cache.observe(hash(1), 900);
        assert_eq!(cache.evict_older_than(500), 1);
    }
}
