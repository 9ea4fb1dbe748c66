//! Content digests of records the secondary store already holds.
//!
//! Every record this engine writes to the primary store comes back to it
//! through the change stream. When the secondary store has already
//! acknowledged that exact content, re-queuing it would only cost another
//! round of writes, so the change-capture bridge consults this map and
//! drops the echo.
//!
//! Entries are recorded after a successful secondary write (by the sync
//! processor and by ETL) and forgotten on delete events. The map is
//! bounded: once it grows a quarter past its capacity, everything but the
//! most recently recorded `capacity` keys is evicted in one pass.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Digests kept when no capacity is configured.
pub const DEFAULT_DIGEST_CAPACITY: usize = 100_000;

/// Concurrent map of `idempotency_key → content hash`.
#[derive(Debug)]
pub struct ContentDigests {
    /// hash and the sequence at which it was recorded
    hashes: DashMap<String, (String, u64)>,
    capacity: usize,
    seq: AtomicU64,
}

impl Default for ContentDigests {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DIGEST_CAPACITY)
    }
}

impl ContentDigests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            hashes: DashMap::new(),
            capacity: capacity.max(1),
            seq: AtomicU64::new(0),
        }
    }

    /// Remember the hash the secondary store now holds for `key`.
    pub fn record_hash(&self, key: &str, hash: String) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.hashes.insert(key.to_string(), (hash, seq));
        if self.hashes.len() > self.capacity + self.capacity / 4 {
            self.evict_older_than(seq);
        }
    }

    /// Remember the hash of `record`.
    pub fn record(&self, record: &crate::record::Record) {
        self.record_hash(&record.idempotency_key, record.content_hash());
    }

    /// True if the secondary store already holds exactly this content.
    pub fn is_current(&self, key: &str, hash: &str) -> bool {
        self.hashes
            .get(key)
            .map(|h| h.0.as_str() == hash)
            .unwrap_or(false)
    }

    pub fn forget(&self, key: &str) {
        self.hashes.remove(key);
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Sequences are unique, so at most `capacity` entries survive.
    fn evict_older_than(&self, newest: u64) {
        let floor = newest.saturating_sub(self.capacity as u64);
        let before = self.hashes.len();
        self.hashes.retain(|_, entry| entry.1 > floor);
        debug!(
            evicted = before.saturating_sub(self.hashes.len()),
            kept = self.hashes.len(),
            "Content digests evicted"
        );
    }
}
