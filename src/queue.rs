//! De-duplicating, order-stable buffer of records awaiting replication.
//!
//! # Design
//!
//! ```text
//!  submit / change capture
//!           │ enqueue (latest wins, position kept)
//!           ▼
//!   ┌──────────────────────────┐   drain(n)   ┌──────────────┐
//!   │ pending: key → item      │ ───────────▶ │ in_flight    │
//!   │ order:   VecDeque<key>   │ ◀─────────── │ key → item   │
//!   └──────────────────────────┘   restore    └──────┬───────┘
//!                                                    │ complete
//!                                                    ▼
//!                                                 dropped
//! ```
//!
//! Drained items stay counted by [`RecordQueue::size()`] until the processor
//! either completes them (both stores acknowledged) or restores them to the
//! front of the queue. A key that is re-submitted while its previous version
//! is in flight gets a fresh pending entry; the stale in-flight copy is then
//! dropped on restore so the newer payload wins.
//!
//! All operations take a `parking_lot::Mutex` for a few hash lookups and
//! never await, so producers are never blocked on network I/O.

use crate::record::Record;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// A record waiting in the queue plus retry metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub record: Record,
    /// When the current version was first queued.
    pub queued_at: DateTime<Utc>,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Cached [`Record::content_hash()`].
    pub content_hash: String,
}

impl QueueItem {
    pub fn new(record: Record, queued_at: DateTime<Utc>) -> Self {
        let content_hash = record.content_hash();
        Self {
            record,
            queued_at,
            attempts: 0,
            last_error: None,
            content_hash,
        }
    }

    pub fn key(&self) -> &str {
        &self.record.idempotency_key
    }
}

/// What `enqueue` did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New key, appended at the back.
    Appended,
    /// Pending key, payload replaced in place.
    Replaced,
    /// Identical content already pending or in flight.
    Unchanged,
}

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<String>,
    pending: HashMap<String, QueueItem>,
    in_flight: HashMap<String, QueueItem>,
    /// Drain order of in-flight keys, for snapshots.
    in_flight_order: Vec<String>,
    generation: u64,
}

impl Inner {
    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Thread-safe pending-record queue.
#[derive(Debug, Default)]
pub struct RecordQueue {
    inner: Mutex<Inner>,
}

impl RecordQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a record.
    pub fn enqueue(&self, record: Record) -> EnqueueOutcome {
        self.enqueue_at(record, Utc::now())
    }

    /// [`enqueue`](Self::enqueue) with an explicit queue time.
    pub fn enqueue_at(&self, record: Record, now: DateTime<Utc>) -> EnqueueOutcome {
        let item = QueueItem::new(record, now);
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.pending.get_mut(item.key()) {
            if existing.content_hash == item.content_hash {
                return EnqueueOutcome::Unchanged;
            }
            existing.record = item.record;
            existing.content_hash = item.content_hash;
            inner.bump();
            return EnqueueOutcome::Replaced;
        }

        if let Some(flying) = inner.in_flight.get(item.key()) {
            if flying.content_hash == item.content_hash {
                return EnqueueOutcome::Unchanged;
            }
        }

        let key = item.key().to_string();
        inner.order.push_back(key.clone());
        inner.pending.insert(key, item);
        inner.bump();
        EnqueueOutcome::Appended
    }

    /// Put back items loaded from the checkpoint journal, keeping their
    /// queue time and attempt count. Keys already queued are left alone.
    pub fn replay(&self, items: Vec<QueueItem>) -> usize {
        let mut inner = self.inner.lock();
        let mut added = 0;
        for item in items {
            if inner.pending.contains_key(item.key()) || inner.in_flight.contains_key(item.key())
            {
                continue;
            }
            let key = item.key().to_string();
            inner.order.push_back(key.clone());
            inner.pending.insert(key, item);
            added += 1;
        }
        if added > 0 {
            inner.bump();
        }
        added
    }

    /// Take up to `max` oldest pending items and mark them in flight.
    ///
    /// Keys whose previous version is still in flight are skipped (they keep
    /// their position) so one key is never written twice concurrently.
    pub fn drain(&self, max: usize) -> Vec<QueueItem> {
        let mut inner = self.inner.lock();
        if max == 0 || inner.order.is_empty() {
            return Vec::new();
        }

        let mut batch = Vec::with_capacity(max.min(inner.order.len()));
        let mut kept = VecDeque::with_capacity(inner.order.len());

        while let Some(key) = inner.order.pop_front() {
            if batch.len() >= max || inner.in_flight.contains_key(&key) {
                kept.push_back(key);
                continue;
            }
            if let Some(item) = inner.pending.remove(&key) {
                inner.in_flight.insert(key.clone(), item.clone());
                inner.in_flight_order.push(key);
                batch.push(item);
            }
        }
        inner.order = kept;

        if !batch.is_empty() {
            inner.bump();
        }
        batch
    }

    /// Forget in-flight entries that both stores acknowledged.
    pub fn complete(&self, keys: &[String]) {
        let mut inner = self.inner.lock();
        let mut removed = false;
        for key in keys {
            removed |= inner.in_flight.remove(key).is_some();
        }
        if removed {
            let Inner {
                in_flight,
                in_flight_order,
                ..
            } = &mut *inner;
            in_flight_order.retain(|k| in_flight.contains_key(k));
            inner.bump();
        }
    }

    /// Return in-flight items to the front of the queue, in their original
    /// order, recording the failure. If a newer version of a key was queued
    /// while the old one was in flight, the old one is dropped.
    ///
    /// Returns how many items went back into the pending order.
    pub fn restore(&self, keys: &[String], error: Option<&str>) -> usize {
        let mut inner = self.inner.lock();
        let mut restored = 0;

        for key in keys.iter().rev() {
            let Some(mut item) = inner.in_flight.remove(key) else {
                continue;
            };
            if inner.pending.contains_key(key) {
                continue;
            }
            item.attempts = item.attempts.saturating_add(1);
            if let Some(e) = error {
                item.last_error = Some(e.to_string());
            }
            inner.order.push_front(key.clone());
            inner.pending.insert(key.clone(), item);
            restored += 1;
        }

        let Inner {
            in_flight,
            in_flight_order,
            ..
        } = &mut *inner;
        in_flight_order.retain(|k| in_flight.contains_key(k));
        inner.bump();
        restored
    }

    /// Distinct keys pending or in flight.
    pub fn size(&self) -> usize {
        let inner = self.inner.lock();
        let overlap = inner
            .in_flight
            .keys()
            .filter(|k| inner.pending.contains_key(*k))
            .count();
        inner.pending.len() + inner.in_flight.len() - overlap
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether anything is waiting to be drained.
    pub fn has_pending(&self) -> bool {
        !self.inner.lock().order.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        let inner = self.inner.lock();
        inner.pending.contains_key(key) || inner.in_flight.contains_key(key)
    }

    /// Latest queued version of `key`, if any.
    pub fn get(&self, key: &str) -> Option<Record> {
        let inner = self.inner.lock();
        inner
            .pending
            .get(key)
            .or_else(|| inner.in_flight.get(key))
            .map(|item| item.record.clone())
    }

    /// Every queued item, in-flight first, one entry per key (newest version).
    pub fn snapshot(&self) -> Vec<QueueItem> {
        let inner = self.inner.lock();
        let mut items = Vec::with_capacity(inner.pending.len() + inner.in_flight.len());
        for key in &inner.in_flight_order {
            if inner.pending.contains_key(key) {
                continue;
            }
            if let Some(item) = inner.in_flight.get(key) {
                items.push(item.clone());
            }
        }
        for key in &inner.order {
            if let Some(item) = inner.pending.get(key) {
                items.push(item.clone());
            }
        }
        items
    }

    /// Counter bumped on every mutation.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }
}
