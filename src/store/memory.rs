//! In-process stores.
//!
//! [`MemoryPrimaryStore`] keeps documents in a `DashMap` and a bounded
//! change log with monotonically increasing sequence numbers as resume
//! tokens, so it behaves like the real primary for the bridge: resumable
//! subscriptions, compaction that invalidates old tokens, outages that end
//! every open subscription.
//!
//! The change log keeps at most `log_capacity` entries, the same bound the
//! Redis store puts on its stream with `MAXLEN`.
//!
//! Both stores have switches (`set_available`, `fail_keys`, `trim_log`)
//! used by tests to inject outages.

use super::{
    sort_and_limit, BoxFuture, ChangeEvent, ChangeOp, ChangeStream, InsertManyResult,
    PrimaryStore, QueryOptions, RecordFilter, ResumeToken, RowFailure, SecondaryStore,
    UpsertSummary, CHANGE_CHANNEL_CAPACITY,
};
use crate::error::{Result, SyncError};
use crate::record::Record;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

// ═══════════════════════════════════════════════════════════════════════════════
// Primary
// ═══════════════════════════════════════════════════════════════════════════════

/// Change log entries kept by default.
pub const DEFAULT_LOG_CAPACITY: usize = 100_000;

struct ChangeLog {
    entries: VecDeque<(u64, ChangeEvent)>,
    capacity: usize,
    next_seq: u64,
    /// Highest sequence dropped by compaction.
    trimmed_through: u64,
    watchers: Vec<mpsc::Sender<Result<ChangeEvent>>>,
}

impl ChangeLog {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            next_seq: 0,
            trimmed_through: 0,
            watchers: Vec::new(),
        }
    }

    fn trim_to(&mut self, keep: usize) {
        while self.entries.len() > keep {
            if let Some((seq, _)) = self.entries.pop_front() {
                self.trimmed_through = seq;
            }
        }
    }

    fn append(&mut self, op: ChangeOp, key: &str, doc: Option<Record>) {
        self.next_seq += 1;
        let event = ChangeEvent {
            op,
            key: key.to_string(),
            full_document: doc,
            resume_token: ResumeToken::new(self.next_seq.to_string()),
        };
        // A watcher that cannot keep up is dropped; it resumes from its
        // last token and gets the rest replayed.
        self.watchers
            .retain(|tx| tx.try_send(Ok(event.clone())).is_ok());
        self.entries.push_back((self.next_seq, event));
        let capacity = self.capacity;
        self.trim_to(capacity);
    }

    fn fail_watchers(&mut self, message: &str) {
        for tx in self.watchers.drain(..) {
            let _ = tx.try_send(Err(SyncError::ChangeStream(message.to_string())));
        }
    }
}

/// In-process primary store with a resumable change log.
pub struct MemoryPrimaryStore {
    docs: DashMap<String, Record>,
    log: Mutex<ChangeLog>,
    available: AtomicBool,
    connected: AtomicBool,
    write_calls: AtomicUsize,
}

impl Default for MemoryPrimaryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPrimaryStore {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    /// Store whose change log keeps at most `capacity` entries.
    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            docs: DashMap::new(),
            log: Mutex::new(ChangeLog::new(capacity)),
            available: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            write_calls: AtomicUsize::new(0),
        }
    }

    /// Simulate an outage. Going unavailable ends every open subscription
    /// with an error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.connected.store(false, Ordering::SeqCst);
            self.log.lock().fail_watchers("primary store unavailable");
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Close every open subscription without an error.
    pub fn disconnect_watchers(&self) {
        self.log.lock().watchers.clear();
    }

    /// Compact the change log down to its newest `keep` entries. Tokens
    /// older than the retained history become invalid.
    pub fn trim_log(&self, keep: usize) {
        self.log.lock().trim_to(keep);
    }

    /// Number of change events still held for replay.
    pub fn log_len(&self) -> usize {
        self.log.lock().entries.len()
    }

    /// Write a record as another client would: bypasses availability and
    /// the engine, still publishes a change event. `None` when the stored
    /// content was already identical.
    pub fn write_external(&self, record: Record) -> Option<ChangeOp> {
        let mut log = self.log.lock();
        self.upsert_locked(&mut log, record)
    }

    /// Delete a record, publishing a delete event.
    pub fn delete(&self, key: &str) -> bool {
        let mut log = self.log.lock();
        let removed = self.docs.remove(key).is_some();
        if removed {
            log.append(ChangeOp::Delete, key, None);
        }
        removed
    }

    pub fn get(&self, key: &str) -> Option<Record> {
        self.docs.get(key).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn watcher_count(&self) -> usize {
        let mut log = self.log.lock();
        log.watchers.retain(|tx| !tx.is_closed());
        log.watchers.len()
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Token of the newest logged change, if any.
    pub fn latest_token(&self) -> Option<ResumeToken> {
        self.log.lock().entries.back().map(|(_, e)| e.resume_token.clone())
    }

    /// `None` when content is unchanged.
    fn upsert_locked(&self, log: &mut ChangeLog, record: Record) -> Option<ChangeOp> {
        let op = match self.docs.get(&record.idempotency_key) {
            Some(existing) if existing.content_hash() == record.content_hash() => return None,
            Some(_) => ChangeOp::Replace,
            None => ChangeOp::Insert,
        };
        let key = record.idempotency_key.clone();
        self.docs.insert(key.clone(), record.clone());
        log.append(op, &key, Some(record));
        Some(op)
    }

    fn ensure_available(&self, operation: &str) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            self.connected.store(false, Ordering::SeqCst);
            Err(SyncError::primary(operation, "store unavailable"))
        }
    }
}

impl PrimaryStore for MemoryPrimaryStore {
    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_available("connect")?;
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ping(&self) -> BoxFuture<'_, Duration> {
        Box::pin(async move {
            let start = Instant::now();
            self.ensure_available("ping")?;
            self.connected.store(true, Ordering::SeqCst);
            Ok(start.elapsed())
        })
    }

    fn batch_write<'a>(&'a self, records: &'a [Record]) -> BoxFuture<'a, UpsertSummary> {
        Box::pin(async move {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            self.ensure_available("batch_write")?;

            let mut summary = UpsertSummary::default();
            let mut log = self.log.lock();
            for record in records {
                match self.upsert_locked(&mut log, record.clone()) {
                    None => summary.matched += 1,
                    Some(ChangeOp::Insert) => summary.inserted += 1,
                    Some(_) => {
                        summary.matched += 1;
                        summary.modified += 1;
                    }
                }
            }
            Ok(summary)
        })
    }

    fn query(&self, filter: RecordFilter, options: QueryOptions) -> BoxFuture<'_, Vec<Record>> {
        Box::pin(async move {
            self.ensure_available("query")?;
            let mut records: Vec<Record> = self
                .docs
                .iter()
                .filter(|r| filter.matches(r.value()))
                .map(|r| r.value().clone())
                .collect();
            sort_and_limit(&mut records, options);
            Ok(records)
        })
    }

    fn watch(&self, resume_after: Option<ResumeToken>) -> BoxFuture<'_, ChangeStream> {
        Box::pin(async move {
            self.ensure_available("watch")?;
            let mut log = self.log.lock();

            let replay: Vec<ChangeEvent> = match &resume_after {
                None => Vec::new(),
                Some(token) => {
                    let seq: u64 = token.as_str().parse().map_err(|_| {
                        SyncError::ResumeTokenInvalid {
                            token: token.to_string(),
                        }
                    })?;
                    if seq < log.trimmed_through || seq > log.next_seq {
                        return Err(SyncError::ResumeTokenInvalid {
                            token: token.to_string(),
                        });
                    }
                    log.entries
                        .iter()
                        .filter(|(s, _)| *s > seq)
                        .map(|(_, e)| e.clone())
                        .collect()
                }
            };

            let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY + replay.len());
            let replayed = replay.len();
            for event in replay {
                // Capacity covers the replay.
                let _ = tx.try_send(Ok(event));
            }
            log.watchers.push(tx);
            debug!(resume_after = ?resume_after, replayed, "Change subscription opened");
            Ok(rx)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Secondary
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process secondary store.
pub struct MemorySecondaryStore {
    rows: DashMap<String, Record>,
    failing_keys: DashSet<String>,
    available: AtomicBool,
    write_calls: AtomicUsize,
}

impl Default for MemorySecondaryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySecondaryStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            failing_keys: DashSet::new(),
            available: AtomicBool::new(true),
            write_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make rows with these keys fail individually.
    pub fn fail_keys<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for key in keys {
            self.failing_keys.insert(key.into());
        }
    }

    pub fn clear_failing_keys(&self) {
        self.failing_keys.clear();
    }

    pub fn get(&self, key: &str) -> Option<Record> {
        self.rows.get(key).map(|r| r.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }
}

impl SecondaryStore for MemorySecondaryStore {
    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.available.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(SyncError::secondary("connect", "store unavailable"))
            }
        })
    }

    fn test_connection(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move { self.available.load(Ordering::SeqCst) })
    }

    fn batch_write<'a>(&'a self, records: &'a [Record]) -> BoxFuture<'a, InsertManyResult> {
        Box::pin(async move {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            if !self.available.load(Ordering::SeqCst) {
                return Err(SyncError::secondary("batch_write", "store unavailable"));
            }

            let mut result = InsertManyResult::default();
            for record in records {
                if self.failing_keys.contains(&record.idempotency_key) {
                    result.failed.push(RowFailure {
                        key: record.idempotency_key.clone(),
                        error: "row rejected".to_string(),
                    });
                    continue;
                }
                // Same rule as the SQLite upsert: never regress to an older version.
                match self.rows.entry(record.idempotency_key.clone()) {
                    Entry::Occupied(mut row) => {
                        if record.created_at >= row.get().created_at {
                            row.insert(record.clone());
                        }
                    }
                    Entry::Vacant(row) => {
                        row.insert(record.clone());
                    }
                }
                result.inserted_count += 1;
            }
            Ok(result)
        })
    }

    fn query_since(&self, since: DateTime<Utc>, limit: usize) -> BoxFuture<'_, Vec<Record>> {
        Box::pin(async move {
            if !self.available.load(Ordering::SeqCst) {
                return Err(SyncError::secondary("query_since", "store unavailable"));
            }
            let filter = RecordFilter::after(since);
            let mut records: Vec<Record> = self
                .rows
                .iter()
                .filter(|r| filter.matches(r.value()))
                .map(|r| r.value().clone())
                .collect();
            sort_and_limit(
                &mut records,
                QueryOptions {
                    limit,
                    ..QueryOptions::default()
                },
            );
            Ok(records)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SubmitRecord;
    use chrono::TimeZone;

    fn rec(key: &str, key_count: i64) -> Record {
        SubmitRecord::new(key_count, 10.0)
            .with_key(key)
            .with_timestamp(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
            .into_record(Utc::now())
            .unwrap()
    }

    #[tokio::test]
    async fn test_primary_upsert_summary() {
        let store = MemoryPrimaryStore::new();
        let summary = store.batch_write(&[rec("a", 1), rec("b", 2)]).await.unwrap();
        assert_eq!(summary, UpsertSummary { matched: 0, inserted: 2, modified: 0 });

        let summary = store.batch_write(&[rec("a", 1), rec("b", 3)]).await.unwrap();
        assert_eq!(summary, UpsertSummary { matched: 2, inserted: 0, modified: 1 });
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("b").unwrap().key_count, 3);
    }

    #[tokio::test]
    async fn test_primary_watch_delivers_changes_only() {
        let store = MemoryPrimaryStore::new();
        let mut stream = store.watch(None).await.unwrap();

        store.batch_write(&[rec("a", 1)]).await.unwrap();
        store.batch_write(&[rec("a", 1)]).await.unwrap();
        store.batch_write(&[rec("a", 2)]).await.unwrap();

        let first = stream.recv().await.unwrap().unwrap();
        assert_eq!(first.op, ChangeOp::Insert);
        let second = stream.recv().await.unwrap().unwrap();
        assert_eq!(second.op, ChangeOp::Replace);
        assert_eq!(second.full_document.unwrap().key_count, 2);
        assert!(stream.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_primary_watch_resumes_after_token() {
        let store = MemoryPrimaryStore::new();
        store.write_external(rec("a", 1));
        let token = store.latest_token().unwrap();
        store.write_external(rec("b", 1));
        store.write_external(rec("c", 1));

        let mut stream = store.watch(Some(token)).await.unwrap();
        let keys: Vec<String> = vec![
            stream.recv().await.unwrap().unwrap().key,
            stream.recv().await.unwrap().unwrap().key,
        ];
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_primary_trimmed_token_is_invalid() {
        let store = MemoryPrimaryStore::new();
        store.write_external(rec("a", 1));
        let old = store.latest_token().unwrap();
        for i in 0..5 {
            store.write_external(rec(&format!("k{}", i), 1));
        }
        store.trim_log(2);

        let err = store.watch(Some(old)).await.unwrap_err();
        assert!(matches!(err, SyncError::ResumeTokenInvalid { .. }));
        assert!(store.watch(Some(ResumeToken::new("garbage"))).await.is_err());
        assert!(store.watch(store.latest_token()).await.is_ok());
    }

    #[tokio::test]
    async fn test_primary_log_stays_within_capacity() {
        let store = MemoryPrimaryStore::with_log_capacity(3);
        store.write_external(rec("a", 1));
        let old = store.latest_token().unwrap();
        store.write_external(rec("b", 1));
        let recent = store.latest_token().unwrap();
        for i in 0..10 {
            store.write_external(rec(&format!("k{}", i), 1));
        }
        assert_eq!(store.log_len(), 3);

        let err = store.watch(Some(old)).await.unwrap_err();
        assert!(matches!(err, SyncError::ResumeTokenInvalid { .. }));
        assert!(store.watch(Some(recent)).await.is_err());

        // The newest three events are still replayable.
        let tail = ResumeToken::new("9");
        let mut stream = store.watch(Some(tail)).await.unwrap();
        let keys: Vec<String> = vec![
            stream.recv().await.unwrap().unwrap().key,
            stream.recv().await.unwrap().unwrap().key,
            stream.recv().await.unwrap().unwrap().key,
        ];
        assert_eq!(keys, vec!["k7", "k8", "k9"]);
    }

    #[tokio::test]
    async fn test_secondary_keeps_newer_version() {
        let store = MemorySecondaryStore::new();
        let mut newer = rec("a", 5);
        newer.created_at = Utc.timestamp_opt(2_000, 0).unwrap();
        let mut older = rec("a", 1);
        older.created_at = Utc.timestamp_opt(1_000, 0).unwrap();

        store.batch_write(&[newer]).await.unwrap();
        let result = store.batch_write(&[older]).await.unwrap();
        assert_eq!(result.inserted_count, 1);
        assert_eq!(store.get("a").unwrap().key_count, 5);

        let mut latest = rec("a", 9);
        latest.created_at = Utc.timestamp_opt(3_000, 0).unwrap();
        store.batch_write(&[latest]).await.unwrap();
        assert_eq!(store.get("a").unwrap().key_count, 9);
    }

    #[tokio::test]
    async fn test_primary_outage_ends_subscriptions() {
        let store = MemoryPrimaryStore::new();
        store.connect().await.unwrap();
        let mut stream = store.watch(None).await.unwrap();

        store.set_available(false);
        assert!(!store.is_connected());
        assert!(stream.recv().await.unwrap().is_err());
        assert!(stream.recv().await.is_none());
        assert!(store.batch_write(&[rec("a", 1)]).await.is_err());
        assert!(store.ping().await.is_err());

        store.set_available(true);
        assert!(store.ping().await.is_ok());
        assert!(store.is_connected());
    }

    #[tokio::test]
    async fn test_primary_delete_event() {
        let store = MemoryPrimaryStore::new();
        store.write_external(rec("a", 1));
        let mut stream = store.watch(None).await.unwrap();
        assert!(store.delete("a"));
        assert!(!store.delete("a"));
        let event = stream.recv().await.unwrap().unwrap();
        assert_eq!(event.op, ChangeOp::Delete);
        assert!(event.full_document.is_none());
    }

    #[tokio::test]
    async fn test_secondary_partial_failure() {
        let store = MemorySecondaryStore::new();
        store.fail_keys(["b"]);
        let result = store.batch_write(&[rec("a", 1), rec("b", 1), rec("c", 1)]).await.unwrap();
        assert_eq!(result.inserted_count, 2);
        assert_eq!(result.failed_keys(), vec!["b"]);
        assert!(store.contains("a") && store.contains("c"));

        store.set_available(false);
        assert!(store.batch_write(&[rec("d", 1)]).await.is_err());
        assert!(!store.test_connection().await);
        assert_eq!(store.write_calls(), 2);
    }

    #[tokio::test]
    async fn test_secondary_query_since_is_exclusive_and_limited() {
        let store = MemorySecondaryStore::new();
        let base = Utc.timestamp_opt(1_000, 0).unwrap();
        let mut rows = Vec::new();
        for i in 0..5 {
            let mut r = rec(&format!("k{}", i), 1);
            r.timestamp = base + chrono::Duration::seconds(i);
            rows.push(r);
        }
        store.batch_write(&rows).await.unwrap();

        let found = store.query_since(base, 3).await.unwrap();
        let keys: Vec<_> = found.iter().map(|r| r.idempotency_key.as_str()).collect();
        assert_eq!(keys, vec!["k1", "k2", "k3"]);
    }
}
