// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store capabilities.
//!
//! The engine talks to its two stores only through these traits, which
//! keeps the pipeline testable with in-process stores and decouples it from
//! driver details.
//!
//! - [`PrimaryStore`]: the operational store. Upserts by idempotency key,
//!   answers range queries and publishes a resumable change stream.
//! - [`SecondaryStore`]: the long-term analytical store. Unordered
//!   insert-many that reports per-row failures, plus a range query used by
//!   the ETL catch-up.
//!
//! Implementations shipped with the crate:
//!
//! | Module | Store |
//! |--------|-------|
//! | [`memory`] | In-process primary (with change log) and secondary |
//! | [`redis`] | Redis hashes + a Redis Stream as change log |
//! | [`sqlite`] | SQLite table via `sqlx` |
//!
//! # Example
//!
//! ```rust,no_run
//! use typing_sync_engine::store::{BoxFuture, InsertManyResult, SecondaryStore};
//! use typing_sync_engine::Record;
//! use chrono::{DateTime, Utc};
//!
//! struct NullSink;
//!
//! impl SecondaryStore for NullSink {
//!     fn connect(&self) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn test_connection(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + '_>> {
//!         Box::pin(async { true })
//!     }
//!
//!     fn batch_write<'a>(&'a self, records: &'a [Record]) -> BoxFuture<'a, InsertManyResult> {
//!         Box::pin(async move { Ok(InsertManyResult::all_inserted(records.len())) })
//!     }
//!
//!     fn query_since(&self, _since: DateTime<Utc>, _limit: usize) -> BoxFuture<'_, Vec<Record>> {
//!         Box::pin(async { Ok(Vec::new()) })
//!     }
//! }
//! ```

pub mod memory;
pub mod redis;
pub mod sqlite;

use crate::error::Result;
use crate::record::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Channel capacity between a store's watch task and the bridge.
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

// ═══════════════════════════════════════════════════════════════════════════════
// Change stream types
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of change reported by the primary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Replace,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Replace => "replace",
            ChangeOp::Delete => "delete",
        }
    }

    /// Parse a wire name, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Some(ChangeOp::Insert),
            "update" => Some(ChangeOp::Update),
            "replace" => Some(ChangeOp::Replace),
            "delete" | "del" => Some(ChangeOp::Delete),
            _ => None,
        }
    }

    /// Operations that carry a document worth mirroring.
    pub fn carries_document(&self) -> bool {
        !matches!(self, ChangeOp::Delete)
    }
}

/// Opaque position in the primary store's change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken(pub String);

impl ResumeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single change-stream event.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub key: String,
    /// Post-image of the document; `None` for deletes.
    pub full_document: Option<Record>,
    /// Position of this event. Resuming after it skips this event.
    pub resume_token: ResumeToken,
}

/// Receiving end of a change subscription. A stream error arrives as an
/// `Err` item; a closed channel means the subscription ended.
pub type ChangeStream = mpsc::Receiver<Result<ChangeEvent>>;

// ═══════════════════════════════════════════════════════════════════════════════
// Write results
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of a primary upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    /// Keys that already existed.
    pub matched: usize,
    /// Keys created by this batch.
    pub inserted: usize,
    /// Existing keys whose content changed.
    pub modified: usize,
}

impl UpsertSummary {
    pub fn total(&self) -> usize {
        self.matched + self.inserted
    }
}

/// One row a secondary insert could not write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    pub key: String,
    pub error: String,
}

/// Result of an unordered secondary insert-many.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertManyResult {
    pub inserted_count: usize,
    pub failed: Vec<RowFailure>,
}

impl InsertManyResult {
    pub fn all_inserted(count: usize) -> Self {
        Self {
            inserted_count: count,
            failed: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_keys(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.key.clone()).collect()
    }

    /// First few row errors, for a status-ledger message.
    pub fn describe_failures(&self, max: usize) -> String {
        let mut parts: Vec<String> = self
            .failed
            .iter()
            .take(max)
            .map(|f| format!("{}: {}", f.key, f.error))
            .collect();
        if self.failed.len() > max {
            parts.push(format!("and {} more", self.failed.len() - max));
        }
        parts.join("; ")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queries
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Record filter. Every `Some` field must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    /// Event `timestamp` strictly greater than this.
    pub timestamp_after: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn after(since: DateTime<Utc>) -> Self {
        Self {
            timestamp_after: Some(since),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.timestamp_after
            .map(|since| record.timestamp > since)
            .unwrap_or(true)
    }
}

/// Sort (by event timestamp) and limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    pub sort: SortOrder,
    pub limit: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            sort: SortOrder::Ascending,
            limit: 10_000,
        }
    }
}

/// Sort by event time (key as tie-break), then truncate.
pub(crate) fn sort_and_limit(records: &mut Vec<Record>, options: QueryOptions) {
    records.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.idempotency_key.cmp(&b.idempotency_key))
    });
    if options.sort == SortOrder::Descending {
        records.reverse();
    }
    records.truncate(options.limit);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Capabilities
// ═══════════════════════════════════════════════════════════════════════════════

/// The primary operational store.
pub trait PrimaryStore: Send + Sync + 'static {
    /// Establish the connection. A no-op when already connected.
    fn connect(&self) -> BoxFuture<'_, ()>;

    /// Whether the last known state is "connected".
    fn is_connected(&self) -> bool;

    /// Round-trip latency. On failure the store marks itself disconnected.
    fn ping(&self) -> BoxFuture<'_, Duration>;

    /// Upsert keyed by `idempotency_key`. Writing identical content is a
    /// no-op counted as `matched` and publishes no change event.
    fn batch_write<'a>(&'a self, records: &'a [Record]) -> BoxFuture<'a, UpsertSummary>;

    /// Point/range query for status and ETL.
    fn query(&self, filter: RecordFilter, options: QueryOptions) -> BoxFuture<'_, Vec<Record>>;

    /// Open a change subscription starting strictly after `resume_after`,
    /// or at the current head for `None`. An expired token is reported as
    /// [`SyncError::ResumeTokenInvalid`](crate::SyncError::ResumeTokenInvalid).
    fn watch(&self, resume_after: Option<ResumeToken>) -> BoxFuture<'_, ChangeStream>;
}

/// The secondary analytical store.
pub trait SecondaryStore: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, ()>;

    /// Liveness probe. Never errors.
    fn test_connection(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Unordered insert-many: every row is attempted and failures are
    /// reported per row. Re-delivering a key updates its single row.
    fn batch_write<'a>(&'a self, records: &'a [Record]) -> BoxFuture<'a, InsertManyResult>;

    /// Rows with event `timestamp` strictly after `since`, ascending.
    fn query_since(&self, since: DateTime<Utc>, limit: usize) -> BoxFuture<'_, Vec<Record>>;
}
