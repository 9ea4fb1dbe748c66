// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local checkpoint journal.
//!
//! Persists the two pieces of state that would otherwise die with the
//! process: the pending record queue and the change-stream resume token.
//! Both live in a small SQLite database next to the daemon.
//!
//! # Debounced Token Writes
//!
//! Resume tokens advance on every change event, so writes are debounced:
//! - `set_token()` updates the in-memory cache immediately and marks the
//!   stream dirty
//! - `flush_dirty()` persists all dirty tokens in a batch
//! - the engine calls `flush_dirty()` every `checkpoint.flush_interval`
//!   and once more on shutdown
//!
//! A crash between `set_token()` and `flush_dirty()` loses at most one flush
//! interval of progress. On restart the bridge re-reads a few events it
//! already applied, which the queue and the key-based upserts absorb.
//!
//! # Pending Journal
//!
//! `save_pending()` replaces the whole journal in one transaction, so the
//! file always holds a complete queue snapshot from some point in time:
//!
//! ```text
//! pending_records
//! ┌──────────────────┬──────────┬──────────────┬───────────┬──────────┐
//! │ idempotency_key  │ position │ payload JSON │ queued_at │ attempts │
//! └──────────────────┴──────────┴──────────────┴───────────┴──────────┘
//! ```

use crate::db::{execute_with_retry, open_pool};
use crate::error::{Result, SyncError};
use crate::queue::QueueItem;
use crate::record::Record;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// Token slot used for the primary store's change stream.
pub const PRIMARY_STREAM: &str = "primary";

/// Persistent resume tokens and pending-record journal backed by SQLite.
pub struct CheckpointStore {
    pool: SqlitePool,
    /// Tokens by stream name. A missing entry means "start from the head".
    tokens: Arc<RwLock<HashMap<String, String>>>,
    /// Streams whose token changed since the last flush.
    dirty: Arc<RwLock<HashSet<String>>>,
    path: String,
}

impl CheckpointStore {
    /// Open (or create) the journal at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing checkpoint store");

        let pool = open_pool(&path_str, true, 2).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resume_tokens (
                stream TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_records (
                idempotency_key TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                payload TEXT NOT NULL,
                queued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT stream, token FROM resume_tokens")
                .fetch_all(&pool)
                .await?;

        let mut tokens = HashMap::new();
        for (stream, token) in rows {
            debug!(stream = %stream, token = %token, "Loaded resume token from disk");
            tokens.insert(stream, token);
        }

        if !tokens.is_empty() {
            info!(count = tokens.len(), "Restored resume tokens from previous run");
        }

        Ok(Self {
            pool,
            tokens: Arc::new(RwLock::new(tokens)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path: path_str,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Resume tokens
    // ═══════════════════════════════════════════════════════════════════════

    /// Last known token for `stream`, if any.
    pub async fn get_token(&self, stream: &str) -> Option<String> {
        self.tokens.read().await.get(stream).cloned()
    }

    /// Update the token (debounced until the next `flush_dirty`).
    pub async fn set_token(&self, stream: &str, token: &str) {
        self.tokens
            .write()
            .await
            .insert(stream.to_string(), token.to_string());
        self.dirty.write().await.insert(stream.to_string());
    }

    /// Forget the token, e.g. after the store reported it invalid.
    pub async fn clear_token(&self, stream: &str) {
        self.tokens.write().await.remove(stream);
        self.dirty.write().await.insert(stream.to_string());
    }

    /// Persist dirty tokens. Returns how many were written.
    #[instrument(skip(self))]
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty_streams: Vec<String> = self.dirty.write().await.drain().collect();
        if dirty_streams.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().timestamp_millis();
        let tokens = self.tokens.read().await;
        let pool = &self.pool;

        let mut flushed = 0;
        let mut errors = 0;

        for stream in &dirty_streams {
            let stream_owned = stream.clone();
            let result = match tokens.get(stream) {
                Some(token) => {
                    let token_owned = token.clone();
                    execute_with_retry("token_flush", || async {
                        sqlx::query(
                            r#"
                            INSERT INTO resume_tokens (stream, token, updated_at)
                            VALUES (?, ?, ?)
                            ON CONFLICT(stream) DO UPDATE SET
                                token = excluded.token,
                                updated_at = excluded.updated_at
                            "#,
                        )
                        .bind(&stream_owned)
                        .bind(&token_owned)
                        .bind(now)
                        .execute(pool)
                        .await
                    })
                    .await
                }
                None => {
                    execute_with_retry("token_clear", || async {
                        sqlx::query("DELETE FROM resume_tokens WHERE stream = ?")
                            .bind(&stream_owned)
                            .execute(pool)
                            .await
                    })
                    .await
                }
            };

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(stream = %stream, error = %e, "Failed to flush resume token");
                    self.dirty.write().await.insert(stream.clone());
                }
            }
        }

        crate::metrics::record_checkpoint_flush(flushed, errors);

        if errors > 0 {
            return Err(SyncError::Checkpoint(format!(
                "Failed to flush {} resume tokens",
                errors
            )));
        }

        debug!(flushed, "Flushed resume tokens");
        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pending journal
    // ═══════════════════════════════════════════════════════════════════════

    /// Replace the journal with `items`, in queue order.
    #[instrument(skip_all, fields(count = items.len()))]
    pub async fn save_pending(&self, items: &[QueueItem]) -> Result<usize> {
        let mut rows = Vec::with_capacity(items.len());
        for (position, item) in items.iter().enumerate() {
            rows.push((
                item.key().to_string(),
                position as i64,
                item.record.to_json()?,
                item.queued_at.timestamp_millis(),
                i64::from(item.attempts),
            ));
        }

        let pool = &self.pool;
        let rows_ref = &rows;
        execute_with_retry("pending_save", || async move {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM pending_records")
                .execute(&mut *tx)
                .await?;
            for (key, position, payload, queued_at, attempts) in rows_ref {
                sqlx::query(
                    r#"
                    INSERT INTO pending_records
                        (idempotency_key, position, payload, queued_at, attempts)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(key)
                .bind(position)
                .bind(payload)
                .bind(queued_at)
                .bind(attempts)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await?;

        crate::metrics::set_checkpoint_pending(rows.len());
        debug!(count = rows.len(), "Saved pending journal");
        Ok(rows.len())
    }

    /// Load the journal in queue order. Rows that no longer parse are skipped.
    pub async fn load_pending(&self) -> Result<Vec<QueueItem>> {
        let pool = &self.pool;
        let rows: Vec<(String, String, i64, i64)> = execute_with_retry("pending_load", || async {
            sqlx::query_as(
                r#"
                SELECT idempotency_key, payload, queued_at, attempts
                FROM pending_records
                ORDER BY position ASC
                "#,
            )
            .fetch_all(pool)
            .await
        })
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for (key, payload, queued_at, attempts) in rows {
            let record = match Record::from_json(&payload) {
                Ok(r) => r,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable pending record");
                    continue;
                }
            };
            let mut item = QueueItem::new(record, millis_to_utc(queued_at));
            item.attempts = u32::try_from(attempts).unwrap_or(0);
            items.push(item);
        }

        if !items.is_empty() {
            info!(count = items.len(), "Loaded pending records from journal");
        }
        Ok(items)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Maintenance
    // ═══════════════════════════════════════════════════════════════════════

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Flush dirty tokens, checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) if count > 0 => info!(count, "Flushed resume tokens on close"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush resume tokens on close"),
            }
        }

        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}
