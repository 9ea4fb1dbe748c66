// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed primary store.
//!
//! # Key Layout
//!
//! | Key | Type | Content |
//! |-----|------|---------|
//! | `{prefix}record:{key}` | hash | `doc` (JSON), `hash` (content hash), `ts` (event millis) |
//! | `{prefix}records:by_ts` | sorted set | idempotency keys scored by event millis |
//! | `{prefix}records:by_write` | sorted set | idempotency keys scored by write millis |
//! | `{prefix}changes` | stream | change log, see [`crate::stream`] |
//!
//! Record hashes expire `retention_days` after their last write, which stands
//! in for a TTL index on the creation time. Index entries follow the same
//! write-time clock: `batch_write` drops keys whose last write is older than
//! the retention window from both sorted sets, and `query` drops entries
//! whose hash has already expired.
//!
//! # Writes
//!
//! `batch_write` first fetches the stored content hashes in one pipeline.
//! Unchanged records are counted as matched and skipped; everything else is
//! written in a single `MULTI` pipeline together with its change entry, so
//! a document and its event are never observed apart.

use super::{
    sort_and_limit, BoxFuture, ChangeOp, ChangeStream, PrimaryStore, QueryOptions, RecordFilter,
    ResumeToken, SortOrder, UpsertSummary, CHANGE_CHANNEL_CAPACITY,
};
use crate::config::PrimaryStoreConfig;
use crate::error::{Result, SyncError};
use crate::record::Record;
use crate::resilience::{retry_with_backoff, RetryConfig};
use crate::stream::{encode_entry, ChangeStreamReader};
use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn, Instrument};

/// Most expired keys dropped from the indexes per write.
const PRUNE_BATCH: usize = 500;

/// Primary store on Redis.
pub struct RedisPrimaryStore {
    config: PrimaryStoreConfig,
    retry: RetryConfig,
    client: RwLock<Option<Client>>,
    conn: RwLock<Option<ConnectionManager>>,
    connected: AtomicBool,
    reader: ChangeStreamReader,
}

impl RedisPrimaryStore {
    pub fn new(config: PrimaryStoreConfig) -> Self {
        Self::with_retry(config, RetryConfig::startup())
    }

    pub fn with_retry(config: PrimaryStoreConfig, retry: RetryConfig) -> Self {
        let reader = ChangeStreamReader::new(
            config.change_stream_key(),
            config.block_timeout_duration(),
            config.read_count,
        );
        Self {
            config,
            retry,
            client: RwLock::new(None),
            conn: RwLock::new(None),
            connected: AtomicBool::new(false),
            reader,
        }
    }

    pub fn config(&self) -> &PrimaryStoreConfig {
        &self.config
    }

    async fn connection(&self, operation: &str) -> Result<ConnectionManager> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| SyncError::primary(operation, "not connected"))
    }

    /// Open a dedicated connection. Blocking `XREAD` must not share the
    /// multiplexed connection used for writes.
    async fn dedicated_connection(&self) -> Result<ConnectionManager> {
        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or_else(|| SyncError::primary("watch", "not connected"))?;
        retry_with_backoff("primary.watch_connect", &RetryConfig::single(self.retry.connection_timeout), || {
            let client = client.clone();
            async move {
                client
                    .get_connection_manager()
                    .await
                    .map_err(|e| SyncError::redis("connect", e))
            }
        })
        .await
    }

    fn mark_failed(&self, error: &SyncError) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(error = %error, "Primary store marked disconnected");
        }
    }

    fn retention_secs(&self) -> i64 {
        i64::try_from(self.config.retention().as_secs()).unwrap_or(i64::MAX)
    }

    async fn write_batch(&self, records: &[Record]) -> Result<UpsertSummary> {
        let mut conn = self.connection("batch_write").await?;

        let mut lookup = redis::pipe();
        for record in records {
            lookup.hget(self.config.record_key(&record.idempotency_key), "hash");
        }
        let stored: Vec<Option<String>> = lookup
            .query_async(&mut conn)
            .await
            .map_err(|e| SyncError::redis("HGET", e))?;

        let written_at = chrono::Utc::now().timestamp_millis();
        let cutoff = written_at - self.retention_secs().saturating_mul(1000);
        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.config.write_index_key())
            .arg("-inf")
            .arg(format!("({}", cutoff))
            .arg("LIMIT")
            .arg(0)
            .arg(PRUNE_BATCH)
            .query_async(&mut conn)
            .await
            .map_err(|e| SyncError::redis("ZRANGEBYSCORE", e))?;

        let mut summary = UpsertSummary::default();
        let mut writes = redis::pipe();
        writes.atomic();
        let index_key = self.config.timestamp_index_key();
        let write_index_key = self.config.write_index_key();
        let stream_key = self.config.change_stream_key();
        let mut pending = 0usize;

        for (record, existing) in records.iter().zip(stored) {
            let hash = record.content_hash();
            let op = match existing {
                Some(existing) if existing == hash => {
                    summary.matched += 1;
                    continue;
                }
                Some(_) => {
                    summary.matched += 1;
                    summary.modified += 1;
                    ChangeOp::Update
                }
                None => {
                    summary.inserted += 1;
                    ChangeOp::Insert
                }
            };

            let record_key = self.config.record_key(&record.idempotency_key);
            let ts = record.timestamp.timestamp_millis();
            writes
                .cmd("HSET")
                .arg(&record_key)
                .arg("doc")
                .arg(record.to_json()?)
                .arg("hash")
                .arg(&hash)
                .arg("ts")
                .arg(ts)
                .ignore();
            writes.cmd("EXPIRE").arg(&record_key).arg(self.retention_secs()).ignore();
            writes.cmd("ZADD").arg(&index_key).arg(ts).arg(&record.idempotency_key).ignore();
            writes
                .cmd("ZADD")
                .arg(&write_index_key)
                .arg(written_at)
                .arg(&record.idempotency_key)
                .ignore();

            let xadd = writes
                .cmd("XADD")
                .arg(&stream_key)
                .arg("MAXLEN")
                .arg("~")
                .arg(self.config.stream_max_len)
                .arg("*");
            for (field, value) in encode_entry(op, &record.idempotency_key, Some(record))? {
                xadd.arg(field).arg(value);
            }
            xadd.ignore();
            pending += 1;
        }

        if pending > 0 {
            let rewritten: std::collections::HashSet<&str> =
                records.iter().map(|r| r.idempotency_key.as_str()).collect();
            let expired: Vec<&String> = expired.iter().filter(|k| !rewritten.contains(k.as_str())).collect();
            if !expired.is_empty() {
                writes.cmd("ZREM").arg(&index_key).arg(&expired).ignore();
                writes.cmd("ZREM").arg(&write_index_key).arg(&expired).ignore();
                debug!(pruned = expired.len(), "Pruning expired records from indexes");
            }
            let _: () = writes
                .query_async(&mut conn)
                .await
                .map_err(|e| SyncError::redis("MULTI", e))?;
        }

        debug!(
            inserted = summary.inserted,
            modified = summary.modified,
            unchanged = summary.matched - summary.modified,
            "Primary batch written"
        );
        Ok(summary)
    }

    async fn query_records(&self, filter: RecordFilter, options: QueryOptions) -> Result<Vec<Record>> {
        let mut conn = self.connection("query").await?;
        let lower = filter
            .timestamp_after
            .map(|t| format!("({}", t.timestamp_millis()))
            .unwrap_or_else(|| "-inf".to_string());

        let index_key = self.config.timestamp_index_key();
        let limit = options.limit.max(1);
        let mut records = Vec::with_capacity(limit.min(1024));
        let mut expired = Vec::new();
        let mut offset = 0usize;

        // Expired hashes leave index entries behind; keep paging past them
        // so a full result is still `limit` records long.
        loop {
            let mut cmd = match options.sort {
                SortOrder::Ascending => {
                    let mut c = redis::cmd("ZRANGEBYSCORE");
                    c.arg(&index_key).arg(&lower).arg("+inf");
                    c
                }
                SortOrder::Descending => {
                    let mut c = redis::cmd("ZREVRANGEBYSCORE");
                    c.arg(&index_key).arg("+inf").arg(&lower);
                    c
                }
            };
            cmd.arg("LIMIT").arg(offset).arg(limit);
            let keys: Vec<String> = cmd
                .query_async(&mut conn)
                .await
                .map_err(|e| SyncError::redis("ZRANGEBYSCORE", e))?;
            if keys.is_empty() {
                break;
            }
            offset += keys.len();

            let mut fetch = redis::pipe();
            for key in &keys {
                fetch.hget(self.config.record_key(key), "doc");
            }
            let docs: Vec<Option<String>> = fetch
                .query_async(&mut conn)
                .await
                .map_err(|e| SyncError::redis("HGET", e))?;

            for (key, doc) in keys.iter().zip(docs) {
                let Some(doc) = doc else {
                    expired.push(key.clone());
                    continue;
                };
                match Record::from_json(&doc) {
                    Ok(record) if filter.matches(&record) => records.push(record),
                    Ok(_) => {}
                    Err(e) => warn!(key = %key, error = %e, "Skipping unreadable primary document"),
                }
            }

            if records.len() >= limit || keys.len() < limit {
                break;
            }
        }

        if !expired.is_empty() {
            let mut prune = redis::pipe();
            prune.cmd("ZREM").arg(&index_key).arg(&expired).ignore();
            prune.cmd("ZREM").arg(self.config.write_index_key()).arg(&expired).ignore();
            let pruned: redis::RedisResult<()> = prune.query_async(&mut conn).await;
            match pruned {
                Ok(()) => debug!(pruned = expired.len(), "Pruned expired records from indexes"),
                Err(e) => debug!(error = %e, "Index prune failed, retried on next read"),
            }
        }

        sort_and_limit(&mut records, options);
        Ok(records)
    }

    async fn open_watch(&self, resume_after: Option<ResumeToken>) -> Result<ChangeStream> {
        let mut conn = self.dedicated_connection().await?;
        let start = self.reader.start_position(&mut conn, resume_after.as_ref()).await?;
        let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
        let reader = self.reader.clone();

        debug!(stream = %reader.stream_key(), start = %start, "Opening change subscription");
        tokio::spawn(
            async move {
                let mut cursor = start;
                while !tx.is_closed() {
                    match reader.read_after(&mut conn, &cursor).await {
                        Ok(batch) => {
                            for event in batch.events {
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }
                            if let Some(last) = batch.last_id {
                                cursor = last;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(SyncError::ChangeStream(e.to_string()))).await;
                            return;
                        }
                    }
                }
                debug!("Change subscription closed by receiver");
            }
            .instrument(tracing::debug_span!("redis_watch")),
        );
        Ok(rx)
    }
}

impl PrimaryStore for RedisPrimaryStore {
    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.connected.load(Ordering::SeqCst) && self.conn.read().await.is_some() {
                return Ok(());
            }
            info!(url = %self.config.url, "Connecting to primary store");

            let client = Client::open(self.config.url.as_str())
                .map_err(|e| SyncError::Config(format!("Invalid Redis URL: {}", e)))?;
            let conn = retry_with_backoff("primary.connect", &self.retry, || {
                let client = client.clone();
                async move {
                    client
                        .get_connection_manager()
                        .await
                        .map_err(|e| SyncError::redis("connect", e))
                }
            })
            .await?;

            *self.client.write().await = Some(client);
            *self.conn.write().await = Some(conn);
            self.connected.store(true, Ordering::SeqCst);
            info!("Connected to primary store");
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ping(&self) -> BoxFuture<'_, Duration> {
        Box::pin(async move {
            let mut conn = self.connection("ping").await?;
            let start = Instant::now();
            let reply: std::result::Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
            match reply {
                Ok(pong) if pong == "PONG" => {
                    self.connected.store(true, Ordering::SeqCst);
                    Ok(start.elapsed())
                }
                Ok(other) => {
                    let err = SyncError::redis_msg("PING", format!("Unexpected reply: {}", other));
                    self.mark_failed(&err);
                    Err(err)
                }
                Err(e) => {
                    let err = SyncError::redis("PING", e);
                    self.mark_failed(&err);
                    Err(err)
                }
            }
        })
    }

    fn batch_write<'a>(&'a self, records: &'a [Record]) -> BoxFuture<'a, UpsertSummary> {
        Box::pin(async move {
            if records.is_empty() {
                return Ok(UpsertSummary::default());
            }
            let result = self.write_batch(records).await;
            if let Err(e) = &result {
                if e.is_retryable() {
                    self.mark_failed(e);
                }
            }
            result
        })
    }

    fn query(&self, filter: RecordFilter, options: QueryOptions) -> BoxFuture<'_, Vec<Record>> {
        Box::pin(self.query_records(filter, options))
    }

    fn watch(&self, resume_after: Option<ResumeToken>) -> BoxFuture<'_, ChangeStream> {
        Box::pin(self.open_watch(resume_after))
    }
}
