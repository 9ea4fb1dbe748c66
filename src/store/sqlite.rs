//! SQLite analytical store.
//!
//! One row per idempotency key in `typing_sessions`. Re-delivery updates the
//! row in place (`ON CONFLICT ... DO UPDATE`), which gives the unordered
//! insert-many the idempotency the pipeline relies on. A delivery whose
//! `created_at` is older than the stored row's is accepted but leaves the
//! row alone, so a late catch-up write cannot regress a newer version.
//!
//! Rows are written one statement at a time so a bad row fails alone.
//! Connection-level errors (pool closed, I/O) fail the whole call instead.

use super::{BoxFuture, InsertManyResult, RowFailure, SecondaryStore};
use crate::db::{execute_with_retry, open_pool};
use crate::error::{Result, SyncError};
use crate::record::Record;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const UPSERT_SQL: &str = r#"
    INSERT INTO typing_sessions (
        idempotency_key, content, key_count, typing_time, timestamp, created_at,
        window_title, browser_name, total_chars, total_words, pages, accuracy
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(idempotency_key) DO UPDATE SET
        content = excluded.content,
        key_count = excluded.key_count,
        typing_time = excluded.typing_time,
        timestamp = excluded.timestamp,
        created_at = excluded.created_at,
        window_title = excluded.window_title,
        browser_name = excluded.browser_name,
        total_chars = excluded.total_chars,
        total_words = excluded.total_words,
        pages = excluded.pages,
        accuracy = excluded.accuracy
    WHERE excluded.created_at >= typing_sessions.created_at
"#;

#[derive(FromRow)]
struct SessionRow {
    idempotency_key: String,
    content: String,
    key_count: i64,
    typing_time: f64,
    timestamp: i64,
    created_at: i64,
    window_title: Option<String>,
    browser_name: Option<String>,
    total_chars: Option<i64>,
    total_words: Option<i64>,
    pages: Option<i64>,
    accuracy: Option<f64>,
}

impl SessionRow {
    fn into_record(self) -> Record {
        Record {
            idempotency_key: self.idempotency_key,
            content: self.content,
            key_count: self.key_count.max(0) as u64,
            typing_time: self.typing_time,
            timestamp: from_millis(self.timestamp),
            created_at: from_millis(self.created_at),
            window_title: self.window_title,
            browser_name: self.browser_name,
            total_chars: self.total_chars.map(|v| v.max(0) as u64),
            total_words: self.total_words.map(|v| v.max(0) as u64),
            pages: self.pages.map(|v| v.max(0) as u64),
            accuracy: self.accuracy,
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Secondary store on a SQLite file (or `":memory:"`).
pub struct SqliteSecondaryStore {
    path: String,
    wal_mode: bool,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteSecondaryStore {
    /// Lazy: nothing is opened until [`SecondaryStore::connect`].
    pub fn new(path: impl Into<String>, wal_mode: bool) -> Self {
        Self {
            path: path.into(),
            wal_mode,
            pool: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn pool(&self, operation: &str) -> Result<SqlitePool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| SyncError::secondary(operation, "not connected"))
    }

    /// Number of stored rows.
    pub async fn count(&self) -> Result<i64> {
        let pool = self.pool("count").await?;
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM typing_sessions")
            .fetch_one(&pool)
            .await?;
        Ok(n)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Record>> {
        let pool = self.pool("get").await?;
        let row: Option<SessionRow> =
            sqlx::query_as("SELECT * FROM typing_sessions WHERE idempotency_key = ?")
                .bind(key)
                .fetch_optional(&pool)
                .await?;
        Ok(row.map(SessionRow::into_record))
    }

    /// Close the pool. A later `connect` reopens it.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            info!(path = %self.path, "Secondary store closed");
        }
    }

    async fn write_row(pool: &SqlitePool, record: &Record) -> std::result::Result<(), sqlx::Error> {
        execute_with_retry("secondary_upsert", || async {
            sqlx::query(UPSERT_SQL)
                .bind(&record.idempotency_key)
                .bind(&record.content)
                .bind(to_i64(record.key_count))
                .bind(record.typing_time)
                .bind(record.timestamp.timestamp_millis())
                .bind(record.created_at.timestamp_millis())
                .bind(&record.window_title)
                .bind(&record.browser_name)
                .bind(record.total_chars.map(to_i64))
                .bind(record.total_words.map(to_i64))
                .bind(record.pages.map(to_i64))
                .bind(record.accuracy)
                .execute(pool)
                .await
        })
        .await
        .map(|_| ())
    }
}

impl SecondaryStore for SqliteSecondaryStore {
    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut guard = self.pool.write().await;
            if guard.is_some() {
                return Ok(());
            }

            let pool = open_pool(&self.path, self.wal_mode, 4)
                .await
                .map_err(|e| SyncError::secondary("connect", e))?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS typing_sessions (
                    idempotency_key TEXT PRIMARY KEY,
                    content TEXT NOT NULL DEFAULT '',
                    key_count INTEGER NOT NULL,
                    typing_time REAL NOT NULL,
                    timestamp INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    window_title TEXT,
                    browser_name TEXT,
                    total_chars INTEGER,
                    total_words INTEGER,
                    pages INTEGER,
                    accuracy REAL
                )
                "#,
            )
            .execute(&pool)
            .await?;

            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_typing_sessions_timestamp ON typing_sessions (timestamp)",
            )
            .execute(&pool)
            .await?;

            info!(path = %self.path, "Secondary store connected");
            *guard = Some(pool);
            Ok(())
        })
    }

    fn test_connection(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            let Some(pool) = self.pool.read().await.clone() else {
                return false;
            };
            sqlx::query("SELECT 1").execute(&pool).await.is_ok()
        })
    }

    fn batch_write<'a>(&'a self, records: &'a [Record]) -> BoxFuture<'a, InsertManyResult> {
        Box::pin(async move {
            let pool = self.pool("batch_write").await?;
            let mut result = InsertManyResult::default();

            for record in records {
                match Self::write_row(&pool, record).await {
                    Ok(()) => result.inserted_count += 1,
                    Err(sqlx::Error::Database(db_err)) => {
                        warn!(key = %record.idempotency_key, error = %db_err, "Row rejected");
                        result.failed.push(RowFailure {
                            key: record.idempotency_key.clone(),
                            error: db_err.to_string(),
                        });
                    }
                    Err(e) => return Err(SyncError::secondary("batch_write", e)),
                }
            }

            debug!(
                inserted = result.inserted_count,
                failed = result.failed.len(),
                "Secondary batch written"
            );
            Ok(result)
        })
    }

    fn query_since(&self, since: DateTime<Utc>, limit: usize) -> BoxFuture<'_, Vec<Record>> {
        Box::pin(async move {
            let pool = self.pool("query_since").await?;
            let rows: Vec<SessionRow> = sqlx::query_as(
                "SELECT * FROM typing_sessions WHERE timestamp > ? ORDER BY timestamp ASC, idempotency_key ASC LIMIT ?",
            )
            .bind(since.timestamp_millis())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&pool)
            .await?;
            Ok(rows.into_iter().map(SessionRow::into_record).collect())
        })
    }
}
