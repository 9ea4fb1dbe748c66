// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync engine.
//!
//! Errors are categorized by where they originate (primary store, secondary
//! store, local checkpoint journal, inbound validation) and carry enough
//! context to end up as a readable entry in the status ledger.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `PrimaryStore` | Yes | Primary store unreachable or rejected a command |
//! | `SecondaryStore` | Yes | Analytical store unreachable or rejected a batch |
//! | `Redis` | Yes | Network errors talking to the Redis-backed primary |
//! | `ChangeStream` | Yes | Change subscription dropped or ended |
//! | `Timeout` | Yes | Bounded store call exceeded its deadline |
//! | `ResumeTokenInvalid` | No | Store compacted past our cursor (needs ETL catch-up) |
//! | `Sqlite` | No | Local SQLite errors (needs operator attention) |
//! | `Checkpoint` | No | Checkpoint journal could not be written |
//! | `Config` | No | Configuration invalid |
//! | `Validation` | No | Malformed record submitted by the caller |
//! | `Decompression` | No | Data corruption (zstd decode failed) |
//! | `StreamParse` | No | Malformed change-stream entry |
//! | `Serialization` | No | Record JSON could not be encoded/decoded |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is stopping or stopped; stores are closed |
//!
//! # Retry Behavior
//!
//! Use [`SyncError::is_retryable()`] to decide whether the next scheduled
//! cycle should simply try again. None of these errors crash the pipeline;
//! component boundaries turn them into `sync_errors` entries.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for sync engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while capturing, buffering or replicating records.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Primary operational store failure.
    ///
    /// Connect, upsert, query or watch failed. Retried on the next cycle
    /// or by the health supervisor.
    #[error("Primary store error ({operation}): {message}")]
    PrimaryStore { operation: String, message: String },

    /// Secondary analytical store failure.
    ///
    /// The whole `batch_write` call failed (row-level failures are reported
    /// in [`InsertManyResult`](crate::store::InsertManyResult) instead).
    #[error("Secondary store error ({operation}): {message}")]
    SecondaryStore { operation: String, message: String },

    /// Redis connection or command error.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQLite error in the checkpoint journal or the analytical store.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// Checkpoint journal could not persist state.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed record rejected at `submit`. Never enqueued.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The primary store no longer knows the resume position.
    ///
    /// Happens when the change history was compacted past our token.
    /// The change-capture bridge reacts by scheduling a full ETL catch-up.
    #[error("Resume token no longer valid: {token}")]
    ResumeTokenInvalid { token: String },

    /// Change subscription failed or ended unexpectedly.
    #[error("Change stream error: {0}")]
    ChangeStream(String),

    /// Zstd decompression failure.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Change-stream entry has an unexpected shape.
    #[error("Stream parse error: {0}")]
    StreamParse(String),

    /// Record JSON encode/decode failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A store call did not complete within its deadline.
    #[error("Timed out after {after:?} ({operation})")]
    Timeout { operation: String, after: Duration },

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl SyncError {
    /// Create a primary-store error.
    pub fn primary(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::PrimaryStore {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create a secondary-store error.
    pub fn secondary(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::SecondaryStore {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PrimaryStore { .. } => true,
            Self::SecondaryStore { .. } => true,
            Self::Redis { .. } => true,
            Self::ChangeStream(_) => true,
            Self::Timeout { .. } => true,
            Self::ResumeTokenInvalid { .. } => false, // needs a full catch-up, not a retry
            Self::Sqlite(_) => false,
            Self::Checkpoint(_) => false,
            Self::Config(_) => false,
            Self::Validation(_) => false,
            Self::Decompression(_) => false,
            Self::StreamParse(_) => false,
            Self::Serialization(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
        }
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}
