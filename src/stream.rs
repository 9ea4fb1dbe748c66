// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Stream codec and reader for the primary store's change log.
//!
//! Every primary write that changes a record appends one entry to the
//! `{prefix}changes` stream:
//!
//! | Field | Content |
//! |-------|---------|
//! | `op`  | `insert`, `update`, `replace` or `delete` |
//! | `key` | idempotency key |
//! | `doc` | record JSON, zstd-compressed above [`COMPRESSION_THRESHOLD`] (absent for deletes) |
//! | `hash`| hex SHA-256 of the uncompressed `doc` bytes |
//!
//! The entry ID doubles as the resume token.
//!
//! # Stream Trimming
//!
//! The stream is capped with `MAXLEN ~`. A token older than the oldest
//! retained entry means events were lost; [`ChangeStreamReader::start_position`]
//! reports that as [`SyncError::ResumeTokenInvalid`] so the bridge can fall
//! back to an ETL catch-up instead of silently skipping the gap.

use crate::error::{Result, SyncError};
use crate::record::Record;
use crate::store::{ChangeEvent, ChangeOp, ResumeToken};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;
use tracing::{trace, warn};

/// zstd frame magic.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Documents at least this large are compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

const ZSTD_LEVEL: i32 = 3;

/// Stream position used when the stream has never been written.
pub const STREAM_ORIGIN: &str = "0-0";

/// Entries returned by one read.
#[derive(Debug, Default)]
pub struct StreamBatch {
    pub events: Vec<ChangeEvent>,
    /// ID of the last entry read, parsed or not. The next read starts here.
    pub last_id: Option<String>,
    /// Entries that could not be parsed.
    pub skipped: usize,
}

/// Reads the change stream with `XREAD`.
#[derive(Debug, Clone)]
pub struct ChangeStreamReader {
    stream_key: String,
    block_timeout: Duration,
    count: usize,
}

impl ChangeStreamReader {
    pub fn new(stream_key: impl Into<String>, block_timeout: Duration, count: usize) -> Self {
        Self {
            stream_key: stream_key.into(),
            block_timeout,
            count: count.max(1),
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Oldest retained entry ID, `None` for an empty or missing stream.
    pub async fn get_oldest_id(&self, conn: &mut ConnectionManager) -> Result<Option<String>> {
        let result: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| SyncError::redis("XRANGE", e))?;

        Ok(result.into_iter().next().map(|(id, _)| id))
    }

    /// Newest entry ID, `None` for an empty or missing stream.
    pub async fn get_latest_id(&self, conn: &mut ConnectionManager) -> Result<Option<String>> {
        let result: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XREVRANGE")
            .arg(&self.stream_key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| SyncError::redis("XREVRANGE", e))?;

        Ok(result.into_iter().next().map(|(id, _)| id))
    }

    /// `Some(oldest_id)` when `token` points before the oldest retained
    /// entry. An empty stream accepts any token.
    pub async fn check_token_valid(
        &self,
        conn: &mut ConnectionManager,
        token: &str,
    ) -> Result<Option<String>> {
        match self.get_oldest_id(conn).await? {
            None => Ok(None),
            Some(oldest) if is_trimmed_past(token, &oldest) => Ok(Some(oldest)),
            Some(_) => Ok(None),
        }
    }

    /// Where a subscription starts reading.
    ///
    /// `None` starts at the current head (only events after the call are
    /// delivered). A token starts right after it, or fails with
    /// [`SyncError::ResumeTokenInvalid`] if the stream was trimmed past it.
    pub async fn start_position(
        &self,
        conn: &mut ConnectionManager,
        resume_after: Option<&ResumeToken>,
    ) -> Result<String> {
        match resume_after {
            None => Ok(self
                .get_latest_id(conn)
                .await?
                .unwrap_or_else(|| STREAM_ORIGIN.to_string())),
            Some(token) => {
                if parse_stream_id(token.as_str()).is_none() {
                    return Err(SyncError::ResumeTokenInvalid {
                        token: token.to_string(),
                    });
                }
                if let Some(oldest) = self.check_token_valid(conn, token.as_str()).await? {
                    warn!(
                        stream = %self.stream_key,
                        token = %token,
                        oldest_id = %oldest,
                        "Change stream trimmed past resume token"
                    );
                    return Err(SyncError::ResumeTokenInvalid {
                        token: token.to_string(),
                    });
                }
                Ok(token.to_string())
            }
        }
    }

    /// Blocking read of entries strictly after `cursor`.
    ///
    /// An empty batch means the block timeout elapsed with nothing new.
    pub async fn read_after(&self, conn: &mut ConnectionManager, cursor: &str) -> Result<StreamBatch> {
        let opts = StreamReadOptions::default()
            .block(self.block_timeout.as_millis() as usize)
            .count(self.count);

        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream_key], &[cursor], &opts)
            .await
            .map_err(|e| SyncError::redis("XREAD", e))?;

        let mut batch = StreamBatch::default();
        for stream in reply.keys {
            for entry in stream.ids {
                match parse_entry(&entry.id, &entry.map) {
                    Ok(event) => {
                        trace!(id = %entry.id, op = event.op.as_str(), key = %event.key, "Change entry");
                        batch.events.push(event);
                    }
                    Err(e) => {
                        warn!(id = %entry.id, error = %e, "Unparsable change entry, skipping");
                        batch.skipped += 1;
                    }
                }
                batch.last_id = Some(entry.id);
            }
        }
        Ok(batch)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entry codec
// ═══════════════════════════════════════════════════════════════════════════════

/// Build the `XADD` field list for a change.
pub fn encode_entry(op: ChangeOp, key: &str, doc: Option<&Record>) -> Result<Vec<(&'static str, Vec<u8>)>> {
    let mut fields = vec![("op", op.as_str().as_bytes().to_vec()), ("key", key.as_bytes().to_vec())];
    if let Some(record) = doc {
        let json = serde_json::to_vec(record)?;
        fields.push(("hash", compute_content_hash(&json).into_bytes()));
        fields.push(("doc", encode_payload(&json)?));
    }
    Ok(fields)
}

/// Parse one stream entry into a [`ChangeEvent`].
///
/// Validates the `hash` field against the decompressed document when
/// present.
pub fn parse_entry(stream_id: &str, fields: &HashMap<String, redis::Value>) -> Result<ChangeEvent> {
    let op_name = get_string_field(fields, "op")?;
    let op = ChangeOp::parse(&op_name)
        .ok_or_else(|| SyncError::StreamParse(format!("Unknown op: {}", op_name)))?;
    let key = get_string_field(fields, "key")?;
    let resume_token = ResumeToken::new(stream_id);

    if !op.carries_document() || !fields.contains_key("doc") {
        return Ok(ChangeEvent {
            op,
            key,
            full_document: None,
            resume_token,
        });
    }

    let doc = maybe_decompress(&get_bytes_field(fields, "doc")?)?;
    if let Ok(expected) = get_string_field(fields, "hash") {
        let actual = compute_content_hash(&doc);
        if actual != expected {
            return Err(SyncError::StreamParse(format!(
                "Hash mismatch for '{}': expected {}, got {}",
                key, expected, actual
            )));
        }
    }

    let record = Record::from_slice(&doc)?;
    if record.idempotency_key != key {
        return Err(SyncError::StreamParse(format!(
            "Entry key '{}' does not match document key '{}'",
            key, record.idempotency_key
        )));
    }

    Ok(ChangeEvent {
        op,
        key,
        full_document: Some(record),
        resume_token,
    })
}

fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String> {
    match fields.get(name) {
        Some(redis::Value::BulkString(bytes)) => String::from_utf8(bytes.clone())
            .map_err(|e| SyncError::StreamParse(format!("Invalid UTF-8 in {}: {}", name, e))),
        Some(redis::Value::SimpleString(s)) => Ok(s.clone()),
        Some(other) => Err(SyncError::StreamParse(format!("Unexpected type for {}: {:?}", name, other))),
        None => Err(SyncError::StreamParse(format!("Missing field: {}", name))),
    }
}

fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Vec<u8>> {
    match fields.get(name) {
        Some(redis::Value::BulkString(bytes)) => Ok(bytes.clone()),
        Some(redis::Value::SimpleString(s)) => Ok(s.as_bytes().to_vec()),
        Some(other) => Err(SyncError::StreamParse(format!("Unexpected type for {}: {:?}", name, other))),
        None => Err(SyncError::StreamParse(format!("Missing field: {}", name))),
    }
}

/// Compress `data` when it reaches [`COMPRESSION_THRESHOLD`].
pub fn encode_payload(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < COMPRESSION_THRESHOLD {
        return Ok(data.to_vec());
    }
    zstd::encode_all(data, ZSTD_LEVEL).map_err(|e| SyncError::Decompression(format!("zstd encode: {}", e)))
}

/// Decompress zstd frames, pass anything else through.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if !data.starts_with(&ZSTD_MAGIC) {
        return Ok(data.to_vec());
    }
    let mut decoder =
        zstd::Decoder::new(data).map_err(|e| SyncError::Decompression(format!("zstd init: {}", e)))?;
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| SyncError::Decompression(format!("zstd decode: {}", e)))?;
    Ok(out)
}

/// Hex SHA-256.
pub fn compute_content_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stream IDs
// ═══════════════════════════════════════════════════════════════════════════════

/// Split `"{millis}-{seq}"`. A bare number is read as `"{n}-0"`.
pub fn parse_stream_id(id: &str) -> Option<(u64, u64)> {
    match id.split_once('-') {
        Some((ms, seq)) => Some((ms.parse().ok()?, seq.parse().ok()?)),
        None => Some((id.parse().ok()?, 0)),
    }
}

/// Numeric ordering of stream IDs. Malformed IDs sort first.
pub fn compare_stream_ids(a: &str, b: &str) -> Ordering {
    let a = parse_stream_id(a).unwrap_or((0, 0));
    let b = parse_stream_id(b).unwrap_or((0, 0));
    a.cmp(&b)
}

/// True when `token` is older than the oldest retained entry.
///
/// Conservative: an ID gap between `token` and `oldest` is treated as loss
/// unless `oldest` directly follows `token` in the same millisecond.
fn is_trimmed_past(token: &str, oldest: &str) -> bool {
    let Some(token) = parse_stream_id(token) else {
        return true;
    };
    let Some(oldest) = parse_stream_id(oldest) else {
        return false;
    };
    let follows_directly = token.0 == oldest.0 && token.1.checked_add(1) == Some(oldest.1);
    token < oldest && !follows_directly
}

/// Millisecond part of a stream ID. `None` for malformed IDs or bare `"0"`.
pub fn parse_stream_id_timestamp(stream_id: &str) -> Option<u64> {
    let (ms, _) = stream_id.split_once('-')?;
    ms.parse().ok()
}

/// How far `cursor` trails `latest`, in milliseconds.
pub fn calculate_lag_ms(cursor: &str, latest: &str) -> Option<u64> {
    Some(parse_stream_id_timestamp(latest)?.saturating_sub(parse_stream_id_timestamp(cursor)?))
}
