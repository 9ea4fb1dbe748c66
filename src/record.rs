//! Typing-session records.
//!
//! [`SubmitRecord`] is the loosely-typed shape handed over by the IPC layer.
//! It is validated once at [`SyncEngine::submit`](crate::SyncEngine::submit)
//! and turned into a [`Record`], which is what the queue, both stores and
//! the checkpoint journal carry around.
//!
//! # Idempotency
//!
//! Every record has an `idempotency_key`. Callers may supply one; otherwise
//! one is generated as `"{unix_millis}-{9 lowercase alphanumerics}"`. Both
//! stores upsert by this key, so re-delivery never creates a second row.
//!
//! # Content Hash
//!
//! [`Record::content_hash()`] is the SHA-256 of the record's JSON with
//! `created_at` left out. Two submissions of the same event at different
//! ingestion times hash the same, which is what lets the queue and the
//! change-capture bridge recognise no-op rewrites.

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use rand::distributions::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Longest accepted caller-supplied idempotency key.
pub const MAX_KEY_LEN: usize = 128;

/// Length of the random suffix in generated keys.
const KEY_SUFFIX_LEN: usize = 9;

const KEY_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A typing-session measurement as stored in both stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub idempotency_key: String,
    #[serde(default)]
    pub content: String,
    pub key_count: u64,
    /// Seconds spent typing.
    pub typing_time: f64,
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Ingestion time.
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chars: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_words: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<u64>,
    /// Percentage, 0 to 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

/// Borrowed view of the hashed fields (everything except `created_at`).
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashView<'a> {
    idempotency_key: &'a str,
    content: &'a str,
    key_count: u64,
    typing_time: f64,
    timestamp: &'a DateTime<Utc>,
    window_title: &'a Option<String>,
    browser_name: &'a Option<String>,
    total_chars: Option<u64>,
    total_words: Option<u64>,
    pages: Option<u64>,
    accuracy: Option<f64>,
}

impl Record {
    /// Hex SHA-256 of the record contents, ignoring ingestion time.
    pub fn content_hash(&self) -> String {
        let view = HashView {
            idempotency_key: &self.idempotency_key,
            content: &self.content,
            key_count: self.key_count,
            typing_time: self.typing_time,
            timestamp: &self.timestamp,
            window_title: &self.window_title,
            browser_name: &self.browser_name,
            total_chars: self.total_chars,
            total_words: self.total_words,
            pages: self.pages,
            accuracy: self.accuracy,
        };
        // Serializing plain fields into a Vec cannot fail.
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Optional descriptive fields attached to a submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitMetadata {
    #[serde(default)]
    pub window_title: Option<String>,
    #[serde(default)]
    pub browser_name: Option<String>,
    #[serde(default)]
    pub total_chars: Option<i64>,
    #[serde(default)]
    pub total_words: Option<i64>,
    #[serde(default)]
    pub pages: Option<i64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

/// Inbound record as produced by the UI collaborator.
///
/// Numbers are signed here so that a bad producer gets a validation error
/// instead of a deserialization panic somewhere downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRecord {
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub content: String,
    pub key_count: i64,
    pub typing_time: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub metadata: SubmitMetadata,
}

impl SubmitRecord {
    pub fn new(key_count: i64, typing_time: f64) -> Self {
        Self {
            key_count,
            typing_time,
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_metadata(mut self, metadata: SubmitMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Reject malformed input before it reaches the queue.
    pub fn validate(&self) -> Result<()> {
        if self.key_count < 0 {
            return Err(SyncError::Validation(format!(
                "keyCount must be >= 0 (got {})",
                self.key_count
            )));
        }
        if !self.typing_time.is_finite() || self.typing_time < 0.0 {
            return Err(SyncError::Validation(format!(
                "typingTime must be a finite number >= 0 (got {})",
                self.typing_time
            )));
        }
        if let Some(key) = &self.idempotency_key {
            if key.trim().is_empty() {
                return Err(SyncError::Validation(
                    "idempotencyKey must not be empty".to_string(),
                ));
            }
            if key.len() > MAX_KEY_LEN {
                return Err(SyncError::Validation(format!(
                    "idempotencyKey longer than {} bytes",
                    MAX_KEY_LEN
                )));
            }
        }

        let meta = &self.metadata;
        if let Some(accuracy) = meta.accuracy {
            if !accuracy.is_finite() || !(0.0..=100.0).contains(&accuracy) {
                return Err(SyncError::Validation(format!(
                    "accuracy must be within 0..=100 (got {})",
                    accuracy
                )));
            }
        }
        for (name, value) in [
            ("totalChars", meta.total_chars),
            ("totalWords", meta.total_words),
            ("pages", meta.pages),
        ] {
            if let Some(v) = value {
                if v < 0 {
                    return Err(SyncError::Validation(format!(
                        "{name} must be >= 0 (got {v})"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate and convert, generating a key and event time when absent.
    pub fn into_record(self, now: DateTime<Utc>) -> Result<Record> {
        self.validate()?;

        let idempotency_key = match self.idempotency_key {
            Some(key) => key,
            None => generate_idempotency_key(now),
        };
        // Negative values were rejected above.
        let unsigned = |v: Option<i64>| v.map(|n| n as u64);

        Ok(Record {
            idempotency_key,
            content: self.content,
            key_count: self.key_count as u64,
            typing_time: self.typing_time,
            timestamp: self.timestamp.unwrap_or(now),
            created_at: now,
            window_title: self.metadata.window_title,
            browser_name: self.metadata.browser_name,
            total_chars: unsigned(self.metadata.total_chars),
            total_words: unsigned(self.metadata.total_words),
            pages: unsigned(self.metadata.pages),
            accuracy: self.metadata.accuracy,
        })
    }
}

/// Generate a key of the form `"{unix_millis}-{random}"`.
pub fn generate_idempotency_key(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let pick = Uniform::from(0..KEY_CHARSET.len());
    let suffix: String = (0..KEY_SUFFIX_LEN)
        .map(|_| KEY_CHARSET[pick.sample(&mut rng)] as char)
        .collect();
    format!("{}-{}", now.timestamp_millis(), suffix)
}

/// Check whether `key` has the generated-key shape.
pub fn is_generated_key(key: &str) -> bool {
    match key.split_once('-') {
        Some((millis, suffix)) => {
            !millis.is_empty()
                && millis.bytes().all(|b| b.is_ascii_digit())
                && suffix.len() == KEY_SUFFIX_LEN
                && suffix.bytes().all(|b| KEY_CHARSET.contains(&b))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    #[test]
    fn test_generated_key_shape() {
        let key = generate_idempotency_key(fixed_now());
        assert!(key.starts_with("1700000000000-"));
        assert!(is_generated_key(&key), "unexpected key: {}", key);
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = generate_idempotency_key(fixed_now());
        let b = generate_idempotency_key(fixed_now());
        assert_ne!(a, b);
    }

    #[test]
    fn test_is_generated_key_rejects_other_shapes() {
        assert!(!is_generated_key("a1"));
        assert!(!is_generated_key("-abcdefghi"));
        assert!(!is_generated_key("123-ABCDEFGHI"));
        assert!(!is_generated_key("123-abc"));
    }

    #[test]
    fn test_into_record_keeps_supplied_key() {
        let record = SubmitRecord::new(120, 30.0)
            .with_key("a1")
            .into_record(fixed_now())
            .unwrap();
        assert_eq!(record.idempotency_key, "a1");
        assert_eq!(record.key_count, 120);
        assert_eq!(record.timestamp, fixed_now());
        assert_eq!(record.created_at, fixed_now());
    }

    #[test]
    fn test_into_record_generates_key() {
        let record = SubmitRecord::new(1, 0.5).into_record(fixed_now()).unwrap();
        assert!(is_generated_key(&record.idempotency_key));
    }

    #[test]
    fn test_validation_rejects_negative_key_count() {
        let err = SubmitRecord::new(-1, 1.0).validate().unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_validation_rejects_bad_typing_time() {
        assert!(SubmitRecord::new(1, -0.1).validate().is_err());
        assert!(SubmitRecord::new(1, f64::NAN).validate().is_err());
        assert!(SubmitRecord::new(1, f64::INFINITY).validate().is_err());
        assert!(SubmitRecord::new(0, 0.0).validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_keys() {
        assert!(SubmitRecord::new(1, 1.0).with_key("   ").validate().is_err());
        let long = "k".repeat(MAX_KEY_LEN + 1);
        assert!(SubmitRecord::new(1, 1.0).with_key(long).validate().is_err());
        let max = "k".repeat(MAX_KEY_LEN);
        assert!(SubmitRecord::new(1, 1.0).with_key(max).validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_metadata() {
        let bad_accuracy = SubmitRecord::new(1, 1.0).with_metadata(SubmitMetadata {
            accuracy: Some(100.5),
            ..Default::default()
        });
        assert!(bad_accuracy.validate().is_err());

        let bad_pages = SubmitRecord::new(1, 1.0).with_metadata(SubmitMetadata {
            pages: Some(-2),
            ..Default::default()
        });
        assert!(bad_pages.validate().is_err());

        let ok = SubmitRecord::new(1, 1.0).with_metadata(SubmitMetadata {
            accuracy: Some(100.0),
            total_words: Some(0),
            ..Default::default()
        });
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_content_hash_ignores_created_at() {
        let a = SubmitRecord::new(100, 10.0)
            .with_key("a1")
            .with_timestamp(fixed_now())
            .into_record(fixed_now())
            .unwrap();
        let mut b = a.clone();
        b.created_at = fixed_now() + chrono::Duration::seconds(30);
        assert_eq!(a.content_hash(), b.content_hash());

        b.key_count = 150;
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_json_is_camel_case() {
        let record = SubmitRecord::new(120, 30.0)
            .with_key("a1")
            .into_record(fixed_now())
            .unwrap();
        let json = record.to_json().unwrap();
        assert!(json.contains("\"idempotencyKey\":\"a1\""));
        assert!(json.contains("\"keyCount\":120"));
        assert!(!json.contains("windowTitle"));

        let parsed = Record::from_json(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_submit_record_from_ipc_json() {
        let json = r#"{
            "idempotencyKey": "a1",
            "keyCount": 120,
            "typingTime": 30,
            "windowTitle": "notes.txt",
            "accuracy": 97.5
        }"#;
        let submit: SubmitRecord = serde_json::from_str(json).unwrap();
        assert_eq!(submit.idempotency_key.as_deref(), Some("a1"));
        assert_eq!(submit.metadata.window_title.as_deref(), Some("notes.txt"));
        assert_eq!(submit.metadata.accuracy, Some(97.5));
    }
}
