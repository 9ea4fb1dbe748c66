//! Configuration for the sync engine.
//!
//! All types here can be constructed programmatically, deserialized from
//! YAML/JSON, or assembled from environment variables via
//! [`SyncConfig::from_env()`]. Durations are humantime strings ("3s",
//! "5min", "168h") parsed on access.
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── settings: SyncSettings
//! │   ├── processor: ProcessorConfig          # drain cycle (3s, batch 50)
//! │   ├── change_capture: ChangeCaptureConfig # watch + reconnect (5s)
//! │   ├── etl: EtlConfig                      # weekly catch-up (168h, first after 5min)
//! │   ├── health: HealthConfig                # reconnect/ping loop (30s)
//! │   ├── circuit: CircuitConfig              # store write breakers
//! │   └── max_sync_errors: usize              # sync_errors ring capacity
//! ├── primary: PrimaryStoreConfig             # Redis URL, key prefix, retention
//! ├── secondary: SecondaryStoreConfig         # SQLite analytical store
//! └── checkpoint: CheckpointConfig            # local durable journal
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! settings:
//!   processor:
//!     interval: "3s"
//!     batch_size: 50
//!   etl:
//!     interval: "168h"
//!     initial_delay: "5min"
//!
//! primary:
//!   url: "redis://127.0.0.1:6379"
//!   key_prefix: "typing:"
//!   retention_days: 30
//!
//! secondary:
//!   sqlite_path: "/var/lib/typing/sessions.db"
//!
//! checkpoint:
//!   sqlite_path: "/var/lib/typing/checkpoint.db"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parse a humantime duration, falling back to `default` on malformed input.
fn parse_or(value: &str, default: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(default)
}

fn check_duration(field: &str, value: &str) -> Result<()> {
    humantime::parse_duration(value)
        .map(|_| ())
        .map_err(|e| SyncError::Config(format!("{field}: invalid duration '{value}': {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `SyncEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncConfig {
    /// Scheduling and pipeline settings.
    #[serde(default)]
    pub settings: SyncSettings,

    /// Primary operational store connection.
    #[serde(default)]
    pub primary: PrimaryStoreConfig,

    /// Secondary analytical store connection.
    #[serde(default)]
    pub secondary: SecondaryStoreConfig,

    /// Local checkpoint journal (pending queue + resume token).
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl SyncConfig {
    /// Create a config with fast timers and no disk state, for tests.
    pub fn for_testing() -> Self {
        Self {
            settings: SyncSettings {
                processor: ProcessorConfig {
                    interval: "50ms".to_string(),
                    write_timeout: "500ms".to_string(),
                    ..Default::default()
                },
                change_capture: ChangeCaptureConfig {
                    reconnect_delay: "50ms".to_string(),
                    ..Default::default()
                },
                etl: EtlConfig {
                    initial_delay: "1h".to_string(),
                    query_timeout: "1s".to_string(),
                    ..Default::default()
                },
                health: HealthConfig {
                    check_interval: "100ms".to_string(),
                    probe_timeout: "250ms".to_string(),
                    ..Default::default()
                },
                circuit: CircuitConfig::testing(),
                max_sync_errors: default_max_sync_errors(),
            },
            primary: PrimaryStoreConfig::default(),
            secondary: SecondaryStoreConfig::in_memory(),
            checkpoint: CheckpointConfig::disabled(),
        }
    }

    /// Build a config from defaults overridden by `TYPING_SYNC_*` variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `TYPING_SYNC_PRIMARY_URL` | `primary.url` |
    /// | `TYPING_SYNC_PRIMARY_PREFIX` | `primary.key_prefix` |
    /// | `TYPING_SYNC_RETENTION_DAYS` | `primary.retention_days` |
    /// | `TYPING_SYNC_SECONDARY_PATH` | `secondary.sqlite_path` |
    /// | `TYPING_SYNC_CHECKPOINT_PATH` | `checkpoint.sqlite_path` |
    /// | `TYPING_SYNC_INTERVAL` | `settings.processor.interval` |
    /// | `TYPING_SYNC_BATCH_SIZE` | `settings.processor.batch_size` |
    /// | `TYPING_SYNC_WRITE_TIMEOUT` | `settings.processor.write_timeout` |
    /// | `TYPING_SYNC_HEALTH_INTERVAL` | `settings.health.check_interval` |
    /// | `TYPING_SYNC_ETL_INTERVAL` | `settings.etl.interval` |
    /// | `TYPING_SYNC_ETL_INITIAL_DELAY` | `settings.etl.initial_delay` |
    /// | `TYPING_SYNC_RECONNECT_DELAY` | `settings.change_capture.reconnect_delay` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("TYPING_SYNC_PRIMARY_URL") {
            config.primary.url = url;
        }
        if let Some(prefix) = lookup("TYPING_SYNC_PRIMARY_PREFIX") {
            config.primary.key_prefix = prefix;
        }
        if let Some(days) = lookup("TYPING_SYNC_RETENTION_DAYS") {
            config.primary.retention_days = parse_number("TYPING_SYNC_RETENTION_DAYS", &days)?;
        }
        if let Some(path) = lookup("TYPING_SYNC_SECONDARY_PATH") {
            config.secondary.sqlite_path = path;
        }
        if let Some(path) = lookup("TYPING_SYNC_CHECKPOINT_PATH") {
            config.checkpoint.sqlite_path = path;
        }
        if let Some(interval) = lookup("TYPING_SYNC_INTERVAL") {
            config.settings.processor.interval = interval;
        }
        if let Some(size) = lookup("TYPING_SYNC_BATCH_SIZE") {
            config.settings.processor.batch_size = parse_number("TYPING_SYNC_BATCH_SIZE", &size)?;
        }
        if let Some(timeout) = lookup("TYPING_SYNC_WRITE_TIMEOUT") {
            config.settings.processor.write_timeout = timeout;
        }
        if let Some(interval) = lookup("TYPING_SYNC_HEALTH_INTERVAL") {
            config.settings.health.check_interval = interval;
        }
        if let Some(interval) = lookup("TYPING_SYNC_ETL_INTERVAL") {
            config.settings.etl.interval = interval;
        }
        if let Some(delay) = lookup("TYPING_SYNC_ETL_INITIAL_DELAY") {
            config.settings.etl.initial_delay = delay;
        }
        if let Some(delay) = lookup("TYPING_SYNC_RECONNECT_DELAY") {
            config.settings.change_capture.reconnect_delay = delay;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every duration string and numeric bound.
    pub fn validate(&self) -> Result<()> {
        let s = &self.settings;
        check_duration("processor.interval", &s.processor.interval)?;
        check_duration("processor.write_timeout", &s.processor.write_timeout)?;
        check_duration("change_capture.reconnect_delay", &s.change_capture.reconnect_delay)?;
        check_duration("etl.interval", &s.etl.interval)?;
        check_duration("etl.initial_delay", &s.etl.initial_delay)?;
        check_duration("etl.query_timeout", &s.etl.query_timeout)?;
        check_duration("health.check_interval", &s.health.check_interval)?;
        check_duration("health.probe_timeout", &s.health.probe_timeout)?;
        check_duration("checkpoint.flush_interval", &self.checkpoint.flush_interval)?;
        check_duration("circuit.recovery_timeout", &s.circuit.recovery_timeout)?;

        if s.processor.batch_size == 0 {
            return Err(SyncError::Config("processor.batch_size must be > 0".into()));
        }
        if s.etl.chunk_size == 0 {
            return Err(SyncError::Config("etl.chunk_size must be > 0".into()));
        }
        if s.max_sync_errors == 0 {
            return Err(SyncError::Config("max_sync_errors must be > 0".into()));
        }
        if self.primary.url.is_empty() {
            return Err(SyncError::Config("primary.url must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SyncError::Config(format!("{name}: '{value}' is not a valid number: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncSettings: the four periodic jobs
// ═══════════════════════════════════════════════════════════════════════════════

/// Scheduling settings for the processor, bridge, ETL and health jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub change_capture: ChangeCaptureConfig,
    #[serde(default)]
    pub etl: EtlConfig,
    #[serde(default)]
    pub health: HealthConfig,

    /// Breakers around primary and secondary writes.
    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Capacity of the `sync_errors` ring in the status ledger.
    #[serde(default = "default_max_sync_errors")]
    pub max_sync_errors: usize,
}

fn default_max_sync_errors() -> usize {
    50
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            change_capture: ChangeCaptureConfig::default(),
            etl: EtlConfig::default(),
            health: HealthConfig::default(),
            circuit: CircuitConfig::default(),
            max_sync_errors: default_max_sync_errors(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProcessorConfig: drain cycle
// ═══════════════════════════════════════════════════════════════════════════════

/// Sync processor (drain + dual write) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Whether the periodic drain loop runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cycle period as a duration string (e.g., "3s").
    #[serde(default = "default_sync_interval")]
    pub interval: String,

    /// Maximum records taken off the queue per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Deadline for each store `batch_write` call. A stalled write past
    /// this point counts as a failure and the batch stays queued.
    #[serde(default = "default_write_timeout")]
    pub write_timeout: String,

    /// On a partial secondary failure, retry only the rows that failed
    /// instead of the whole batch.
    #[serde(default = "default_false")]
    pub partial_retry: bool,
}

fn default_sync_interval() -> String {
    "3s".to_string()
}

fn default_batch_size() -> usize {
    50
}

fn default_write_timeout() -> String {
    "10s".to_string()
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_sync_interval(),
            batch_size: default_batch_size(),
            write_timeout: default_write_timeout(),
            partial_retry: false,
        }
    }
}

impl ProcessorConfig {
    /// Cycle period.
    pub fn interval_duration(&self) -> Duration {
        parse_or(&self.interval, Duration::from_secs(3))
    }

    /// Per-call write deadline.
    pub fn write_timeout_duration(&self) -> Duration {
        parse_or(&self.write_timeout, Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChangeCaptureConfig: primary-store watch
// ═══════════════════════════════════════════════════════════════════════════════

/// Change-capture bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeCaptureConfig {
    /// Whether to subscribe to primary-store changes.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fixed delay before resubscribing after a stream error.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: String,

    /// Throttle re-enqueueing of captured documents.
    /// Protects the queue when a large backlog is replayed after reconnect.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained events per second when throttling.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst allowance when throttling.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Most content digests kept for echo suppression. Older entries are
    /// evicted; an evicted echo costs one redundant secondary write.
    #[serde(default = "default_digest_capacity")]
    pub digest_capacity: usize,
}

fn default_reconnect_delay() -> String {
    "5s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

fn default_digest_capacity() -> usize {
    100_000
}

impl Default for ChangeCaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconnect_delay: default_reconnect_delay(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            digest_capacity: default_digest_capacity(),
        }
    }
}

impl ChangeCaptureConfig {
    /// Delay between a stream failure and the next subscribe attempt.
    pub fn reconnect_delay_duration(&self) -> Duration {
        parse_or(&self.reconnect_delay, Duration::from_secs(5))
    }

    /// Rate limit settings, or `None` when throttling is off.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EtlConfig: long-period catch-up
// ═══════════════════════════════════════════════════════════════════════════════

/// ETL scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    /// Whether the periodic catch-up runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Period between full catch-ups.
    #[serde(default = "default_etl_interval")]
    pub interval: String,

    /// Delay before the first catch-up after start.
    #[serde(default = "default_etl_initial_delay")]
    pub initial_delay: String,

    /// Records pulled from the primary store per query page.
    #[serde(default = "default_query_limit")]
    pub query_limit: usize,

    /// Records per secondary `batch_write` during a run.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Deadline for the primary query and each chunk write.
    #[serde(default = "default_query_timeout")]
    pub query_timeout: String,
}

fn default_etl_interval() -> String {
    "168h".to_string()
}

fn default_etl_initial_delay() -> String {
    "5min".to_string()
}

fn default_query_limit() -> usize {
    10_000
}

fn default_chunk_size() -> usize {
    500
}

fn default_query_timeout() -> String {
    "60s".to_string()
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_etl_interval(),
            initial_delay: default_etl_initial_delay(),
            query_limit: default_query_limit(),
            chunk_size: default_chunk_size(),
            query_timeout: default_query_timeout(),
        }
    }
}

impl EtlConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_or(&self.interval, Duration::from_secs(168 * 3600))
    }

    pub fn initial_delay_duration(&self) -> Duration {
        parse_or(&self.initial_delay, Duration::from_secs(300))
    }

    pub fn query_timeout_duration(&self) -> Duration {
        parse_or(&self.query_timeout, Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HealthConfig: reconnect/ping loop
// ═══════════════════════════════════════════════════════════════════════════════

/// Health supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Whether the periodic probe runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Probe period.
    #[serde(default = "default_check_interval")]
    pub check_interval: String,

    /// Deadline for a single connect/ping/liveness probe.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: String,
}

fn default_check_interval() -> String {
    "30s".to_string()
}

fn default_probe_timeout() -> String {
    "5s".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: default_check_interval(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

impl HealthConfig {
    pub fn check_interval_duration(&self) -> Duration {
        parse_or(&self.check_interval, Duration::from_secs(30))
    }

    pub fn probe_timeout_duration(&self) -> Duration {
        parse_or(&self.probe_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store connections
// ═══════════════════════════════════════════════════════════════════════════════

/// Primary (Redis) store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryStoreConfig {
    /// Redis URL, e.g. `"redis://127.0.0.1:6379"`.
    #[serde(default = "default_primary_url")]
    pub url: String,

    /// Prefix for every key this engine touches.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Documents expire this many days after their last write.
    /// Applied by the store through key expiry, never by the pipeline.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// Approximate cap on change-stream length (`XADD MAXLEN ~`).
    #[serde(default = "default_stream_max_len")]
    pub stream_max_len: usize,

    /// `XREAD BLOCK` timeout while tailing the change stream.
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// Entries read per `XREAD`.
    #[serde(default = "default_read_count")]
    pub read_count: usize,
}

fn default_primary_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "typing:".to_string()
}

fn default_retention_days() -> u64 {
    30
}

fn default_stream_max_len() -> usize {
    100_000
}

fn default_block_timeout() -> String {
    "5s".to_string()
}

fn default_read_count() -> usize {
    100
}

impl Default for PrimaryStoreConfig {
    fn default() -> Self {
        Self {
            url: default_primary_url(),
            key_prefix: default_key_prefix(),
            retention_days: default_retention_days(),
            stream_max_len: default_stream_max_len(),
            block_timeout: default_block_timeout(),
            read_count: default_read_count(),
        }
    }
}

impl PrimaryStoreConfig {
    /// Create a config pointing at `url` with default keys.
    pub fn for_testing(url: &str) -> Self {
        Self {
            url: url.to_string(),
            block_timeout: "200ms".to_string(),
            ..Default::default()
        }
    }

    /// Key of the hash holding one record.
    pub fn record_key(&self, idempotency_key: &str) -> String {
        format!("{}record:{}", self.key_prefix, idempotency_key)
    }

    /// Sorted set indexing records by event timestamp.
    pub fn timestamp_index_key(&self) -> String {
        format!("{}records:by_ts", self.key_prefix)
    }

    /// Sorted set indexing records by write time, for retention pruning.
    pub fn write_index_key(&self) -> String {
        format!("{}records:by_write", self.key_prefix)
    }

    /// Change stream key.
    pub fn change_stream_key(&self) -> String {
        format!("{}changes", self.key_prefix)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 3600))
    }

    pub fn block_timeout_duration(&self) -> Duration {
        parse_or(&self.block_timeout, Duration::from_secs(5))
    }
}

/// Secondary (SQLite analytical) store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryStoreConfig {
    /// Path to the SQLite database, or `":memory:"`.
    #[serde(default = "default_secondary_path")]
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_secondary_path() -> String {
    "typing_sessions.db".to_string()
}

impl Default for SecondaryStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_secondary_path(),
            wal_mode: true,
        }
    }
}

impl SecondaryStoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: local durable journal
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint journal configuration.
///
/// The pending queue and the change-stream resume token are written to
/// SQLite every `flush_interval` and replayed on the next start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to SQLite database for the journal.
    #[serde(default = "default_checkpoint_path")]
    pub sqlite_path: String,

    /// How often dirty state is flushed.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_checkpoint_path() -> String {
    "typing_sync_checkpoint.db".to_string()
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sqlite_path: default_checkpoint_path(),
            flush_interval: default_flush_interval(),
        }
    }
}

impl CheckpointConfig {
    /// Journal at `path`, flushed quickly (tests).
    pub fn at_path(path: impl Into<String>) -> Self {
        Self {
            enabled: true,
            sqlite_path: path.into(),
            flush_interval: "100ms".to_string(),
        }
    }

    /// No journal: queue and token live in memory only.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn flush_interval_duration(&self) -> Duration {
        parse_or(&self.flush_interval, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
