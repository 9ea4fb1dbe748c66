//! Metrics for observability.
//!
//! Emits through the `metrics` facade; install any recorder (Prometheus,
//! statsd, ...) in the host process to export them.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `typing_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use typing_sync_engine::metrics;
//! use std::time::Duration;
//!
//! metrics::record_sync_cycle("completed", 50, Duration::from_millis(120));
//! metrics::set_queue_depth(12, 50);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Intake & Queue
// =============================================================================

/// Record a `submit` call by outcome (appended, replaced, unchanged, rejected).
pub fn record_submit(outcome: &str) {
    counter!("typing_sync_submits_total", "outcome" => outcome.to_string()).increment(1);
}

/// Current queue depth split by region.
pub fn set_queue_depth(pending: usize, in_flight: usize) {
    gauge!("typing_sync_queue_pending").set(pending as f64);
    gauge!("typing_sync_queue_in_flight").set(in_flight as f64);
}

// =============================================================================
// Sync Processor
// =============================================================================

/// Record a drain cycle.
pub fn record_sync_cycle(outcome: &str, batch_size: usize, duration: Duration) {
    counter!("typing_sync_cycles_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("typing_sync_cycle_batch_size").record(batch_size as f64);
    histogram!("typing_sync_cycle_duration_seconds").record(duration.as_secs_f64());
}

/// Record a store `batch_write` call.
pub fn record_store_write(store: &str, success: bool, records: usize, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "typing_sync_store_writes_total",
        "store" => store.to_string(),
        "status" => status
    )
    .increment(1);
    if success {
        counter!("typing_sync_store_records_written_total", "store" => store.to_string())
            .increment(records as u64);
    }
    histogram!("typing_sync_store_write_duration_seconds", "store" => store.to_string())
        .record(duration.as_secs_f64());
}

/// Dead-letter ledger size.
pub fn set_failed_items(count: usize) {
    gauge!("typing_sync_failed_items").set(count as f64);
}

/// Record an entry added to the `sync_errors` ring.
pub fn record_sync_error(stage: &str) {
    counter!("typing_sync_errors_total", "stage" => stage.to_string()).increment(1);
}

// =============================================================================
// Change Capture
// =============================================================================

/// Record a change event by outcome (enqueued, echo, ignored).
pub fn record_change_event(outcome: &str) {
    counter!("typing_sync_change_events_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a change-stream resubscribe by reason.
pub fn record_change_stream_reconnect(reason: &str) {
    counter!(
        "typing_sync_change_stream_reconnects_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Lag between an event's stream timestamp and now.
pub fn record_change_lag_ms(lag_ms: u64) {
    gauge!("typing_sync_change_lag_ms").set(lag_ms as f64);
}

// =============================================================================
// ETL
// =============================================================================

/// Record a completed catch-up run.
pub fn record_etl_run(fetched: usize, exported: usize, failed_rows: usize, duration: Duration) {
    counter!("typing_sync_etl_runs_total").increment(1);
    counter!("typing_sync_etl_records_exported_total").increment(exported as u64);
    if failed_rows > 0 {
        counter!("typing_sync_etl_failed_rows_total").increment(failed_rows as u64);
    }
    histogram!("typing_sync_etl_fetched").record(fetched as f64);
    histogram!("typing_sync_etl_duration_seconds").record(duration.as_secs_f64());
}

/// Record a skipped catch-up (already running, query failed, ...).
pub fn record_etl_skipped(reason: &str) {
    counter!("typing_sync_etl_skipped_total", "reason" => reason.to_string()).increment(1);
}

// =============================================================================
// Health
// =============================================================================

/// Record a ping round-trip.
pub fn record_store_ping(store: &str, latency: Duration) {
    histogram!("typing_sync_store_ping_seconds", "store" => store.to_string())
        .record(latency.as_secs_f64());
}

/// 1.0 when the store is reachable, 0.0 otherwise.
pub fn set_store_connected(store: &str, connected: bool) {
    gauge!("typing_sync_store_connected", "store" => store.to_string())
        .set(if connected { 1.0 } else { 0.0 });
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("typing_sync_engine_state").set(value);
}

// =============================================================================
// Checkpoint & SQLite
// =============================================================================

/// Record a resume-token flush.
pub fn record_checkpoint_flush(flushed: usize, errors: usize) {
    counter!("typing_sync_checkpoint_flushes_total").increment(1);
    counter!("typing_sync_checkpoint_tokens_flushed_total").increment(flushed as u64);
    if errors > 0 {
        counter!("typing_sync_checkpoint_flush_errors_total").increment(errors as u64);
    }
}

/// Records held in the pending journal after the last save.
pub fn set_checkpoint_pending(count: usize) {
    gauge!("typing_sync_checkpoint_pending").set(count as f64);
}

/// Record a SQLite retry (SQLITE_BUSY/SQLITE_LOCKED).
pub fn sqlite_retries_total(operation: &str) {
    counter!("typing_sync_sqlite_retries_total", "operation" => operation.to_string())
        .increment(1);
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "typing_sync_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
