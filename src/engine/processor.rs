//! Sync processor: drains the queue into both stores.
//!
//! One cycle per `processor.interval`:
//!
//! ```text
//! Idle ─→ Draining ─→ WritingPrimary ─→ WritingSecondary ─→ Idle
//!              │              │                  │
//!         (nothing)    (fail: FailedItems,   (fail: restore batch,
//!                       restore, abort)       or failed rows only)
//! ```
//!
//! # Re-entrancy
//!
//! An atomic in-flight flag guards the cycle. A trigger that arrives while
//! a cycle runs returns [`CycleOutcome::Skipped`] immediately, so an item
//! is never written to the primary store by two cycles at once.
//!
//! # Cancellation
//!
//! Drained items are held by a settle guard. If the cycle future is dropped
//! before the batch is settled, the guard returns the items to the queue.

use super::SyncContext;
use crate::circuit_breaker::CircuitError;
use crate::config::ProcessorConfig;
use crate::digest::ContentDigests;
use crate::error::SyncError;
use crate::metrics;
use crate::queue::RecordQueue;
use crate::record::Record;
use crate::status::{ProcessorPhase, StatusLedger, SyncStage};
use crate::store::{PrimaryStore, SecondaryStore};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Why a cycle did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another cycle is running.
    InFlight,
    /// Nothing pending.
    Empty,
}

/// Result of one [`SyncProcessor::run_cycle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    /// Both stores accepted the whole batch.
    Completed { written: usize },
    /// Primary write failed or timed out. Batch restored, items recorded
    /// as failed.
    PrimaryFailed { batch: usize, error: String },
    /// Primary circuit open. Batch restored untouched.
    PrimaryRejected { batch: usize },
    /// Secondary write failed (entirely or for some rows).
    SecondaryFailed {
        batch: usize,
        failed_rows: usize,
        restored: usize,
    },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Skipped(SkipReason::InFlight) => "skipped_in_flight",
            CycleOutcome::Skipped(SkipReason::Empty) => "skipped_empty",
            CycleOutcome::Completed { .. } => "completed",
            CycleOutcome::PrimaryFailed { .. } => "primary_failed",
            CycleOutcome::PrimaryRejected { .. } => "primary_rejected",
            CycleOutcome::SecondaryFailed { .. } => "secondary_failed",
        }
    }

    pub fn batch_size(&self) -> usize {
        match self {
            CycleOutcome::Skipped(_) => 0,
            CycleOutcome::Completed { written } => *written,
            CycleOutcome::PrimaryFailed { batch, .. }
            | CycleOutcome::PrimaryRejected { batch }
            | CycleOutcome::SecondaryFailed { batch, .. } => *batch,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, CycleOutcome::Completed { .. })
    }
}

/// Resets the in-flight flag and phase when a cycle ends.
struct CycleGuard<'a> {
    flag: &'a AtomicBool,
    ledger: &'a StatusLedger,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.ledger.set_phase(ProcessorPhase::Idle);
        self.flag.store(false, Ordering::Release);
    }
}

/// Owns a drained batch until it is completed or restored.
struct BatchSettle<'a> {
    queue: &'a RecordQueue,
    keys: Vec<String>,
    settled: bool,
}

impl BatchSettle<'_> {
    /// Release rows the secondary store accepted. Their digests go in first
    /// so an echo arriving right after release is recognised.
    fn complete_written<'r>(
        &mut self,
        written: impl Iterator<Item = &'r Record>,
        digests: &ContentDigests,
    ) {
        let mut keys = Vec::new();
        for record in written {
            digests.record(record);
            keys.push(record.idempotency_key.clone());
        }
        self.queue.complete(&keys);
    }

    fn restore(&mut self, keys: &[String], error: &str) -> usize {
        self.queue.restore(keys, Some(error))
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for BatchSettle<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let restored = self.queue.restore(&self.keys, Some("cycle cancelled"));
            warn!(restored, "Sync cycle cancelled, batch returned to queue");
        }
    }
}

/// Moves queued records into the primary store, then the secondary store.
pub struct SyncProcessor<P: PrimaryStore, S: SecondaryStore> {
    config: ProcessorConfig,
    ctx: SyncContext<P, S>,
    in_flight: AtomicBool,
}

impl<P: PrimaryStore, S: SecondaryStore> SyncProcessor<P, S> {
    pub fn new(config: ProcessorConfig, ctx: SyncContext<P, S>) -> Self {
        Self {
            config,
            ctx,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one cycle unless one is already running.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync cycle already in flight, skipping");
            return CycleOutcome::Skipped(SkipReason::InFlight);
        }
        let _guard = CycleGuard {
            flag: &self.in_flight,
            ledger: &self.ctx.ledger,
        };

        let start = Instant::now();
        let outcome = self.cycle().await;

        let queue = &self.ctx.queue;
        self.ctx.ledger.set_pending(queue.size());
        metrics::set_queue_depth(queue.pending_len(), queue.in_flight_len());
        if !matches!(outcome, CycleOutcome::Skipped(_)) {
            metrics::record_sync_cycle(outcome.label(), outcome.batch_size(), start.elapsed());
        }
        outcome
    }

    async fn cycle(&self) -> CycleOutcome {
        let queue = &self.ctx.queue;
        let ledger = &self.ctx.ledger;

        if !queue.has_pending() {
            return CycleOutcome::Skipped(SkipReason::Empty);
        }

        ledger.set_phase(ProcessorPhase::Draining);
        let items = queue.drain(self.config.batch_size);
        if items.is_empty() {
            // Everything pending is a newer version of a key still in flight.
            return CycleOutcome::Skipped(SkipReason::Empty);
        }

        let keys: Vec<String> = items.iter().map(|i| i.key().to_string()).collect();
        let records: Vec<Record> = items.into_iter().map(|i| i.record).collect();
        let batch = records.len();
        let mut settle = BatchSettle {
            queue,
            keys: keys.clone(),
            settled: false,
        };
        let write_timeout = self.config.write_timeout_duration();

        // ── Primary ─────────────────────────────────────────────────────────
        ledger.set_phase(ProcessorPhase::WritingPrimary);
        let started = Instant::now();
        let primary = self
            .ctx
            .circuits
            .primary
            .call(|| bounded("primary.batch_write", write_timeout, self.ctx.primary.batch_write(&records)))
            .await;

        match primary {
            Ok(summary) => {
                metrics::record_store_write("primary", true, batch, started.elapsed());
                ledger.record_primary_sync(Utc::now());
                for key in &keys {
                    ledger.clear_failed(key);
                }
                debug!(
                    batch,
                    inserted = summary.inserted,
                    modified = summary.modified,
                    "Primary write done"
                );
            }
            Err(CircuitError::Rejected) => {
                settle.restore(&keys, "primary circuit open");
                settle.settle();
                ledger.push_error(SyncStage::Primary, "Primary write skipped: circuit open");
                return CycleOutcome::PrimaryRejected { batch };
            }
            Err(CircuitError::Inner(e)) => {
                metrics::record_store_write("primary", false, batch, started.elapsed());
                let message = e.to_string();
                let now = Utc::now();
                for record in &records {
                    ledger.add_failed(record.clone(), &message, now);
                }
                ledger.push_error(SyncStage::Primary, format!("Primary batch write failed: {}", message));
                settle.restore(&keys, &message);
                settle.settle();
                warn!(batch, error = %message, "Primary write failed, batch restored");
                return CycleOutcome::PrimaryFailed { batch, error: message };
            }
        }

        // ── Secondary ───────────────────────────────────────────────────────
        ledger.set_phase(ProcessorPhase::WritingSecondary);
        let started = Instant::now();
        let secondary = self
            .ctx
            .circuits
            .secondary
            .call(|| bounded("secondary.batch_write", write_timeout, self.ctx.secondary.batch_write(&records)))
            .await;

        let outcome = match secondary {
            Ok(result) if result.is_complete() => {
                metrics::record_store_write("secondary", true, batch, started.elapsed());
                ledger.record_secondary_sync(Utc::now());
                settle.complete_written(records.iter(), &self.ctx.digests);
                CycleOutcome::Completed { written: batch }
            }
            Ok(result) => {
                metrics::record_store_write("secondary", false, batch, started.elapsed());
                let failed_rows = result.failed.len();
                ledger.push_error(
                    SyncStage::Secondary,
                    format!(
                        "Secondary write: {} of {} rows failed: {}",
                        failed_rows,
                        batch,
                        result.describe_failures(3)
                    ),
                );
                let restored = if self.config.partial_retry {
                    let failed_keys = result.failed_keys();
                    settle.complete_written(
                        records.iter().filter(|r| !failed_keys.contains(&r.idempotency_key)),
                        &self.ctx.digests,
                    );
                    settle.restore(&failed_keys, "secondary row rejected")
                } else {
                    settle.restore(&keys, "secondary rows rejected")
                };
                CycleOutcome::SecondaryFailed {
                    batch,
                    failed_rows,
                    restored,
                }
            }
            Err(err) => {
                let message = match err {
                    CircuitError::Rejected => "Secondary write skipped: circuit open".to_string(),
                    CircuitError::Inner(e) => {
                        metrics::record_store_write("secondary", false, batch, started.elapsed());
                        format!("Secondary batch write failed: {}", e)
                    }
                };
                ledger.push_error(SyncStage::Secondary, message.clone());
                let restored = settle.restore(&keys, &message);
                warn!(batch, error = %message, "Secondary write failed, batch restored");
                CycleOutcome::SecondaryFailed {
                    batch,
                    failed_rows: batch,
                    restored,
                }
            }
        };
        settle.settle();
        outcome
    }

    /// Periodic loop. Runs until shutdown is signalled; a running cycle is
    /// allowed to finish.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.config.interval_duration();
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_ms = interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Sync processor started"
        );

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            match self.run_cycle().await {
                CycleOutcome::Completed { written } => debug!(written, "Sync cycle completed"),
                CycleOutcome::Skipped(_) => {}
                other => debug!(outcome = other.label(), "Sync cycle did not complete"),
            }
        }

        info!("Sync processor stopped");
    }
}

/// Bound a store call by `after`.
async fn bounded<T, F>(operation: &str, after: Duration, fut: F) -> crate::error::Result<T>
where
    F: std::future::Future<Output = crate::error::Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::timeout(operation, after)),
    }
}
