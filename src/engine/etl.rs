//! ETL scheduler: periodic full catch-up from primary to secondary.
//!
//! The streaming path (processor + change capture) can miss records: a
//! token that expired during downtime, a process that crashed between
//! checkpoint flushes, a client that wrote to the primary while nothing
//! was listening. This job is the repair path. It pages through everything
//! newer than `last_secondary_sync` in the primary store, `query_limit`
//! records at a time, and re-drives it through the secondary store in
//! chunks. The watermark only moves once every page went through cleanly.
//!
//! Runs on a long timer (`etl.interval`, weekly by default), once shortly
//! after start (`etl.initial_delay`), and whenever someone calls
//! [`EtlScheduler::trigger`] (the change-capture bridge does, when its
//! resume token is rejected).

use super::SyncContext;
use crate::circuit_breaker::CircuitError;
use crate::config::EtlConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::record::Record;
use crate::status::{StatusLedger, SyncStage};
use crate::store::{PrimaryStore, QueryOptions, RecordFilter, SecondaryStore, SortOrder};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Counts from one catch-up run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtlReport {
    /// Records returned by the primary query.
    pub fetched: usize,
    /// Rows the secondary store accepted.
    pub exported: usize,
    /// Rows rejected, or lost with a failed chunk.
    pub failed_rows: usize,
    /// Secondary `batch_write` calls made.
    pub chunks: usize,
    /// Primary query pages read.
    pub pages: usize,
    /// Records left to the sync processor because their key was queued.
    pub skipped: usize,
}

impl EtlReport {
    pub fn is_clean(&self) -> bool {
        self.failed_rows == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EtlOutcome {
    /// Another run holds the full-sync flag.
    AlreadyRunning,
    Completed(EtlReport),
}

struct FullSyncGuard<'a>(&'a StatusLedger);

impl Drop for FullSyncGuard<'_> {
    fn drop(&mut self) {
        self.0.end_full_sync();
    }
}

pub struct EtlScheduler<P: PrimaryStore, S: SecondaryStore> {
    config: EtlConfig,
    ctx: SyncContext<P, S>,
    trigger: Arc<Notify>,
}

impl<P: PrimaryStore, S: SecondaryStore> EtlScheduler<P, S> {
    pub fn new(config: EtlConfig, ctx: SyncContext<P, S>, trigger: Arc<Notify>) -> Self {
        Self {
            config,
            ctx,
            trigger,
        }
    }

    /// Ask the running loop for a catch-up as soon as possible.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Run a catch-up now, unless one is already running.
    ///
    /// Returns `Err` only when the primary query fails; chunk failures are
    /// counted in the report and logged to `sync_errors`.
    #[instrument(skip(self))]
    pub async fn run_now(&self) -> Result<EtlOutcome> {
        let ledger = &self.ctx.ledger;
        if !ledger.try_begin_full_sync() {
            debug!("Full sync already running");
            metrics::record_etl_skipped("already_running");
            return Ok(EtlOutcome::AlreadyRunning);
        }
        let _guard = FullSyncGuard(ledger);

        let start = Instant::now();
        // Default is the Unix epoch.
        let since: DateTime<Utc> = ledger.last_secondary_sync().unwrap_or_default();
        info!(since = %since, "Full sync started");

        let timeout = self.config.query_timeout_duration();
        let page_size = self.config.query_limit.max(1);
        let mut limit = page_size;
        let mut report = EtlReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut cursor = since;

        loop {
            let options = QueryOptions {
                sort: SortOrder::Ascending,
                limit,
            };
            let query = self.ctx.primary.query(RecordFilter::after(cursor), options);
            let page = match tokio::time::timeout(timeout, query).await {
                Ok(Ok(records)) => records,
                Ok(Err(e)) => return Err(self.fail(e)),
                Err(_) => return Err(self.fail(SyncError::timeout("etl.primary_query", timeout))),
            };
            report.pages += 1;
            let full_page = page.len() >= limit;
            let last_timestamp = page.last().map(|r| r.timestamp);

            // Keys still queued or in flight belong to the processor, which
            // holds a version at least as new as this one.
            let mut fresh = Vec::with_capacity(page.len());
            for record in page {
                if !seen.insert(record.idempotency_key.clone()) {
                    continue;
                }
                if self.ctx.queue.contains(&record.idempotency_key) {
                    report.skipped += 1;
                    continue;
                }
                fresh.push(record);
            }
            report.fetched += fresh.len();
            self.export(&fresh, timeout, &mut report).await;

            let Some(last) = last_timestamp.filter(|_| full_page) else {
                break;
            };
            // Step back one millisecond so rows sharing the page's last
            // timestamp are picked up by the next page.
            let next = last - chrono::Duration::milliseconds(1);
            if next <= cursor {
                // The whole page shares one millisecond. Widen the page
                // until it holds every row at that timestamp.
                limit = limit.saturating_mul(2);
                debug!(cursor = %cursor, limit, "Full sync page widened");
                continue;
            }
            limit = page_size;
            cursor = next;
        }

        if report.is_clean() {
            let now = Utc::now();
            ledger.record_secondary_sync(now);
            ledger.record_full_sync(now);
        }

        metrics::record_etl_run(report.fetched, report.exported, report.failed_rows, start.elapsed());
        info!(
            fetched = report.fetched,
            exported = report.exported,
            failed_rows = report.failed_rows,
            skipped = report.skipped,
            pages = report.pages,
            chunks = report.chunks,
            duration_ms = start.elapsed().as_millis() as u64,
            "Full sync finished"
        );
        Ok(EtlOutcome::Completed(report))
    }

    /// Write one page through the secondary store in chunks.
    async fn export(&self, records: &[Record], timeout: Duration, report: &mut EtlReport) {
        let ledger = &self.ctx.ledger;
        for chunk in records.chunks(self.config.chunk_size.max(1)) {
            report.chunks += 1;
            let write = self.ctx.circuits.secondary.call(|| async {
                match tokio::time::timeout(timeout, self.ctx.secondary.batch_write(chunk)).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::timeout("etl.secondary_write", timeout)),
                }
            });

            match write.await {
                Ok(result) => {
                    let failed_keys = result.failed_keys();
                    for record in chunk.iter().filter(|r| !failed_keys.contains(&r.idempotency_key)) {
                        self.ctx.digests.record(record);
                    }
                    report.exported += result.inserted_count;
                    report.failed_rows += result.failed.len();
                    if !result.is_complete() {
                        ledger.push_error(
                            SyncStage::Etl,
                            format!(
                                "Full sync chunk {}: {} rows failed: {}",
                                report.chunks,
                                result.failed.len(),
                                result.describe_failures(3)
                            ),
                        );
                    }
                }
                Err(err) => {
                    report.failed_rows += chunk.len();
                    let message = match err {
                        CircuitError::Rejected => "secondary circuit open".to_string(),
                        CircuitError::Inner(e) => e.to_string(),
                    };
                    warn!(chunk = report.chunks, error = %message, "Full sync chunk failed");
                    ledger.push_error(
                        SyncStage::Etl,
                        format!("Full sync chunk {} failed: {}", report.chunks, message),
                    );
                }
            }
        }
    }

    fn fail(&self, error: SyncError) -> SyncError {
        warn!(error = %error, "Full sync query failed");
        self.ctx
            .ledger
            .push_error(SyncStage::Etl, format!("Full sync query failed: {}", error));
        error
    }

    /// Timer + trigger loop. Runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let initial_delay = self.config.initial_delay_duration();
        let interval = self.config.interval_duration();
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + initial_delay, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            initial_delay_secs = initial_delay.as_secs(),
            interval_secs = interval.as_secs(),
            "ETL scheduler started"
        );

        loop {
            let reason = tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }

                _ = self.trigger.notified() => "triggered",
                _ = timer.tick() => "scheduled",
            };

            debug!(reason, "Running full sync");
            if let Err(e) = self.run_now().await {
                debug!(error = %e, "Full sync aborted");
            }
        }

        info!("ETL scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitConfig, StoreCircuits};
    use crate::config::SyncConfig;
    use crate::digest::ContentDigests;
    use crate::queue::RecordQueue;
    use crate::record::SubmitRecord;
    use crate::store::memory::{MemoryPrimaryStore, MemorySecondaryStore};
    use chrono::TimeZone;

    type Ctx = SyncContext<MemoryPrimaryStore, MemorySecondaryStore>;

    fn setup(chunk_size: usize) -> (EtlScheduler<MemoryPrimaryStore, MemorySecondaryStore>, Ctx) {
        setup_paged(chunk_size, SyncConfig::for_testing().settings.etl.query_limit)
    }

    fn setup_paged(
        chunk_size: usize,
        query_limit: usize,
    ) -> (EtlScheduler<MemoryPrimaryStore, MemorySecondaryStore>, Ctx) {
        let ctx = SyncContext {
            primary: Arc::new(MemoryPrimaryStore::new()),
            secondary: Arc::new(MemorySecondaryStore::new()),
            queue: Arc::new(RecordQueue::new()),
            ledger: Arc::new(StatusLedger::default()),
            digests: Arc::new(ContentDigests::new()),
            circuits: Arc::new(StoreCircuits::new(CircuitConfig::testing())),
        };
        let mut config = SyncConfig::for_testing().settings.etl;
        config.chunk_size = chunk_size;
        config.query_limit = query_limit;
        (EtlScheduler::new(config, ctx.clone(), Arc::new(Notify::new())), ctx)
    }

    fn rec(key: &str, secs: i64) -> Record {
        SubmitRecord::new(10, 2.0)
            .with_key(key)
            .with_timestamp(Utc.timestamp_opt(secs, 0).unwrap())
            .into_record(Utc::now())
            .unwrap()
    }

    fn completed(outcome: EtlOutcome) -> EtlReport {
        match outcome {
            EtlOutcome::Completed(report) => report,
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_catch_up_exports_everything_in_chunks() {
        let (etl, ctx) = setup(2);
        for i in 0..5 {
            ctx.primary.write_external(rec(&format!("k{}", i), 1_000 + i));
        }

        let report = completed(etl.run_now().await.unwrap());
        assert_eq!(
            report,
            EtlReport {
                fetched: 5,
                exported: 5,
                failed_rows: 0,
                chunks: 3,
                pages: 1,
                skipped: 0,
            }
        );
        assert_eq!(ctx.secondary.len(), 5);

        let status = ctx.ledger.snapshot(crate::engine::EngineState::Running);
        assert!(status.last_full_sync.is_some());
        assert!(status.last_secondary_sync.is_some());
        assert!(!status.is_full_sync_running);
    }

    #[tokio::test]
    async fn test_only_records_after_last_secondary_sync() {
        let (etl, ctx) = setup(500);
        ctx.primary.write_external(rec("old", 100));
        ctx.primary.write_external(rec("new", 300));
        ctx.ledger.record_secondary_sync(Utc.timestamp_opt(200, 0).unwrap());

        let report = completed(etl.run_now().await.unwrap());
        assert_eq!(report.fetched, 1);
        assert!(ctx.secondary.contains("new"));
        assert!(!ctx.secondary.contains("old"));
    }

    #[tokio::test]
    async fn test_pages_past_query_limit() {
        let (etl, ctx) = setup_paged(500, 3);
        for i in 0..5 {
            ctx.primary.write_external(rec(&format!("k{}", i), 1_000 + i));
        }

        let report = completed(etl.run_now().await.unwrap());
        assert_eq!(report.fetched, 5);
        assert_eq!(report.exported, 5);
        assert!(report.pages >= 2);
        assert!(report.is_clean());
        assert_eq!(ctx.secondary.len(), 5);
        assert!(ctx.ledger.last_secondary_sync().is_some());
    }

    #[tokio::test]
    async fn test_shared_timestamp_across_page_boundary() {
        let (etl, ctx) = setup_paged(500, 2);
        ctx.primary.write_external(rec("a", 100));
        ctx.primary.write_external(rec("b", 200));
        ctx.primary.write_external(rec("c", 200));
        ctx.primary.write_external(rec("d", 300));

        let report = completed(etl.run_now().await.unwrap());
        assert_eq!(report.fetched, 4);
        assert_eq!(report.exported, 4);
        assert_eq!(ctx.secondary.len(), 4);
    }

    #[tokio::test]
    async fn test_more_rows_at_one_timestamp_than_a_page() {
        let (etl, ctx) = setup_paged(500, 2);
        for key in ["a", "b", "c", "d", "e"] {
            ctx.primary.write_external(rec(key, 100));
        }

        let report = completed(etl.run_now().await.unwrap());
        assert_eq!(report.fetched, 5);
        assert_eq!(ctx.secondary.len(), 5);
        assert!(ctx.ledger.last_secondary_sync().is_some());
    }

    #[tokio::test]
    async fn test_queued_keys_are_left_to_the_processor() {
        let (etl, ctx) = setup(500);
        let stale = rec("a1", 100);
        ctx.primary.write_external(stale.clone());
        ctx.primary.write_external(rec("b1", 200));
        let mut newer = stale;
        newer.key_count = 99;
        ctx.queue.enqueue(newer);

        let report = completed(etl.run_now().await.unwrap());
        assert_eq!(report.skipped, 1);
        assert_eq!(report.fetched, 1);
        assert!(report.is_clean());
        assert!(!ctx.secondary.contains("a1"));
        assert!(ctx.secondary.contains("b1"));
        assert!(ctx.queue.contains("a1"));
    }

    #[tokio::test]
    async fn test_overlapping_run_is_refused() {
        let (etl, ctx) = setup(500);
        assert!(ctx.ledger.try_begin_full_sync());
        assert_eq!(etl.run_now().await.unwrap(), EtlOutcome::AlreadyRunning);
        ctx.ledger.end_full_sync();
        assert!(matches!(etl.run_now().await.unwrap(), EtlOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_row_failures_keep_watermark() {
        let (etl, ctx) = setup(500);
        ctx.primary.write_external(rec("good", 10));
        ctx.primary.write_external(rec("bad", 20));
        ctx.secondary.fail_keys(["bad"]);

        let report = completed(etl.run_now().await.unwrap());
        assert_eq!(report.exported, 1);
        assert_eq!(report.failed_rows, 1);
        assert_eq!(ctx.ledger.error_count(), 1);
        assert!(ctx.ledger.last_secondary_sync().is_none());
        assert!(!ctx.ledger.is_full_sync_running());
    }

    #[tokio::test]
    async fn test_primary_query_failure_is_an_error() {
        let (etl, ctx) = setup(500);
        ctx.primary.set_available(false);
        assert!(etl.run_now().await.is_err());
        assert_eq!(ctx.ledger.error_count(), 1);
        assert!(!ctx.ledger.is_full_sync_running());
    }

    #[tokio::test]
    async fn test_trigger_runs_loop() {
        let (etl, ctx) = setup(500);
        let etl = Arc::new(etl);
        ctx.primary.write_external(rec("x", 5));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&etl).run(rx));
        etl.trigger();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !ctx.secondary.contains("x") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
