// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine.
//!
//! The orchestrator that ties together:
//! - the in-memory [`RecordQueue`](crate::queue::RecordQueue)
//! - the [`SyncProcessor`] dual-write loop
//! - the [`ChangeCaptureBridge`] re-feeding primary-store changes
//! - the [`EtlScheduler`] weekly catch-up
//! - the [`HealthSupervisor`] reconnect loop
//! - the [`CheckpointStore`] journal for the queue and the resume token
//!
//! # Lifecycle
//!
//! 1. `new()` builds every component; `submit()` already queues records
//! 2. `start()` opens the journal, replays it, connects stores (failures
//!    are logged, the health loop keeps retrying), spawns the periodic tasks
//! 3. `shutdown()` signals the tasks, waits for them, writes a final
//!    journal snapshot and closes it

mod types;
pub mod change_capture;
pub mod etl;
pub mod health;
pub mod processor;

pub use change_capture::{ChangeCaptureBridge, EventOutcome};
pub use etl::{EtlOutcome, EtlReport, EtlScheduler};
pub use health::{HealthSupervisor, ProbeReport};
pub use processor::{CycleOutcome, SkipReason, SyncProcessor};
pub use types::{EngineState, HealthCheck, SubmitResponse};

use crate::checkpoint::{CheckpointStore, PRIMARY_STREAM};
use crate::circuit_breaker::StoreCircuits;
use crate::config::SyncConfig;
use crate::digest::ContentDigests;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::queue::{EnqueueOutcome, RecordQueue};
use crate::record::SubmitRecord;
use crate::status::{StatusLedger, SyncStage, SyncStatus};
use crate::store::memory::{MemoryPrimaryStore, MemorySecondaryStore};
use crate::store::{PrimaryStore, ResumeToken, SecondaryStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};

/// How long `shutdown()` waits for each task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared handles every component works against.
pub struct SyncContext<P, S> {
    pub primary: Arc<P>,
    pub secondary: Arc<S>,
    pub queue: Arc<RecordQueue>,
    pub ledger: Arc<StatusLedger>,
    pub digests: Arc<ContentDigests>,
    pub circuits: Arc<StoreCircuits>,
}

impl<P, S> Clone for SyncContext<P, S> {
    fn clone(&self) -> Self {
        Self {
            primary: Arc::clone(&self.primary),
            secondary: Arc::clone(&self.secondary),
            queue: Arc::clone(&self.queue),
            ledger: Arc::clone(&self.ledger),
            digests: Arc::clone(&self.digests),
            circuits: Arc::clone(&self.circuits),
        }
    }
}

/// The typing-session sync engine.
///
/// Buffers submitted records, writes them to the primary store and then
/// the secondary store, mirrors changes made to the primary by other
/// clients, and repairs gaps with a periodic full catch-up.
pub struct SyncEngine<P: PrimaryStore = MemoryPrimaryStore, S: SecondaryStore = MemorySecondaryStore> {
    config: SyncConfig,

    ctx: SyncContext<P, S>,

    processor: Arc<SyncProcessor<P, S>>,
    bridge: Arc<ChangeCaptureBridge<P, S>>,
    etl: Arc<EtlScheduler<P, S>>,
    health: Arc<HealthSupervisor<P, S>>,

    /// Open while running with the journal enabled.
    checkpoint: Arc<RwLock<Option<CheckpointStore>>>,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl SyncEngine<MemoryPrimaryStore, MemorySecondaryStore> {
    /// Engine over in-process stores (tests, local development).
    pub fn in_memory(config: SyncConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryPrimaryStore::new()),
            Arc::new(MemorySecondaryStore::new()),
        )
    }
}

impl<P: PrimaryStore, S: SecondaryStore> SyncEngine<P, S> {
    /// Build the engine in `Created` state. Nothing connects until
    /// [`start()`](Self::start).
    pub fn new(config: SyncConfig, primary: Arc<P>, secondary: Arc<S>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = &config.settings;

        let ctx = SyncContext {
            primary,
            secondary,
            queue: Arc::new(RecordQueue::new()),
            ledger: Arc::new(StatusLedger::new(settings.max_sync_errors)),
            digests: Arc::new(ContentDigests::with_capacity(
                settings.change_capture.digest_capacity,
            )),
            circuits: Arc::new(StoreCircuits::new(settings.circuit.clone())),
        };

        let checkpoint = Arc::new(RwLock::new(None));
        let etl_trigger = Arc::new(Notify::new());

        Self {
            processor: Arc::new(SyncProcessor::new(settings.processor.clone(), ctx.clone())),
            bridge: Arc::new(ChangeCaptureBridge::new(
                settings.change_capture.clone(),
                ctx.clone(),
                Arc::clone(&checkpoint),
                Arc::clone(&etl_trigger),
            )),
            etl: Arc::new(EtlScheduler::new(settings.etl.clone(), ctx.clone(), etl_trigger)),
            health: Arc::new(HealthSupervisor::new(settings.health.clone(), ctx.clone())),
            checkpoint,
            ctx,
            config,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            handles: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn primary(&self) -> &Arc<P> {
        &self.ctx.primary
    }

    pub fn secondary(&self) -> &Arc<S> {
        &self.ctx.secondary
    }

    pub fn queue(&self) -> &Arc<RecordQueue> {
        &self.ctx.queue
    }

    pub fn circuits(&self) -> &Arc<StoreCircuits> {
        &self.ctx.circuits
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(state.as_str());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Producer / UI surface
    // ═══════════════════════════════════════════════════════════════════════

    /// Validate and queue a record. Works in every state; records wait in
    /// the queue until the processor runs.
    pub fn submit(&self, record: SubmitRecord) -> SubmitResponse {
        let record = match record.into_record(Utc::now()) {
            Ok(record) => record,
            Err(e) => {
                metrics::record_submit("rejected");
                debug!(error = %e, "Submit rejected");
                return SubmitResponse::rejected(e.to_string());
            }
        };

        let key = record.idempotency_key.clone();
        self.ctx.ledger.refresh_failed(&record);
        let outcome = self.ctx.queue.enqueue(record);
        self.ctx.ledger.set_pending(self.ctx.queue.size());
        metrics::record_submit(match outcome {
            EnqueueOutcome::Appended => "appended",
            EnqueueOutcome::Replaced => "replaced",
            EnqueueOutcome::Unchanged => "unchanged",
        });
        SubmitResponse::accepted(key)
    }

    /// Consistent snapshot of the pipeline.
    pub fn get_sync_status(&self) -> SyncStatus {
        self.ctx.ledger.set_pending(self.ctx.queue.size());
        self.ctx.ledger.snapshot(self.state())
    }

    /// Re-enqueue every failed item and clear the ledger.
    pub fn force_retry_failed_items(&self) -> usize {
        self.health.force_retry_failed_items()
    }

    /// Run a full catch-up now. Refused once shutdown has begun.
    pub async fn run_full_sync_now(&self) -> Result<EtlOutcome> {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return Err(SyncError::Shutdown);
        }
        self.etl.run_now().await
    }

    /// Run one processor cycle now (skipped if one is in flight).
    pub async fn run_sync_cycle(&self) -> CycleOutcome {
        self.processor.run_cycle().await
    }

    /// Probe both stores once.
    pub async fn check_health_now(&self) -> ProbeReport {
        self.health.check_once().await
    }

    /// Health for monitoring endpoints. No store I/O; cached state only.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let status = self.ctx.ledger.snapshot(state);
        let circuit_open = self.ctx.circuits.any_open();

        let ready = state == EngineState::Running && status.primary_connected;
        let healthy = ready && status.secondary_connected && !circuit_open;

        HealthCheck {
            state,
            ready,
            healthy,
            primary_connected: status.primary_connected,
            secondary_connected: status.secondary_connected,
            pending_items: self.ctx.queue.size(),
            failed_items: status.failed_items.len(),
            circuit_open,
            full_sync_running: status.is_full_sync_running,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Start the engine.
    ///
    /// 1. Opens the checkpoint journal (if enabled) and replays it
    /// 2. Connects both stores (non-fatal)
    /// 3. Spawns the processor, bridge, ETL, health and flush tasks
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(SyncError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            primary = %self.config.primary.url,
            secondary = %self.config.secondary.sqlite_path,
            "Starting sync engine"
        );
        self.set_state(EngineState::Starting);

        if self.config.checkpoint.enabled {
            if let Err(e) = self.open_checkpoint().await {
                warn!(error = %e, "Failed to open checkpoint journal");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        }

        self.connect_stores().await;

        let settings = self.config.settings.clone();
        if settings.processor.enabled {
            let processor = Arc::clone(&self.processor);
            let rx = self.shutdown_rx.clone();
            self.spawn(processor.run(rx).instrument(info_span!("sync_processor"))).await;
        }
        if settings.change_capture.enabled {
            let bridge = Arc::clone(&self.bridge);
            let rx = self.shutdown_rx.clone();
            self.spawn(bridge.run(rx).instrument(info_span!("change_capture"))).await;
        }
        if settings.etl.enabled {
            let etl = Arc::clone(&self.etl);
            let rx = self.shutdown_rx.clone();
            self.spawn(etl.run(rx).instrument(info_span!("etl"))).await;
        }
        if settings.health.enabled {
            let health = Arc::clone(&self.health);
            let rx = self.shutdown_rx.clone();
            self.spawn(health.run(rx).instrument(info_span!("health"))).await;
        }
        if self.checkpoint.read().await.is_some() {
            self.spawn_checkpoint_flush_task().await;
        }

        self.set_state(EngineState::Running);
        info!(
            pending = self.ctx.queue.size(),
            tasks = self.handles.read().await.len(),
            "Sync engine running"
        );
        Ok(())
    }

    async fn open_checkpoint(&self) -> Result<()> {
        let path = &self.config.checkpoint.sqlite_path;
        let store = CheckpointStore::open(path).await?;

        let items = store.load_pending().await?;
        let replayed = self.ctx.queue.replay(items);
        self.ctx.ledger.set_pending(self.ctx.queue.size());

        if let Some(token) = store.get_token(PRIMARY_STREAM).await {
            info!(token = %token, "Resuming change stream from journal");
            self.bridge.set_resume_token(Some(ResumeToken::new(token)));
        }

        info!(path = %path, replayed, "Checkpoint journal opened");
        *self.checkpoint.write().await = Some(store);
        Ok(())
    }

    async fn connect_stores(&self) {
        let timeout = self.config.settings.health.probe_timeout_duration();

        let primary = match tokio::time::timeout(timeout, self.ctx.primary.connect()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::timeout("primary.connect", timeout)),
        };
        if let Err(ref e) = primary {
            warn!(error = %e, "Primary store unavailable at start, will retry");
            self.ctx
                .ledger
                .push_error(SyncStage::Health, format!("Primary connect failed: {}", e));
        }

        let secondary = match tokio::time::timeout(timeout, self.ctx.secondary.connect()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::timeout("secondary.connect", timeout)),
        };
        if let Err(ref e) = secondary {
            warn!(error = %e, "Secondary store unavailable at start, will retry");
            self.ctx
                .ledger
                .push_error(SyncStage::Health, format!("Secondary connect failed: {}", e));
        }

        self.ctx.ledger.set_primary_connected(primary.is_ok());
        self.ctx.ledger.set_secondary_connected(secondary.is_ok());
        metrics::set_store_connected("primary", primary.is_ok());
        metrics::set_store_connected("secondary", secondary.is_ok());
    }

    async fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handles.write().await.push(tokio::spawn(task));
    }

    /// Periodically persist dirty tokens and, when the queue changed, a
    /// fresh pending snapshot.
    async fn spawn_checkpoint_flush_task(&self) {
        let checkpoint = Arc::clone(&self.checkpoint);
        let queue = Arc::clone(&self.ctx.queue);
        let ledger = Arc::clone(&self.ctx.ledger);
        let interval = self.config.checkpoint.flush_interval_duration();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let task = async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut saved_generation = None;

            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            debug!("Checkpoint flush task stopping");
                            break;
                        }
                    }

                    _ = timer.tick() => {
                        if let Some(ref store) = *checkpoint.read().await {
                            if let Err(e) = flush_checkpoint(store, &queue, &mut saved_generation).await {
                                warn!(error = %e, "Checkpoint flush failed");
                                ledger.push_error(SyncStage::Checkpoint, format!("Checkpoint flush failed: {}", e));
                            }
                        }
                    }
                }
            }
        };

        self.spawn(task.instrument(info_span!("checkpoint_flush"))).await;
    }

    /// Shut down gracefully.
    ///
    /// 1. Signal every task to stop
    /// 2. Wait for each (running cycles complete or time out)
    /// 3. Write a final journal snapshot and close it
    pub async fn shutdown(&mut self) {
        info!("Shutting down sync engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to complete");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        if let Some(store) = self.checkpoint.write().await.take() {
            if let Err(e) = flush_checkpoint(&store, &self.ctx.queue, &mut None).await {
                warn!(error = %e, "Final checkpoint flush failed");
            }
            store.close().await;
        }

        self.set_state(EngineState::Stopped);
        info!(pending = self.ctx.queue.size(), "Sync engine stopped");
    }
}

/// Flush dirty tokens; save the queue if it changed since `saved_generation`.
async fn flush_checkpoint(
    store: &CheckpointStore,
    queue: &RecordQueue,
    saved_generation: &mut Option<u64>,
) -> Result<()> {
    store.flush_dirty().await?;

    let generation = queue.generation();
    if *saved_generation != Some(generation) {
        store.save_pending(&queue.snapshot()).await?;
        *saved_generation = Some(generation);
    }
    Ok(())
}
