//! Health supervisor: reconnect loop and manual retry of failed items.

use super::SyncContext;
use crate::config::HealthConfig;
use crate::error::SyncError;
use crate::metrics;
use crate::status::SyncStage;
use crate::store::{PrimaryStore, SecondaryStore};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Result of one probe round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub primary_connected: bool,
    pub secondary_connected: bool,
    /// A reconnect was attempted this round.
    pub reconnected: bool,
}

pub struct HealthSupervisor<P: PrimaryStore, S: SecondaryStore> {
    config: HealthConfig,
    ctx: SyncContext<P, S>,
}

impl<P: PrimaryStore, S: SecondaryStore> HealthSupervisor<P, S> {
    pub fn new(config: HealthConfig, ctx: SyncContext<P, S>) -> Self {
        Self { config, ctx }
    }

    /// Probe both stores once. Never fails: outcomes go to the ledger and
    /// the log.
    pub async fn check_once(&self) -> ProbeReport {
        let timeout = self.config.probe_timeout_duration();
        let primary = &self.ctx.primary;

        let reconnected = !primary.is_connected();
        let primary_result = if reconnected {
            debug!("Primary store marked down, reconnecting");
            match tokio::time::timeout(timeout, primary.connect()).await {
                Ok(result) => result.map(|_| None),
                Err(_) => Err(SyncError::timeout("primary.connect", timeout)),
            }
        } else {
            match tokio::time::timeout(timeout, primary.ping()).await {
                Ok(result) => result.map(Some),
                Err(_) => Err(SyncError::timeout("primary.ping", timeout)),
            }
        };

        let primary_connected = match primary_result {
            Ok(latency) => {
                if let Some(latency) = latency {
                    metrics::record_store_ping("primary", latency);
                }
                if reconnected {
                    info!("Primary store reconnected");
                }
                true
            }
            Err(e) => {
                warn!(error = %e, reconnect = reconnected, "Primary store probe failed");
                self.ctx
                    .ledger
                    .push_error(SyncStage::Health, format!("Primary store unreachable: {}", e));
                false
            }
        };

        let secondary = &self.ctx.secondary;
        let secondary_connected = match tokio::time::timeout(timeout, secondary.test_connection()).await {
            Ok(true) => true,
            Ok(false) | Err(_) => {
                // One reconnect attempt; SQLite pools reopen cheaply.
                let reopened = matches!(
                    tokio::time::timeout(timeout, secondary.connect()).await,
                    Ok(Ok(()))
                );
                if !reopened {
                    warn!("Secondary store unreachable");
                    self.ctx
                        .ledger
                        .push_error(SyncStage::Health, "Secondary store unreachable");
                }
                reopened
            }
        };

        self.ctx.ledger.set_primary_connected(primary_connected);
        self.ctx.ledger.set_secondary_connected(secondary_connected);
        metrics::set_store_connected("primary", primary_connected);
        metrics::set_store_connected("secondary", secondary_connected);

        ProbeReport {
            primary_connected,
            secondary_connected,
            reconnected,
        }
    }

    /// Move every failed item back into the queue and clear the ledger.
    /// Keys that are already queued keep their queued version, which is
    /// never older than the failed one. Returns how many entries were
    /// retried.
    pub fn force_retry_failed_items(&self) -> usize {
        let items = self.ctx.ledger.take_failed();
        let count = items.len();
        let mut already_queued = 0;
        for item in items {
            if self.ctx.queue.contains(&item.data.idempotency_key) {
                already_queued += 1;
                continue;
            }
            self.ctx.queue.enqueue(item.data);
        }
        self.ctx.ledger.set_pending(self.ctx.queue.size());
        if count > 0 {
            info!(count, already_queued, "Failed items re-enqueued");
        }
        count
    }

    /// Probe loop. Runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.config.check_interval_duration();
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = interval.as_secs(), "Health supervisor started");

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = timer.tick() => {
                    self.check_once().await;
                }
            }
        }

        info!("Health supervisor stopped");
    }
}
