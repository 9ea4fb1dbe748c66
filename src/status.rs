//! Process-wide sync status and the failed-item ledger.
//!
//! [`StatusLedger`] is the only place the periodic jobs report progress to.
//! Readers get a consistent, serializable [`SyncStatus`] snapshot via
//! [`StatusLedger::snapshot()`], which is what the UI collaborator polls.

use crate::engine::EngineState;
use crate::metrics;
use crate::record::Record;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A record whose primary-store write failed, kept for manual retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub data: Record,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Which part of the pipeline produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Primary,
    Secondary,
    ChangeCapture,
    Etl,
    Health,
    Checkpoint,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::Primary => "primary",
            SyncStage::Secondary => "secondary",
            SyncStage::ChangeCapture => "change_capture",
            SyncStage::Etl => "etl",
            SyncStage::Health => "health",
            SyncStage::Checkpoint => "checkpoint",
        }
    }
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the recent-errors ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorEntry {
    pub stage: SyncStage,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Where the sync processor currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorPhase {
    #[default]
    Idle,
    Draining,
    WritingPrimary,
    WritingSecondary,
}

/// Read-only snapshot of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub last_primary_sync: Option<DateTime<Utc>>,
    pub last_secondary_sync: Option<DateTime<Utc>>,
    pub last_full_sync: Option<DateTime<Utc>>,
    pub pending_items_count: usize,
    pub failed_items: Vec<FailedItem>,
    pub sync_errors: Vec<SyncErrorEntry>,
    pub is_full_sync_running: bool,
    pub primary_connected: bool,
    pub secondary_connected: bool,
    pub processor_phase: ProcessorPhase,
    pub resume_token: Option<String>,
    pub engine_state: EngineState,
}

#[derive(Debug, Default)]
struct LedgerInner {
    last_primary_sync: Option<DateTime<Utc>>,
    last_secondary_sync: Option<DateTime<Utc>>,
    last_full_sync: Option<DateTime<Utc>>,
    pending_items_count: usize,
    failed_items: Vec<FailedItem>,
    sync_errors: VecDeque<SyncErrorEntry>,
    is_full_sync_running: bool,
    primary_connected: bool,
    secondary_connected: bool,
    processor_phase: ProcessorPhase,
    resume_token: Option<String>,
}

/// Mutable status shared by the processor, bridge, ETL and health jobs.
#[derive(Debug)]
pub struct StatusLedger {
    inner: Mutex<LedgerInner>,
    max_sync_errors: usize,
}

impl StatusLedger {
    pub fn new(max_sync_errors: usize) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            max_sync_errors: max_sync_errors.max(1),
        }
    }

    pub fn record_primary_sync(&self, at: DateTime<Utc>) {
        self.inner.lock().last_primary_sync = Some(at);
    }

    pub fn record_secondary_sync(&self, at: DateTime<Utc>) {
        self.inner.lock().last_secondary_sync = Some(at);
    }

    pub fn record_full_sync(&self, at: DateTime<Utc>) {
        self.inner.lock().last_full_sync = Some(at);
    }

    pub fn last_secondary_sync(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_secondary_sync
    }

    /// Add a failed record. A later failure for the same key replaces the
    /// earlier entry.
    pub fn add_failed(&self, data: Record, error: &str, at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        let item = FailedItem {
            data,
            error: error.to_string(),
            timestamp: at,
        };
        match inner
            .failed_items
            .iter_mut()
            .find(|f| f.data.idempotency_key == item.data.idempotency_key)
        {
            Some(existing) => *existing = item,
            None => inner.failed_items.push(item),
        }
        metrics::set_failed_items(inner.failed_items.len());
    }

    /// Swap in a newer version of a failed key, so a manual retry never
    /// resurrects an older payload. Returns true if the key was in the ledger.
    pub fn refresh_failed(&self, record: &Record) -> bool {
        let mut inner = self.inner.lock();
        match inner
            .failed_items
            .iter_mut()
            .find(|f| f.data.idempotency_key == record.idempotency_key)
        {
            Some(existing) => {
                existing.data = record.clone();
                true
            }
            None => false,
        }
    }

    /// Drop a key from the ledger, e.g. once it finally reached the primary store.
    pub fn clear_failed(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.failed_items.len();
        inner.failed_items.retain(|f| f.data.idempotency_key != key);
        metrics::set_failed_items(inner.failed_items.len());
        inner.failed_items.len() != before
    }

    /// Empty the ledger, returning its contents.
    pub fn take_failed(&self) -> Vec<FailedItem> {
        metrics::set_failed_items(0);
        std::mem::take(&mut self.inner.lock().failed_items)
    }

    pub fn failed_count(&self) -> usize {
        self.inner.lock().failed_items.len()
    }

    /// Append to the recent-errors ring, evicting the oldest entry when full.
    pub fn push_error(&self, stage: SyncStage, message: impl Into<String>) {
        metrics::record_sync_error(stage.as_str());
        let entry = SyncErrorEntry {
            stage,
            message: message.into(),
            timestamp: Utc::now(),
        };
        let mut inner = self.inner.lock();
        while inner.sync_errors.len() >= self.max_sync_errors {
            inner.sync_errors.pop_front();
        }
        inner.sync_errors.push_back(entry);
    }

    pub fn error_count(&self) -> usize {
        self.inner.lock().sync_errors.len()
    }

    pub fn set_pending(&self, count: usize) {
        self.inner.lock().pending_items_count = count;
    }

    pub fn set_primary_connected(&self, connected: bool) {
        self.inner.lock().primary_connected = connected;
    }

    pub fn set_secondary_connected(&self, connected: bool) {
        self.inner.lock().secondary_connected = connected;
    }

    /// Claim the full-sync slot. Returns false if a full sync already runs.
    pub fn try_begin_full_sync(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.is_full_sync_running {
            return false;
        }
        inner.is_full_sync_running = true;
        true
    }

    pub fn end_full_sync(&self) {
        self.inner.lock().is_full_sync_running = false;
    }

    pub fn is_full_sync_running(&self) -> bool {
        self.inner.lock().is_full_sync_running
    }

    pub fn set_phase(&self, phase: ProcessorPhase) {
        self.inner.lock().processor_phase = phase;
    }

    pub fn set_resume_token(&self, token: Option<String>) {
        self.inner.lock().resume_token = token;
    }

    pub fn snapshot(&self, engine_state: EngineState) -> SyncStatus {
        let inner = self.inner.lock();
        SyncStatus {
            last_primary_sync: inner.last_primary_sync,
            last_secondary_sync: inner.last_secondary_sync,
            last_full_sync: inner.last_full_sync,
            pending_items_count: inner.pending_items_count,
            failed_items: inner.failed_items.clone(),
            sync_errors: inner.sync_errors.iter().cloned().collect(),
            is_full_sync_running: inner.is_full_sync_running,
            primary_connected: inner.primary_connected,
            secondary_connected: inner.secondary_connected,
            processor_phase: inner.processor_phase,
            resume_token: inner.resume_token.clone(),
            engine_state,
        }
    }
}

impl Default for StatusLedger {
    fn default() -> Self {
        Self::new(50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SubmitRecord;

    fn record(key: &str, key_count: i64) -> Record {
        SubmitRecord::new(key_count, 1.0)
            .with_key(key)
            .into_record(Utc::now())
            .unwrap()
    }

    #[test]
    fn test_sync_errors_ring_is_capped() {
        let ledger = StatusLedger::new(3);
        for i in 0..5 {
            ledger.push_error(SyncStage::Secondary, format!("err {i}"));
        }
        let status = ledger.snapshot(EngineState::Running);
        let messages: Vec<_> = status.sync_errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["err 2", "err 3", "err 4"]);
    }

    #[test]
    fn test_failed_items_dedup_by_key() {
        let ledger = StatusLedger::default();
        ledger.add_failed(record("a1", 100), "timeout", Utc::now());
        ledger.add_failed(record("b", 1), "timeout", Utc::now());
        ledger.add_failed(record("a1", 150), "refused", Utc::now());

        assert_eq!(ledger.failed_count(), 2);
        let failed = ledger.take_failed();
        let a1 = failed.iter().find(|f| f.data.idempotency_key == "a1").unwrap();
        assert_eq!(a1.data.key_count, 150);
        assert_eq!(a1.error, "refused");
        assert_eq!(ledger.failed_count(), 0);
    }

    #[test]
    fn test_refresh_failed_swaps_payload() {
        let ledger = StatusLedger::default();
        assert!(!ledger.refresh_failed(&record("a1", 150)));
        ledger.add_failed(record("a1", 100), "timeout", Utc::now());

        assert!(ledger.refresh_failed(&record("a1", 150)));
        let failed = ledger.take_failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].data.key_count, 150);
        assert_eq!(failed[0].error, "timeout");
    }

    #[test]
    fn test_clear_failed() {
        let ledger = StatusLedger::default();
        ledger.add_failed(record("a1", 1), "x", Utc::now());
        assert!(ledger.clear_failed("a1"));
        assert!(!ledger.clear_failed("a1"));
    }

    #[test]
    fn test_full_sync_slot_is_exclusive() {
        let ledger = StatusLedger::default();
        assert!(ledger.try_begin_full_sync());
        assert!(!ledger.try_begin_full_sync());
        assert!(ledger.is_full_sync_running());
        ledger.end_full_sync();
        assert!(ledger.try_begin_full_sync());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let ledger = StatusLedger::default();
        ledger.set_pending(4);
        ledger.set_phase(ProcessorPhase::WritingPrimary);
        ledger.push_error(SyncStage::ChangeCapture, "stream closed");

        let json = serde_json::to_string(&ledger.snapshot(EngineState::Running)).unwrap();
        assert!(json.contains("\"pendingItemsCount\":4"));
        assert!(json.contains("\"isFullSyncRunning\":false"));
        assert!(json.contains("\"processorPhase\":\"writing_primary\""));
        assert!(json.contains("\"stage\":\"change_capture\""));
    }
}
