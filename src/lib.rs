//! # Typing Sync Engine
//!
//! Background engine that keeps typing-session records consistent across a
//! primary operational store and a secondary analytical store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            typing-sync-engine                            │
//! │                                                                          │
//! │  submit() ──► ┌─────────────┐ drain ┌───────────────┐                    │
//! │               │ RecordQueue │──────►│ SyncProcessor │──► Primary (Redis) │
//! │        ┌─────►│ (latest     │       │ (3s, batch 50)│──► Secondary       │
//! │        │      │  wins/key)  │       └───────────────┘    (SQLite)        │
//! │        │      └─────────────┘                                 ▲          │
//! │  ┌─────┴──────────────┐   change events         ┌─────────────┴──────┐   │
//! │  │ ChangeCaptureBridge│◄──── Primary ─────────► │ EtlScheduler       │   │
//! │  │ (resume token)     │                         │ (weekly catch-up)  │   │
//! │  └────────────────────┘                         └────────────────────┘   │
//! │                                                                          │
//! │  HealthSupervisor (reconnect)      CheckpointStore (queue + token)       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! 1. **Primary first**: a record leaves the queue only after both stores
//!    accepted it; a primary failure keeps it queued and records it as a
//!    failed item.
//! 2. **Idempotent**: both stores upsert by `idempotency_key`, so retries and
//!    replays never create a second row.
//! 3. **Repair**: whatever the streaming path misses, the ETL catch-up
//!    re-exports from the primary store.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use typing_sync_engine::{SubmitRecord, SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut engine = SyncEngine::in_memory(SyncConfig::default());
//!     engine.start().await.expect("Failed to start");
//!
//!     let response = engine.submit(SubmitRecord::new(120, 30.0).with_key("a1"));
//!     assert!(response.success);
//!
//!     engine.shutdown().await;
//! }
//! ```

pub mod checkpoint;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod digest;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod record;
pub mod resilience;
pub mod status;
pub mod store;
pub mod stream;

// Re-exports for convenience
pub use checkpoint::CheckpointStore;
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, StoreCircuits};
pub use config::{
    ChangeCaptureConfig, CheckpointConfig, EtlConfig, HealthConfig, PrimaryStoreConfig,
    ProcessorConfig, SecondaryStoreConfig, SyncConfig, SyncSettings,
};
pub use engine::{
    CycleOutcome, EngineState, EtlOutcome, EtlReport, HealthCheck, SubmitResponse, SyncEngine,
};
pub use error::{Result, SyncError};
pub use queue::{EnqueueOutcome, QueueItem, RecordQueue};
pub use record::{Record, SubmitMetadata, SubmitRecord};
pub use status::{FailedItem, SyncErrorEntry, SyncStage, SyncStatus};
pub use store::memory::{MemoryPrimaryStore, MemorySecondaryStore};
pub use store::redis::RedisPrimaryStore;
pub use store::sqlite::SqliteSecondaryStore;
pub use store::{PrimaryStore, SecondaryStore};
