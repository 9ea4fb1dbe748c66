//! Engine state and response types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (tasks spawned)
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!
//! Starting ──(checkpoint cannot be opened)──→ Failed
//! ```
//!
//! - **Created**: after `SyncEngine::new()`. `submit` already works; records
//!   wait in the queue.
//! - **Starting**: checkpoint replay and store connects in progress.
//! - **Running**: processor, bridge, ETL, health and flush tasks active.
//! - **ShuttingDown**: tasks signalled, final checkpoint flush pending.
//! - **Stopped**: safe to drop.
//! - **Failed**: start aborted. Check logs.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`SyncEngine`](super::SyncEngine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "Created",
            EngineState::Starting => "Starting",
            EngineState::Running => "Running",
            EngineState::ShuttingDown => "ShuttingDown",
            EngineState::Stopped => "Stopped",
            EngineState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply to [`SyncEngine::submit`](super::SyncEngine::submit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
    /// Idempotency key of the accepted record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SubmitResponse {
    pub fn accepted(id: impl Into<String>) -> Self {
        Self {
            success: true,
            id: Some(id.into()),
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            id: None,
            message: Some(message.into()),
        }
    }
}

/// Health snapshot for monitoring endpoints.
///
/// Built from cached state only; no store round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running and the primary store is reachable.
    pub ready: bool,
    /// Ready, secondary reachable, and no write circuit open.
    pub healthy: bool,
    pub primary_connected: bool,
    pub secondary_connected: bool,
    pub pending_items: usize,
    pub failed_items: usize,
    pub circuit_open: bool,
    pub full_sync_running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        for (state, name) in [
            (EngineState::Created, "Created"),
            (EngineState::Starting, "Starting"),
            (EngineState::Running, "Running"),
            (EngineState::ShuttingDown, "ShuttingDown"),
            (EngineState::Stopped, "Stopped"),
            (EngineState::Failed, "Failed"),
        ] {
            assert_eq!(state.to_string(), name);
            assert_eq!(format!("{:?}", state), name);
        }
    }

    #[test]
    fn test_engine_state_serializes_as_name() {
        assert_eq!(serde_json::to_string(&EngineState::Running).unwrap(), "\"Running\"");
        let parsed: EngineState = serde_json::from_str("\"Stopped\"").unwrap();
        assert_eq!(parsed, EngineState::Stopped);
    }

    #[test]
    fn test_submit_response_shape() {
        let ok = SubmitResponse::accepted("a1");
        assert_eq!(serde_json::to_value(&ok).unwrap(), serde_json::json!({"success": true, "id": "a1"}));

        let err = SubmitResponse::rejected("keyCount must be >= 0");
        assert!(!err.success);
        assert!(err.id.is_none());
        assert_eq!(err.message.as_deref(), Some("keyCount must be >= 0"));
    }
}
