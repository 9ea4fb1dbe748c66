//! Circuit breakers around store writes.
//!
//! When a store keeps failing, the sync processor should stop hammering it
//! and let the backlog sit in the queue until the store recovers. Each store
//! gets its own breaker built on the `recloser` crate.
//!
//! # States
//!
//! - **Closed**: Normal operation, writes pass through
//! - **Open**: Store unhealthy, writes fail fast without attempting
//! - **HalfOpen**: Probing recovery, a few writes allowed
//!
//! The breaker trips when more than half of the last `failure_threshold`
//! calls failed, stays open for `recovery_timeout`, then needs
//! `success_threshold` successful probes to close.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use typing_sync_engine::circuit_breaker::{StoreCircuits, CircuitConfig, CircuitError};
//! # async fn example() -> Result<(), CircuitError<String>> {
//! let circuits = StoreCircuits::new(CircuitConfig::default());
//!
//! match circuits.primary.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* written */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, keep batch queued */ }
//!     Err(CircuitError::Inner(e)) => { /* store error */ }
//! }
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fraction of failed calls in the closed window that trips the breaker.
const TRIP_ERROR_RATE: f32 = 0.5;

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Size of the closed-state call window.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successful probes in half-open state needed to close.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// How long the circuit stays open before probing (e.g., "30s").
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: String,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_recovery_timeout() -> String {
    "30s".to_string()
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

impl CircuitConfig {
    /// Wide window with fast recovery, for tests.
    pub fn testing() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: "50ms".to_string(),
        }
    }

    pub fn recovery_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.recovery_timeout).unwrap_or(Duration::from_secs(30))
    }
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    open_wait: Duration,
    /// Last rejection not yet followed by a successful call.
    rejected_at: Mutex<Option<Instant>>,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitConfig) -> Self {
        let open_wait = config.recovery_timeout_duration();
        let recloser = Recloser::custom()
            .error_rate(TRIP_ERROR_RATE)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(open_wait)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            open_wait,
            rejected_at: Mutex::new(None),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                *self.rejected_at.lock() = None;
                crate::metrics::record_circuit_call(&self.name, "success");
                debug!(circuit = %self.name, "Circuit call succeeded");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                *self.rejected_at.lock() = Some(Instant::now());
                crate::metrics::record_circuit_call(&self.name, "rejected");
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Failure rate (0.0 - 1.0) over the breaker's lifetime.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }

    /// Open as last observed: a call was rejected within the recovery
    /// window and no call has succeeded since. Once the window passes the
    /// breaker lets trial calls through again, so it no longer counts as open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        let rejected_at = *self.rejected_at.lock();
        rejected_at.is_some_and(|at| at.elapsed() < self.open_wait)
    }
}

/// One breaker per store.
pub struct StoreCircuits {
    /// Guards primary `batch_write`.
    pub primary: CircuitBreaker,
    /// Guards secondary `batch_write`.
    pub secondary: CircuitBreaker,
}

impl Default for StoreCircuits {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl StoreCircuits {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            primary: CircuitBreaker::new("primary_writes", &config),
            secondary: CircuitBreaker::new("secondary_writes", &config),
        }
    }

    pub fn metrics(&self) -> StoreCircuitMetrics {
        StoreCircuitMetrics {
            primary_total: self.primary.calls_total(),
            primary_failures: self.primary.failures(),
            primary_rejections: self.primary.rejections(),
            secondary_total: self.secondary.calls_total(),
            secondary_failures: self.secondary.failures(),
            secondary_rejections: self.secondary.rejections(),
        }
    }

    pub fn any_open(&self) -> bool {
        self.primary.is_open() || self.secondary.is_open()
    }
}

/// Counter snapshot of both store breakers.
#[derive(Debug, Clone, Default)]
pub struct StoreCircuitMetrics {
    pub primary_total: u64,
    pub primary_failures: u64,
    pub primary_rejections: u64,
    pub secondary_total: u64,
    pub secondary_failures: u64,
    pub secondary_rejections: u64,
}
