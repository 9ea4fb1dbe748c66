//! Change-capture bridge: primary-store changes back into the queue.
//!
//! Records written to the primary store by any client (not only this
//! engine) arrive here as change events and are re-enqueued so the
//! secondary store eventually mirrors them.
//!
//! # Echo Suppression
//!
//! Every write the processor makes to the primary store comes back as an
//! event. Those echoes are dropped when the content digest matches what
//! the secondary store already holds; anything still in flight is absorbed
//! by the queue (same key, same hash → `Unchanged`).
//!
//! # Resume
//!
//! The token of the last handled event is kept in memory, on the status
//! ledger and in the checkpoint journal. After a stream error the bridge
//! waits `reconnect_delay` and resubscribes after that token, so no event
//! is applied twice. A token the store no longer recognises is dropped: the
//! bridge schedules an ETL catch-up for the gap and resubscribes at the head.

use super::SyncContext;
use crate::checkpoint::{CheckpointStore, PRIMARY_STREAM};
use crate::config::ChangeCaptureConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::queue::EnqueueOutcome;
use crate::resilience::RateLimiter;
use crate::status::SyncStage;
use crate::store::{ChangeEvent, ChangeStream, PrimaryStore, ResumeToken, SecondaryStore};
use crate::stream::calculate_lag_ms;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify, RwLock};
use tracing::{debug, info, warn};

/// What the bridge did with one change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Queued for the secondary store.
    Enqueued(EnqueueOutcome),
    /// Our own write coming back; the secondary already has it.
    Echo,
    /// Delete, or no document attached.
    Ignored,
}

impl EventOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            EventOutcome::Enqueued(EnqueueOutcome::Unchanged) => "unchanged",
            EventOutcome::Enqueued(_) => "enqueued",
            EventOutcome::Echo => "echo",
            EventOutcome::Ignored => "ignored",
        }
    }
}

/// Why a subscription ended.
enum StreamEnd {
    Shutdown,
    Error(SyncError),
    Closed,
}

/// Consumes the primary store's change stream.
pub struct ChangeCaptureBridge<P: PrimaryStore, S: SecondaryStore> {
    config: ChangeCaptureConfig,
    ctx: SyncContext<P, S>,
    checkpoint: Arc<RwLock<Option<CheckpointStore>>>,
    etl_trigger: Arc<Notify>,
    token: Mutex<Option<ResumeToken>>,
    rate_limiter: Option<RateLimiter>,
    subscriptions: AtomicU64,
}

impl<P: PrimaryStore, S: SecondaryStore> ChangeCaptureBridge<P, S> {
    pub fn new(
        config: ChangeCaptureConfig,
        ctx: SyncContext<P, S>,
        checkpoint: Arc<RwLock<Option<CheckpointStore>>>,
        etl_trigger: Arc<Notify>,
    ) -> Self {
        let rate_limiter = config.rate_limit_config().map(RateLimiter::new);
        Self {
            config,
            ctx,
            checkpoint,
            etl_trigger,
            token: Mutex::new(None),
            rate_limiter,
            subscriptions: AtomicU64::new(0),
        }
    }

    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.token.lock().clone()
    }

    /// Seed the token, e.g. from the checkpoint journal at startup.
    pub fn set_resume_token(&self, token: Option<ResumeToken>) {
        self.ctx
            .ledger
            .set_resume_token(token.as_ref().map(|t| t.to_string()));
        *self.token.lock() = token;
    }

    /// Number of successful subscribes so far.
    pub fn subscription_count(&self) -> u64 {
        self.subscriptions.load(Ordering::Relaxed)
    }

    /// Open a change stream after the current token. An invalid token is
    /// dropped, an ETL catch-up is requested, and the stream opens at the
    /// head instead.
    pub async fn subscribe(&self) -> Result<ChangeStream> {
        let token = self.resume_token();
        let stream = match self.ctx.primary.watch(token.clone()).await {
            Ok(stream) => stream,
            Err(SyncError::ResumeTokenInvalid { token: stale }) => {
                warn!(token = %stale, "Resume token no longer valid, scheduling full sync");
                metrics::record_change_stream_reconnect("token_invalid");
                self.ctx.ledger.push_error(
                    SyncStage::ChangeCapture,
                    format!("Resume token {} invalid, full sync scheduled", stale),
                );
                self.set_resume_token(None);
                if let Some(ref store) = *self.checkpoint.read().await {
                    store.clear_token(PRIMARY_STREAM).await;
                }
                self.etl_trigger.notify_one();
                self.ctx.primary.watch(None).await?
            }
            Err(e) => return Err(e),
        };

        self.subscriptions.fetch_add(1, Ordering::Relaxed);
        info!(resume_after = ?token.as_ref().map(|t| t.as_str()), "Subscribed to change stream");
        Ok(stream)
    }

    /// Apply one change event and advance the token.
    pub async fn handle_event(&self, event: ChangeEvent) -> EventOutcome {
        if let Some(ref limiter) = self.rate_limiter {
            limiter.acquire().await;
        }

        let ChangeEvent {
            op,
            key,
            full_document,
            resume_token,
        } = event;

        let outcome = match full_document {
            Some(doc) if op.carries_document() => {
                if self.ctx.digests.is_current(&key, &doc.content_hash()) {
                    EventOutcome::Echo
                } else {
                    let queued = self.ctx.queue.enqueue(doc);
                    self.ctx.ledger.set_pending(self.ctx.queue.size());
                    EventOutcome::Enqueued(queued)
                }
            }
            _ => {
                if !op.carries_document() {
                    self.ctx.digests.forget(&key);
                }
                EventOutcome::Ignored
            }
        };

        debug!(op = op.as_str(), key = %key, outcome = outcome.label(), "Change event");
        metrics::record_change_event(outcome.label());
        // Only stream-ID tokens carry a timestamp.
        let head = format!("{}-0", Utc::now().timestamp_millis().max(0));
        if let Some(lag_ms) = calculate_lag_ms(resume_token.as_str(), &head) {
            metrics::record_change_lag_ms(lag_ms);
        }

        self.advance_token(resume_token).await;
        outcome
    }

    async fn advance_token(&self, token: ResumeToken) {
        if let Some(ref store) = *self.checkpoint.read().await {
            store.set_token(PRIMARY_STREAM, token.as_str()).await;
        }
        self.set_resume_token(Some(token));
    }

    /// Consume one subscription until it ends.
    async fn pump(&self, stream: &mut ChangeStream, shutdown_rx: &mut watch::Receiver<bool>) -> StreamEnd {
        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        return StreamEnd::Shutdown;
                    }
                }

                next = stream.recv() => match next {
                    Some(Ok(event)) => {
                        self.handle_event(event).await;
                    }
                    Some(Err(e)) => return StreamEnd::Error(e),
                    None => return StreamEnd::Closed,
                }
            }
        }
    }

    /// Sleep `reconnect_delay`. Returns false if shutdown arrived first.
    async fn backoff(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        if *shutdown_rx.borrow() {
            return false;
        }
        tokio::select! {
            biased;
            result = shutdown_rx.changed() => result.is_ok() && !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(self.config.reconnect_delay_duration()) => true,
        }
    }

    /// Subscribe, consume, resubscribe on failure. Runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            reconnect_delay_ms = self.config.reconnect_delay_duration().as_millis() as u64,
            rate_limited = self.rate_limiter.is_some(),
            "Change capture started"
        );

        while !*shutdown_rx.borrow() {
            let mut stream = match self.subscribe().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Change stream subscribe failed");
                    metrics::record_change_stream_reconnect("subscribe_failed");
                    self.ctx
                        .ledger
                        .push_error(SyncStage::ChangeCapture, format!("Change stream subscribe failed: {}", e));
                    if !self.backoff(&mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
            };

            match self.pump(&mut stream, &mut shutdown_rx).await {
                StreamEnd::Shutdown => break,
                StreamEnd::Error(e) => {
                    warn!(error = %e, "Change stream failed, resubscribing");
                    metrics::record_change_stream_reconnect("stream_error");
                    self.ctx
                        .ledger
                        .push_error(SyncStage::ChangeCapture, format!("Change stream error: {}", e));
                }
                StreamEnd::Closed => {
                    info!("Change stream closed, resubscribing");
                    metrics::record_change_stream_reconnect("closed");
                }
            }

            if !self.backoff(&mut shutdown_rx).await {
                break;
            }
        }

        info!("Change capture stopped");
    }
}
