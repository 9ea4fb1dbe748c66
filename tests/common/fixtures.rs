//! Engine fixtures over the in-process stores.

use chrono::{DateTime, TimeZone, Utc};
use std::future::Future;
use std::time::Duration;
use typing_sync_engine::{Record, SubmitRecord, SyncConfig, SyncEngine};

/// Config with every periodic task disabled: tests drive cycles by hand.
pub fn manual_config() -> SyncConfig {
    let mut config = SyncConfig::for_testing();
    config.settings.processor.enabled = false;
    config.settings.change_capture.enabled = false;
    config.settings.etl.enabled = false;
    config.settings.health.enabled = false;
    config
}

/// Engine that has not been started, with no background tasks.
pub fn manual_engine() -> SyncEngine {
    SyncEngine::in_memory(manual_config())
}

pub fn submit(key: &str, key_count: i64, typing_time: f64) -> SubmitRecord {
    SubmitRecord::new(key_count, typing_time).with_key(key)
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// A record as another client would write it straight to the primary.
pub fn external_record(key: &str, key_count: i64, secs: i64) -> Record {
    SubmitRecord::new(key_count, 10.0)
        .with_key(key)
        .with_timestamp(at(secs))
        .into_record(Utc::now())
        .unwrap()
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Async variant of [`wait_until`].
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition().await
}
