// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests against a real Redis primary store.
//!
//! Tests use testcontainers for portability - no external docker-compose required.
//!
//! # Running Tests
//! ```bash
//! # Run all integration tests (requires Docker)
//! cargo test --test integration -- --ignored
//!
//! # Run specific test
//! cargo test --test integration redis_watch -- --ignored
//! ```
//!
//! # Test Organization
//! - `redis_*` - Primary store writes, queries and change subscriptions
//! - `engine_*` - Full pipeline over Redis and SQLite

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::clients::Cli;
use typing_sync_engine::db::MEMORY_PATH;
use typing_sync_engine::store::{
    ChangeEvent, ChangeOp, ChangeStream, QueryOptions, RecordFilter, ResumeToken, SortOrder,
};
use typing_sync_engine::{
    PrimaryStore, RedisPrimaryStore, SecondaryStore, SqliteSecondaryStore, SyncConfig, SyncEngine,
    SyncError,
};

async fn connected_store(redis: &TestRedis<'_>) -> RedisPrimaryStore {
    let store = RedisPrimaryStore::new(redis.config.clone());
    store.connect().await.expect("Failed to connect");
    store
}

async fn next_event(rx: &mut ChangeStream) -> ChangeEvent {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("Timed out waiting for change event")
        .expect("Change stream closed")
        .expect("Change stream error")
}

// =============================================================================
// Primary Store Tests
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_connect_and_ping() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let store = connected_store(&redis).await;

    assert!(store.is_connected());
    let rtt = store.ping().await.expect("Ping failed");
    assert!(rtt < Duration::from_secs(1));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_batch_write_is_idempotent() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let store = connected_store(&redis).await;

    let a = external_record("a", 10, 100);
    let b = external_record("b", 20, 200);

    let first = store.batch_write(&[a.clone(), b.clone()]).await.unwrap();
    assert_eq!(first.inserted, 2);
    assert_eq!(first.matched, 0);

    let again = store.batch_write(&[a.clone(), b.clone()]).await.unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.matched, 2);
    assert_eq!(again.modified, 0);

    let mut changed = a.clone();
    changed.key_count = 11;
    let update = store.batch_write(&[changed, b]).await.unwrap();
    assert_eq!(update.matched, 2);
    assert_eq!(update.modified, 1);

    // Two inserts and one update; the no-op rewrites published nothing.
    assert_eq!(redis.stream_len().await.unwrap(), 3);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_query_by_event_time() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let store = connected_store(&redis).await;

    let records: Vec<_> = (0..6)
        .map(|i| external_record(&format!("q{}", i), i, 1_000 + i))
        .collect();
    store.batch_write(&records).await.unwrap();

    let after = store
        .query(RecordFilter::after(at(1_002)), QueryOptions::default())
        .await
        .unwrap();
    let keys: Vec<&str> = after.iter().map(|r| r.idempotency_key.as_str()).collect();
    assert_eq!(keys, vec!["q3", "q4", "q5"]);

    let newest = store
        .query(
            RecordFilter::default(),
            QueryOptions {
                sort: SortOrder::Descending,
                limit: 2,
            },
        )
        .await
        .unwrap();
    let keys: Vec<&str> = newest.iter().map(|r| r.idempotency_key.as_str()).collect();
    assert_eq!(keys, vec!["q5", "q4"]);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_records_expire_after_retention() {
    let docker = Cli::default();
    let mut redis = TestRedis::new(&docker);
    redis.config.retention_days = 2;
    let store = connected_store(&redis).await;

    store.batch_write(&[external_record("ttl", 1, 100)]).await.unwrap();

    let ttl = redis.record_ttl("ttl").await.unwrap();
    assert!(ttl > 0, "record has no expiry");
    assert!(ttl <= 2 * 24 * 3600);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_old_event_time_stays_queryable() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let store = connected_store(&redis).await;

    // Event time far outside retention, written just now.
    store.batch_write(&[external_record("vintage", 3, 60)]).await.unwrap();

    assert!(redis.is_indexed("vintage").await.unwrap());
    let found = store
        .query(RecordFilter::default(), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].idempotency_key, "vintage");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_expired_records_leave_the_index() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let store = connected_store(&redis).await;

    store
        .batch_write(&[external_record("stale", 1, 100), external_record("lapsed", 2, 200)])
        .await
        .unwrap();
    redis.expire_record("stale", 0).await.unwrap();
    redis.expire_record("lapsed", 0).await.unwrap();

    // A write prunes keys whose last write fell out of retention.
    store.batch_write(&[external_record("fresh", 3, 300)]).await.unwrap();
    assert!(!redis.is_indexed("stale").await.unwrap());
    assert!(!redis.is_indexed("lapsed").await.unwrap());
    assert!(redis.is_indexed("fresh").await.unwrap());

    let keys: Vec<String> = store
        .query(RecordFilter::default(), QueryOptions::default())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.idempotency_key)
        .collect();
    assert_eq!(keys, vec!["fresh".to_string()]);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_query_pages_past_expired_entries() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let store = connected_store(&redis).await;

    let records: Vec<_> = (0..6)
        .map(|i| external_record(&format!("p{}", i), i, 1_000 + i))
        .collect();
    store.batch_write(&records).await.unwrap();
    // Hashes gone, index entries still present.
    redis.expire_record("p0", i64::MAX / 2).await.unwrap();
    redis.expire_record("p1", i64::MAX / 2).await.unwrap();

    let found = store
        .query(
            RecordFilter::default(),
            QueryOptions {
                sort: SortOrder::Ascending,
                limit: 3,
            },
        )
        .await
        .unwrap();
    let keys: Vec<&str> = found.iter().map(|r| r.idempotency_key.as_str()).collect();
    assert_eq!(keys, vec!["p2", "p3", "p4"]);
    assert!(!redis.is_indexed("p0").await.unwrap());
}

// =============================================================================
// Change Subscription Tests
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_watch_from_head_sees_only_new_changes() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let store = connected_store(&redis).await;

    store.batch_write(&[external_record("before", 1, 100)]).await.unwrap();
    let mut rx = store.watch(None).await.unwrap();
    store.batch_write(&[external_record("after", 2, 200)]).await.unwrap();

    let event = next_event(&mut rx).await;
    assert_eq!(event.key, "after");
    assert_eq!(event.op, ChangeOp::Insert);
    assert_eq!(event.full_document.unwrap().key_count, 2);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_watch_resumes_after_token() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let store = connected_store(&redis).await;

    let mut rx = store.watch(None).await.unwrap();
    for (i, key) in ["r1", "r2", "r3"].iter().enumerate() {
        store.batch_write(&[external_record(key, i as i64, 100)]).await.unwrap();
    }
    let first = next_event(&mut rx).await;
    assert_eq!(first.key, "r1");
    drop(rx);

    let mut resumed = store.watch(Some(first.resume_token)).await.unwrap();
    assert_eq!(next_event(&mut resumed).await.key, "r2");
    assert_eq!(next_event(&mut resumed).await.key, "r3");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_trimmed_token_is_invalid() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let store = connected_store(&redis).await;

    let mut rx = store.watch(None).await.unwrap();
    for i in 0..5 {
        store
            .batch_write(&[external_record(&format!("t{}", i), i, 100)])
            .await
            .unwrap();
    }
    let stale = next_event(&mut rx).await.resume_token;
    drop(rx);

    redis.trim_stream(1).await.unwrap();

    match store.watch(Some(stale.clone())).await {
        Err(SyncError::ResumeTokenInvalid { token }) => assert_eq!(token, stale.to_string()),
        Err(e) => panic!("expected ResumeTokenInvalid, got {}", e),
        Ok(_) => panic!("expected ResumeTokenInvalid, got a stream"),
    }
    assert!(store.watch(Some(ResumeToken::new("not-a-token"))).await.is_err());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_unparsable_entries_are_skipped() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let store = connected_store(&redis).await;

    let mut rx = store.watch(None).await.unwrap();
    redis
        .add_raw_entry(&[("op", &b"insert"[..]), ("key", &b"junk"[..]), ("doc", &b"not json"[..])])
        .await
        .unwrap();
    redis
        .add_raw_entry(&[("op", &b"teleport"[..]), ("key", &b"junk"[..])])
        .await
        .unwrap();
    store.batch_write(&[external_record("valid", 1, 100)]).await.unwrap();

    assert_eq!(next_event(&mut rx).await.key, "valid");
}

// =============================================================================
// Full Pipeline Tests
// =============================================================================

fn engine_config(redis: &TestRedis<'_>) -> SyncConfig {
    let mut config = SyncConfig::for_testing();
    config.primary = redis.config.clone();
    config
}

#[tokio::test]
#[ignore] // Requires Docker
async fn engine_submit_reaches_redis_and_sqlite() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);

    let primary = Arc::new(RedisPrimaryStore::new(redis.config.clone()));
    let secondary = Arc::new(SqliteSecondaryStore::new(MEMORY_PATH, false));
    let mut engine = SyncEngine::new(engine_config(&redis), Arc::clone(&primary), Arc::clone(&secondary));
    engine.start().await.unwrap();

    assert!(engine.submit(submit("e2e", 120, 30.0)).success);

    let synced = wait_until_async(Duration::from_secs(5), || {
        let secondary = Arc::clone(&secondary);
        async move { matches!(secondary.get("e2e").await, Ok(Some(_))) }
    })
    .await;
    assert!(synced, "record never reached SQLite");

    let stored = primary
        .query(RecordFilter::default(), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].key_count, 120);
    assert_eq!(secondary.count().await.unwrap(), 1);

    let health = engine.health_check();
    assert!(health.primary_connected);
    assert!(health.secondary_connected);

    engine.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires Docker
async fn engine_mirrors_writes_from_other_clients() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);

    let secondary = Arc::new(SqliteSecondaryStore::new(MEMORY_PATH, false));
    let mut engine = SyncEngine::new(
        engine_config(&redis),
        Arc::new(RedisPrimaryStore::new(redis.config.clone())),
        Arc::clone(&secondary),
    );
    engine.start().await.unwrap();
    // Let the subscription reach the stream head.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let other = connected_store(&redis).await;
    other
        .batch_write(&[external_record("elsewhere", 7, 500)])
        .await
        .unwrap();

    let mirrored = wait_until_async(Duration::from_secs(5), || {
        let secondary = Arc::clone(&secondary);
        async move { matches!(secondary.get("elsewhere").await, Ok(Some(_))) }
    })
    .await;
    assert!(mirrored, "external write never reached SQLite");
    assert!(engine.get_sync_status().resume_token.is_some());

    engine.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires Docker
async fn engine_full_sync_backfills_sqlite() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);

    let seed = connected_store(&redis).await;
    let records: Vec<_> = (0..25)
        .map(|i| external_record(&format!("old{}", i), i, 10_000 + i))
        .collect();
    seed.batch_write(&records).await.unwrap();

    let secondary = Arc::new(SqliteSecondaryStore::new(MEMORY_PATH, false));
    let primary = Arc::new(RedisPrimaryStore::new(redis.config.clone()));
    let mut config = manual_config();
    config.primary = redis.config.clone();
    let engine = SyncEngine::new(config, Arc::clone(&primary), Arc::clone(&secondary));

    primary.connect().await.unwrap();
    secondary.connect().await.unwrap();
    engine.run_full_sync_now().await.unwrap();

    assert_eq!(secondary.count().await.unwrap(), 25);
    assert!(engine.get_sync_status().last_full_sync.is_some());
}
