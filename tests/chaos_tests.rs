// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures gracefully without panics,
//! deadlocks, or data loss.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use chrono::Utc;
use common::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::sleep;
use typing_sync_engine::checkpoint::PRIMARY_STREAM;
use typing_sync_engine::{
    circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError},
    stream::maybe_decompress,
    CheckpointStore, CycleOutcome, QueueItem, Record, SyncConfig, SyncEngine,
};

// =============================================================================
// Corrupted Data Handling
// =============================================================================

/// Test: Corrupted zstd data doesn't panic
#[tokio::test]
async fn corrupted_zstd_no_panic() {
    let corrupted_payloads: &[&[u8]] = &[
        // Just magic header, no content
        &[0x28, 0xB5, 0x2F, 0xFD],
        // Magic header with garbage
        &[0x28, 0xB5, 0x2F, 0xFD, 0x00, 0x00, 0x00, 0x00],
        &[0x28, 0xB5, 0x2F, 0xFD, 0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE],
        // Truncated frame header
        &[0x28, 0xB5, 0x2F, 0xFD, 0x20],
    ];

    for (i, payload) in corrupted_payloads.iter().enumerate() {
        let result = maybe_decompress(payload);
        assert!(result.is_err(), "Corrupted payload {} should return error, got Ok", i);
    }
}

/// Test: A change document that is not a record is an error, not a panic
#[tokio::test]
async fn garbage_documents_rejected() {
    let documents: &[&[u8]] = &[
        b"",
        b"{",
        b"null",
        b"{\"idempotencyKey\": 5}",
        b"{\"idempotencyKey\":\"k\",\"keyCount\":-1,\"typingTime\":1.0}",
        &[0xFF, 0xFE, 0x00],
    ];

    for doc in documents {
        let decoded = maybe_decompress(doc).unwrap();
        assert!(Record::from_slice(&decoded).is_err());
    }
}

// =============================================================================
// Checkpoint Crash Recovery
// =============================================================================

/// Test: Token recovery after crash
///
/// Simulates a crash by not flushing, then verifies we recover from the
/// last persisted position.
#[tokio::test]
async fn checkpoint_token_crash_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("checkpoint.db");

    {
        let store = CheckpointStore::open(&db_path).await.unwrap();
        store.set_token(PRIMARY_STREAM, "1000-0").await;
        store.flush_dirty().await.unwrap();
        store.set_token(PRIMARY_STREAM, "2000-0").await;
        store.flush_dirty().await.unwrap();

        // Never flushed.
        store.set_token(PRIMARY_STREAM, "3000-0").await;
    }

    let store = CheckpointStore::open(&db_path).await.unwrap();
    assert_eq!(store.get_token(PRIMARY_STREAM).await, Some("2000-0".to_string()));
}

/// Test: Rapid token updates coalesce into one write
#[tokio::test]
async fn checkpoint_rapid_updates() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::open(dir.path().join("checkpoint.db")).await.unwrap();

    for i in 0..1000 {
        store.set_token(PRIMARY_STREAM, &format!("{}-0", i)).await;
    }
    assert_eq!(store.dirty_count().await, 1);
    store.flush_dirty().await.unwrap();

    assert_eq!(store.get_token(PRIMARY_STREAM).await, Some("999-0".to_string()));
    assert!(!store.has_dirty().await);
}

/// Test: An unreadable journal row is skipped, the rest replays
#[tokio::test]
async fn checkpoint_corrupted_row_skipped() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("checkpoint.db");

    {
        let store = CheckpointStore::open(&db_path).await.unwrap();
        let items: Vec<QueueItem> = ["a", "b", "c"]
            .iter()
            .map(|k| QueueItem::new(submit(k, 1, 1.0).into_record(Utc::now()).unwrap(), Utc::now()))
            .collect();
        store.save_pending(&items).await.unwrap();
        store.close().await;
    }

    {
        let url = format!("sqlite://{}", db_path.display());
        let pool = sqlx::SqlitePool::connect(&url).await.unwrap();
        sqlx::query("UPDATE pending_records SET payload = '{broken' WHERE idempotency_key = 'b'")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
    }

    let store = CheckpointStore::open(&db_path).await.unwrap();
    let loaded = store.load_pending().await.unwrap();
    let keys: Vec<&str> = loaded.iter().map(|i| i.key()).collect();
    assert_eq!(keys, vec!["a", "c"]);
}

// =============================================================================
// Circuit Breaker Stress Tests
// =============================================================================

/// Test: Circuit breaker stops calling a store that keeps failing
#[tokio::test]
async fn circuit_breaker_prevents_cascade() {
    let call_count = Arc::new(AtomicU32::new(0));
    let circuit = CircuitBreaker::new(
        "cascade-test",
        &CircuitConfig {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: "100ms".to_string(),
        },
    );

    for _ in 0..20 {
        let cc = call_count.clone();
        let _: Result<(), CircuitError<&str>> = circuit
            .call(|| async move {
                cc.fetch_add(1, Ordering::Relaxed);
                Err("simulated failure")
            })
            .await;
    }

    assert!(call_count.load(Ordering::Relaxed) < 20, "circuit never opened");
    assert!(circuit.rejections() > 0);

    sleep(Duration::from_millis(150)).await;

    let result: Result<(), CircuitError<&str>> = circuit.call(|| async { Ok(()) }).await;
    assert!(result.is_ok());
}

/// Test: Concurrent circuit breaker access
#[tokio::test]
async fn circuit_breaker_concurrent_access() {
    use tokio::task::JoinSet;

    let circuit = Arc::new(CircuitBreaker::new(
        "concurrent",
        &CircuitConfig {
            failure_threshold: 100,
            success_threshold: 1,
            recovery_timeout: "60s".to_string(),
        },
    ));

    let mut tasks = JoinSet::new();
    let success_count = Arc::new(AtomicU32::new(0));

    for _ in 0..100 {
        let c = circuit.clone();
        let sc = success_count.clone();
        tasks.spawn(async move {
            let result: Result<(), CircuitError<&str>> = c.call(|| async { Ok(()) }).await;
            if result.is_ok() {
                sc.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    while let Some(r) = tasks.join_next().await {
        r.unwrap();
    }

    assert_eq!(success_count.load(Ordering::Relaxed), 100);
}

// =============================================================================
// Store Outages
// =============================================================================

/// Test: A flapping primary loses nothing
#[tokio::test]
async fn primary_flapping_loses_nothing() {
    let engine = manual_engine();

    for i in 0..30 {
        engine.submit(submit(&format!("flap{}", i), i, 1.0));
        engine.primary().set_available(i % 2 == 0);
        engine.run_sync_cycle().await;
    }

    engine.primary().set_available(true);
    // Let a primary circuit that may have tripped go half-open.
    sleep(Duration::from_millis(100)).await;
    for _ in 0..5 {
        engine.run_sync_cycle().await;
    }

    assert!(engine.queue().is_empty());
    assert_eq!(engine.primary().len(), 30);
    assert_eq!(engine.secondary().len(), 30);
    assert!(engine.get_sync_status().failed_items.is_empty());
}

/// Test: Rejected rows are retried alone when partial retry is on
#[tokio::test]
async fn secondary_partial_failure_retries_only_bad_rows() {
    let mut config = manual_config();
    config.settings.processor.partial_retry = true;
    let engine = SyncEngine::in_memory(config);

    for key in ["good1", "bad", "good2"] {
        engine.submit(submit(key, 1, 1.0));
    }
    engine.secondary().fail_keys(["bad"]);

    let outcome = engine.run_sync_cycle().await;
    assert_eq!(
        outcome,
        CycleOutcome::SecondaryFailed {
            batch: 3,
            failed_rows: 1,
            restored: 1
        }
    );
    assert!(engine.secondary().contains("good1"));
    assert!(engine.secondary().contains("good2"));
    assert_eq!(engine.queue().size(), 1);
    assert!(engine.queue().contains("bad"));

    engine.secondary().clear_failing_keys();
    assert_eq!(engine.run_sync_cycle().await, CycleOutcome::Completed { written: 1 });
    assert_eq!(engine.secondary().len(), 3);
}

/// Test: Many threads submitting at once
#[tokio::test]
async fn concurrent_submitters() {
    let engine = manual_engine();

    std::thread::scope(|scope| {
        for t in 0..8 {
            let engine = &engine;
            scope.spawn(move || {
                for i in 0..100 {
                    assert!(engine.submit(submit(&format!("t{}-{}", t, i), i, 1.0)).success);
                }
            });
        }
    });
    assert_eq!(engine.queue().size(), 800);

    while engine.run_sync_cycle().await.is_completed() {}
    assert_eq!(engine.secondary().len(), 800);
}

// =============================================================================
// Change Stream Disruption
// =============================================================================

/// Test: Subscriptions dropped over and over still deliver every change
#[tokio::test]
async fn watcher_disconnect_storm() {
    let mut engine = SyncEngine::in_memory(SyncConfig::for_testing());
    engine.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || engine.primary().watcher_count() > 0).await);

    for i in 0..40 {
        engine
            .primary()
            .write_external(external_record(&format!("storm{}", i), i, 1_000 + i));
        if i % 5 == 0 {
            engine.primary().disconnect_watchers();
        }
        if i % 13 == 0 {
            engine.primary().set_available(false);
            sleep(Duration::from_millis(20)).await;
            engine.primary().set_available(true);
        }
    }

    assert!(
        wait_until(Duration::from_secs(5), || engine.secondary().len() == 40).await,
        "only {} of 40 mirrored",
        engine.secondary().len()
    );

    engine.shutdown().await;
}

// =============================================================================
// Stream ID Stress Tests
// =============================================================================

/// Test: Stream ID comparison with extreme values
#[tokio::test]
async fn stream_id_extreme_values() {
    use std::cmp::Ordering;
    use typing_sync_engine::stream::compare_stream_ids;

    assert_eq!(compare_stream_ids("0-0", "0-0"), Ordering::Equal);
    assert_eq!(compare_stream_ids("0-0", "0-1"), Ordering::Less);

    let max_ts = "9999999999999999-0";
    assert_eq!(compare_stream_ids("0-0", max_ts), Ordering::Less);
    assert_eq!(compare_stream_ids(max_ts, "0-0"), Ordering::Greater);

    // Malformed IDs (should not panic)
    let _ = compare_stream_ids("", "0-0");
    let _ = compare_stream_ids("abc", "0-0");
    let _ = compare_stream_ids("0-0", "not-a-number");
    let _ = compare_stream_ids("0-0-0", "0-0");
}

/// Test: Parallel decompression doesn't race
#[tokio::test]
async fn parallel_decompress_no_race() {
    use tokio::task::JoinSet;

    let original: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
    let compressed = zstd::encode_all(&original[..], 3).unwrap();

    let mut tasks = JoinSet::new();
    let success_count = Arc::new(AtomicU32::new(0));

    for _ in 0..50 {
        let data = compressed.clone();
        let expected = original.clone();
        let sc = success_count.clone();

        tasks.spawn(async move {
            if let Ok(decompressed) = maybe_decompress(&data) {
                if decompressed == expected {
                    sc.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    }

    while let Some(r) = tasks.join_next().await {
        r.unwrap();
    }

    assert_eq!(success_count.load(Ordering::Relaxed), 50);
}
