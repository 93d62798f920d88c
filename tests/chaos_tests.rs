// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the follower handles failures without panics,
//! deadlocks, leaked leader batches, or diverging data.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use follower_sync::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use follower_sync::config::TickStoreConfig;
use follower_sync::job::AbortSignal;
use follower_sync::storage::MemoryStorage;
use follower_sync::tick_store::{scope_for, TickStore};
use follower_sync::{
    EngineState, FollowerReplicator, HttpLeaderClient, InitialSyncEngine, LeaderClient, ReplicationError,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio::time::sleep;

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Local Storage Failures
// =============================================================================

/// Test: Lock timeouts within the retry budget are invisible to the sync
#[tokio::test]
async fn lock_timeouts_retried_transparently() {
    let leader = Arc::new(MockLeader::new());
    leader.add_collection("orders");
    leader.put_many("orders", "d", 300);
    let (core, storage) = follower(&leader);
    seed_from_leader(&storage, &leader, "orders").await;
    leader.put_many("orders", "new", 5);

    // test config allows two retries per call
    storage.inject_lock_timeouts(2);
    InitialSyncEngine::new(core).run(None).await.unwrap();

    assert_eq!(local_state(&storage, "orders").await, leader_state(&leader, "orders"));
}

/// Test: Persistent lock timeouts surface as a retryable error and the
/// leader batch is still released
#[tokio::test]
async fn lock_timeouts_exhausted_surface_and_release_batch() {
    let leader = Arc::new(MockLeader::new());
    leader.add_collection("orders");
    leader.put_many("orders", "d", 10);
    let (core, storage) = follower(&leader);

    storage.inject_lock_timeouts(10_000);
    let err = InitialSyncEngine::new(core).run(None).await.unwrap_err();
    assert!(matches!(err, ReplicationError::LockTimeout(_)), "got {err:?}");
    assert!(err.is_retryable());

    let leader_ref = leader.clone();
    eventually("batch release", move || leader_ref.batches_finished.load(Ordering::SeqCst) == 1).await;
}

// =============================================================================
// Leader Failures
// =============================================================================

/// Test: A failed fetch aborts the sync, and a rerun converges
#[tokio::test]
async fn transport_failure_mid_diff_then_rerun_converges() {
    let leader = Arc::new(MockLeader::new());
    leader.add_collection("orders");
    leader.put_many("orders", "d", 400);
    let (core, storage) = follower(&leader);
    seed_from_leader(&storage, &leader, "orders").await;
    leader.put_many("orders", "new", 20);
    leader.remove("orders", "d5");

    leader.fail_next(LeaderOp::RevisionDocuments, 1);
    let err = InitialSyncEngine::new(core).run(None).await.unwrap_err();
    assert!(err.is_retryable());

    let (core, _) = follower(&leader);
    let retry = follower_sync::SyncerCore::new(
        core.config().clone(),
        storage.clone(),
        leader.clone(),
        AbortSignal::new(),
    );
    InitialSyncEngine::new(Arc::new(retry)).run(None).await.unwrap();

    assert_eq!(local_state(&storage, "orders").await, leader_state(&leader, "orders"));
    let leader_ref = leader.clone();
    eventually("both batches released", move || {
        leader_ref.batches_finished.load(Ordering::SeqCst) == 2
    })
    .await;
}

/// Test: Losing the batch keepalive aborts the sync with BatchLost
#[tokio::test]
async fn keepalive_loss_aborts_with_batch_lost() {
    let leader = Arc::new(MockLeader::new());
    leader.add_collection("orders");
    leader.put_many("orders", "d", 50);
    leader.set_dump_page(5);
    leader.set_dump_delay(Duration::from_millis(30));
    leader.fail_next(LeaderOp::ExtendBatch, usize::MAX);

    let mut config = test_config();
    config.batch_keepalive_interval = "20ms".to_string();
    let (core, _storage) = follower_with(&leader, config, MemoryStorage::new());

    let started = Instant::now();
    let err = InitialSyncEngine::new(core).run(None).await.unwrap_err();

    assert!(matches!(err, ReplicationError::BatchLost(_)), "got {err:?}");
    assert!(!err.is_cancellation());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(leader.batch_extends.load(Ordering::SeqCst) >= 1);

    // no dump request outlives the batch
    let leader_ref = leader.clone();
    eventually("batch release", move || leader_ref.batches_finished.load(Ordering::SeqCst) == 1).await;
    let dumps = leader.dump_requests.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(leader.dump_requests.load(Ordering::SeqCst), dumps);
}

/// Test: The HTTP client reports an unreachable leader as retryable
#[tokio::test]
async fn unreachable_leader_is_retryable() {
    let mut config = test_config();
    config.endpoint = "http://127.0.0.1:1".to_string();
    let client = HttpLeaderClient::new(Arc::new(config), AbortSignal::new()).unwrap();

    let err = client.leader_info().await.unwrap_err();
    assert!(err.is_retryable(), "got {err:?}");
}

// =============================================================================
// Replicator Under Failure
// =============================================================================

/// Test: Initial sync failures at startup are retried until one succeeds
#[tokio::test]
async fn replicator_retries_initial_sync() {
    let leader = Arc::new(MockLeader::new());
    leader.add_collection("orders");
    leader.put_many("orders", "d", 30);
    leader.fail_next(LeaderOp::StartBatch, 2);
    let storage = Arc::new(MemoryStorage::new());
    let mut replicator = FollowerReplicator::new(test_config(), storage.clone(), leader.clone());

    replicator.start().await.unwrap();
    assert_eq!(replicator.wait_for(EngineState::Tailing).await, EngineState::Tailing);

    assert_eq!(replicator.status().initial_syncs, 3);
    assert!(replicator.last_error().is_some());
    assert_eq!(local_state(&storage, "orders").await, leader_state(&leader, "orders"));
    replicator.shutdown().await;
}

/// Test: Transient tailing failures back off without leaving Tailing
#[tokio::test]
async fn replicator_rides_out_tailing_failures() {
    let leader = Arc::new(MockLeader::new());
    leader.add_collection("orders");
    let storage = Arc::new(MemoryStorage::new());
    let mut replicator = FollowerReplicator::new(test_config(), storage.clone(), leader.clone());
    replicator.start().await.unwrap();
    replicator.wait_for(EngineState::Tailing).await;

    leader.fail_next(LeaderOp::TailWal, 5);
    leader.put_many("orders", "x", 40);

    let expected = leader_state(&leader, "orders");
    let target = leader.current_tick();
    let r = &replicator;
    eventually("tail to recover", move || r.status().applied_tick >= target).await;
    assert_eq!(local_state(&storage, "orders").await, expected);
    assert_eq!(replicator.state(), EngineState::Tailing);
    assert_eq!(replicator.status().resyncs, 0);

    replicator.shutdown().await;
    assert_eq!(replicator.state(), EngineState::Stopped);
}

/// Test: Shutdown during a slow dump completes promptly and releases the batch
#[tokio::test]
async fn shutdown_during_slow_dump() {
    let leader = Arc::new(MockLeader::new());
    leader.add_collection("orders");
    leader.put_many("orders", "d", 200);
    leader.set_dump_page(10);
    leader.set_dump_delay(Duration::from_millis(50));
    let mut replicator = FollowerReplicator::new(test_config(), Arc::new(MemoryStorage::new()), leader.clone());

    replicator.start().await.unwrap();
    let leader_ref = leader.clone();
    eventually("dump to start", move || leader_ref.dump_requests.load(Ordering::SeqCst) > 0).await;

    let started = Instant::now();
    replicator.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(replicator.state(), EngineState::Stopped);

    let leader_ref = leader.clone();
    eventually("batch release", move || leader_ref.batches_finished.load(Ordering::SeqCst) == 1).await;
}

// =============================================================================
// Tick Persistence
// =============================================================================

/// Test: Only flushed ticks survive a crash
#[tokio::test]
async fn tick_store_crash_recovery() {
    let dir = tempdir().unwrap();
    let config = TickStoreConfig {
        sqlite_path: dir.path().join("ticks.db").to_string_lossy().into_owned(),
        wal_mode: true,
    };
    let scope = scope_for("_system", None);

    {
        let store = TickStore::open(&config).await.unwrap();
        store.set(&scope, 1000).await;
        store.flush_dirty().await.unwrap();
        store.set(&scope, 2000).await;
        store.flush_dirty().await.unwrap();
        // Never flushed: lost in the crash
        store.set(&scope, 3000).await;
    }

    let store = TickStore::open(&config).await.unwrap();
    assert_eq!(store.get(&scope).await, Some(2000));
}

/// Test: Rapid tick updates coalesce into one write per scope
#[tokio::test]
async fn tick_store_rapid_updates() {
    let dir = tempdir().unwrap();
    let config = TickStoreConfig {
        sqlite_path: dir.path().join("ticks.db").to_string_lossy().into_owned(),
        wal_mode: true,
    };
    let store = TickStore::open(&config).await.unwrap();
    for tick in 0..1000 {
        store.set("_system", tick).await;
        store.set("_system/orders", tick * 2).await;
    }
    assert_eq!(store.flush_dirty().await.unwrap(), 2);
    assert_eq!(store.get("_system").await, Some(999));
    assert_eq!(store.get("_system/orders").await, Some(1998));
}

/// Test: A restarted replicator resumes from its stored tick without a new
/// initial sync
#[tokio::test]
async fn replicator_resumes_from_stored_tick() {
    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.tick_store = TickStoreConfig {
        sqlite_path: dir.path().join("ticks.db").to_string_lossy().into_owned(),
        wal_mode: true,
    };
    let leader = Arc::new(MockLeader::new());
    leader.add_collection("orders");
    leader.put_many("orders", "d", 20);
    let storage = Arc::new(MemoryStorage::new());

    let mut first = FollowerReplicator::new(config.clone(), storage.clone(), leader.clone());
    first.start().await.unwrap();
    first.wait_for(EngineState::Tailing).await;
    first.shutdown().await;

    leader.put_many("orders", "offline", 15);

    let mut second = FollowerReplicator::new(config, storage.clone(), leader.clone());
    second.start().await.unwrap();
    let target = leader.current_tick();
    let r = &second;
    eventually("resumed tailing", move || r.status().applied_tick >= target).await;

    assert_eq!(second.status().initial_syncs, 0);
    assert_eq!(leader.batches_started.load(Ordering::SeqCst), 1);
    assert_eq!(local_state(&storage, "orders").await, leader_state(&leader, "orders"));
    second.shutdown().await;
}

// =============================================================================
// Circuit Breaker Stress Tests
// =============================================================================

/// Test: An open breaker stops calls from reaching a failing leader
#[tokio::test]
async fn circuit_breaker_prevents_cascade() {
    let calls = Arc::new(AtomicU32::new(0));
    let circuit = CircuitBreaker::new("cascade-test", CircuitConfig::testing());

    for _ in 0..10 {
        let calls = calls.clone();
        let _: Result<(), CircuitError<&str>> = circuit
            .call(|| async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Err("leader down")
            })
            .await;
    }

    assert!(calls.load(Ordering::Relaxed) < 10);
    assert!(circuit.rejections() > 0);

    // recovers once the leader answers again
    sleep(Duration::from_millis(60)).await;
    let result: Result<u32, CircuitError<&str>> = circuit.call(|| async { Ok(7) }).await;
    assert_eq!(result.ok(), Some(7));
}

/// Test: Concurrent callers share one breaker safely
#[tokio::test]
async fn circuit_breaker_concurrent_access() {
    use tokio::task::JoinSet;

    let circuit = Arc::new(CircuitBreaker::new("concurrent", CircuitConfig::lenient()));
    let successes = Arc::new(AtomicU32::new(0));
    let mut tasks = JoinSet::new();

    for _ in 0..100 {
        let c = circuit.clone();
        let s = successes.clone();
        tasks.spawn(async move {
            let result: Result<(), CircuitError<&str>> = c.call(|| async { Ok(()) }).await;
            if result.is_ok() {
                s.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
    while tasks.join_next().await.is_some() {}

    assert_eq!(successes.load(Ordering::Relaxed), 100);
    assert_eq!(circuit.calls_total(), 100);
}
