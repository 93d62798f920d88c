//! Metrics for observability.
//!
//! Exposes Prometheus-compatible metrics through the `metrics` facade for:
//! - Leader request latency and outcome
//! - Documents moved by dumps, diffs and tailing
//! - Initial sync phases and duration
//! - Tailing position and lag
//! - Quorum gate state and persistence outcome
//! - Leader batch lifecycle, circuit breakers, tick store flushes
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track durations in seconds
//!
//! No recorder is installed here; the embedding process decides where the
//! numbers go.

use crate::circuit_breaker::CircuitState;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one leader HTTP request.
pub fn record_leader_request(endpoint: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_leader_requests_total", "endpoint" => endpoint.to_string(), "status" => status).increment(1);
    histogram!("replication_leader_request_duration_seconds", "endpoint" => endpoint.to_string())
        .record(duration.as_secs_f64());
}

/// Record a transport retry against the leader.
pub fn record_leader_retry(endpoint: &str) {
    counter!("replication_leader_retries_total", "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_documents_inserted(collection: &str, count: u64) {
    counter!("replication_documents_inserted_total", "collection" => collection.to_string()).increment(count);
}

pub fn record_documents_removed(collection: &str, count: u64) {
    counter!("replication_documents_removed_total", "collection" => collection.to_string()).increment(count);
}

/// Documents requested from the leader by revision or key.
pub fn record_documents_fetched(collection: &str, count: u64) {
    counter!("replication_documents_fetched_total", "collection" => collection.to_string()).increment(count);
}

/// Number of differing ranges found by a revision tree comparison.
pub fn record_diff_ranges(collection: &str, ranges: usize) {
    histogram!("replication_diff_ranges", "collection" => collection.to_string()).record(ranges as f64);
}

/// A unique constraint conflict was resolved by removing the local document.
pub fn record_conflict_resolution(collection: &str) {
    counter!("replication_conflict_resolutions_total", "collection" => collection.to_string()).increment(1);
}

/// Document count on disk disagreed with the expected count after a diff.
pub fn record_count_mismatch(collection: &str) {
    counter!("replication_count_mismatches_total", "collection" => collection.to_string()).increment(1);
}

/// Gauge for the current initial sync phase (0=validate, 1=drop_create, 2=dump).
pub fn set_sync_phase(phase: &str) {
    let value = match phase {
        "validate" => 0.0,
        "drop_create" => 1.0,
        "dump" => 2.0,
        _ => -1.0,
    };
    gauge!("replication_sync_phase").set(value);
}

/// Record how one collection was brought in sync.
pub fn record_collection_synced(collection: &str, strategy: &str, duration: Duration) {
    counter!(
        "replication_collections_synced_total",
        "collection" => collection.to_string(),
        "strategy" => strategy.to_string()
    )
    .increment(1);
    histogram!("replication_collection_sync_duration_seconds", "strategy" => strategy.to_string())
        .record(duration.as_secs_f64());
}

/// Record a complete initial sync run.
pub fn record_initial_sync(success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_initial_syncs_total", "status" => status).increment(1);
    histogram!("replication_initial_sync_duration_seconds").record(duration.as_secs_f64());
}

/// Last WAL tick applied by tailing.
pub fn set_tailing_tick(tick: u64) {
    gauge!("replication_tailing_tick").set(tick as f64);
}

/// How many ticks the leader is ahead of us.
pub fn set_tailing_lag(lag_ticks: u64) {
    gauge!("replication_tailing_lag_ticks").set(lag_ticks as f64);
}

pub fn record_markers_applied(count: usize) {
    counter!("replication_markers_applied_total").increment(count as u64);
}

/// Markers ignored because their collection is out of scope.
pub fn record_markers_skipped(count: usize) {
    counter!("replication_markers_skipped_total").increment(count as u64);
}

/// Automatic or requested re-run of the initial sync.
pub fn record_resync(reason: &str) {
    counter!("replication_resyncs_total", "reason" => reason.to_string()).increment(1);
}

/// Gauge for the write-concern gate of one shard (1=can write).
pub fn set_quorum_state(shard: &str, can_write: bool, followers: usize) {
    gauge!("replication_quorum_can_write", "shard" => shard.to_string()).set(if can_write { 1.0 } else { 0.0 });
    gauge!("replication_quorum_followers", "shard" => shard.to_string()).set(followers as f64);
}

/// Outcome of persisting the follower list: success, not_leader, precondition_failed, error.
pub fn record_quorum_persist(shard: &str, outcome: &str) {
    counter!(
        "replication_quorum_persists_total",
        "shard" => shard.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Leader batch events: start, extend, extend_failed, finish, finish_failed.
pub fn record_batch_event(event: &str) {
    counter!("replication_leader_batch_events_total", "event" => event.to_string()).increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn record_circuit_state(circuit: &str, state: CircuitState) {
    gauge!("replication_circuit_state", "circuit" => circuit.to_string()).set(state as i32 as f64);
}

/// Record a tick store flush (debounced writes).
pub fn record_tick_store_flush(flushed: usize, errors: usize) {
    counter!("replication_tick_store_flushes_total").increment(1);
    counter!("replication_tick_store_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("replication_tick_store_flush_errors_total").increment(errors as u64);
    }
}

/// SQLite busy/locked retry in the tick store.
pub fn tick_store_retries_total(operation: &str) {
    counter!("replication_tick_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Gauge for the follower coordinator state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "InitialSync" => 1.0,
        "Tailing" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replication_state").set(value);
}
