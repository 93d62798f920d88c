//! Distributed coordination store seam.
//!
//! The quorum tracker persists the in-sync follower list through
//! [`CoordinationStore`]: a hierarchical key-value store with atomic
//! multi-key transactions guarded by preconditions. The real store lives
//! outside this crate; [`MemoryCoordinationStore`] is a faithful in-process
//! stand-in with failure injection for tests.

use crate::error::{ReplicationError, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Boxed future returned by [`CoordinationStore`] methods.
pub type CoordinationFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// A write inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Set { path: String, value: Value },
    Delete { path: String },
}

/// A condition the store must satisfy for a transaction to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    Equals { path: String, value: Value },
    Absent { path: String },
}

impl Precondition {
    /// `Equals` for a value that was read, `Absent` if nothing was there.
    pub fn unchanged(path: impl Into<String>, observed: Option<Value>) -> Self {
        let path = path.into();
        match observed {
            Some(value) => Self::Equals { path, value },
            None => Self::Absent { path },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Success,
    PreconditionFailed,
}

/// Read and conditional-write access to the coordination store.
pub trait CoordinationStore: Send + Sync + 'static {
    /// Values at `paths`, `None` where nothing is stored.
    fn read(&self, paths: &[String]) -> CoordinationFuture<'_, Vec<Option<Value>>>;

    /// Apply all `operations` atomically iff every precondition holds.
    fn write_transaction(
        &self,
        operations: &[Operation],
        preconditions: &[Precondition],
    ) -> CoordinationFuture<'_, WriteOutcome>;
}

/// Store paths for one shard's replication bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPaths {
    /// Plan servers list: `[leader, followers...]`.
    pub plan_servers: String,
    /// Current servers list reported by the leader.
    pub current_servers: String,
    /// Current failover candidates reported by the leader.
    pub current_candidates: String,
}

impl ShardPaths {
    pub fn new(database: &str, collection_id: &str, shard: &str) -> Self {
        Self {
            plan_servers: format!("Plan/Collections/{database}/{collection_id}/shards/{shard}"),
            current_servers: format!("Current/Collections/{database}/{collection_id}/{shard}/servers"),
            current_candidates: format!(
                "Current/Collections/{database}/{collection_id}/{shard}/failoverCandidates"
            ),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process [`CoordinationStore`] with CAS semantics.
#[derive(Debug, Default)]
pub struct MemoryCoordinationStore {
    data: Mutex<BTreeMap<String, Value>>,
    writes: AtomicU64,
    precondition_failures: AtomicU64,
    injected_contention: AtomicUsize,
    injected_failures: AtomicUsize,
    write_delay_ms: AtomicU64,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, path: &str, value: Value) {
        self.data.lock().await.insert(path.to_string(), value);
    }

    pub async fn get(&self, path: &str) -> Option<Value> {
        self.data.lock().await.get(path).cloned()
    }

    /// The next `n` transactions report `PreconditionFailed` as if another
    /// writer got in first.
    pub fn inject_contention(&self, n: usize) {
        self.injected_contention.store(n, Ordering::SeqCst);
    }

    /// The next `n` calls fail with a transport error.
    pub fn inject_failures(&self, n: usize) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    /// Every write transaction takes at least `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Successful transactions so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn precondition_failures(&self) -> u64 {
        self.precondition_failures.load(Ordering::Relaxed)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn fail_if_injected(&self) -> Result<()> {
        if Self::take(&self.injected_failures) {
            return Err(ReplicationError::transport("coordination", "injected failure"));
        }
        Ok(())
    }
}

impl CoordinationStore for MemoryCoordinationStore {
    fn read(&self, paths: &[String]) -> CoordinationFuture<'_, Vec<Option<Value>>> {
        let paths = paths.to_vec();
        Box::pin(async move {
            self.fail_if_injected()?;
            let data = self.data.lock().await;
            Ok(paths.iter().map(|p| data.get(p).cloned()).collect())
        })
    }

    fn write_transaction(
        &self,
        operations: &[Operation],
        preconditions: &[Precondition],
    ) -> CoordinationFuture<'_, WriteOutcome> {
        let operations = operations.to_vec();
        let preconditions = preconditions.to_vec();
        Box::pin(async move {
            let delay = self.write_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.fail_if_injected()?;
            let mut data = self.data.lock().await;

            let holds = preconditions.iter().all(|p| match p {
                Precondition::Equals { path, value } => data.get(path) == Some(value),
                Precondition::Absent { path } => !data.contains_key(path),
            });
            if !holds || Self::take(&self.injected_contention) {
                self.precondition_failures.fetch_add(1, Ordering::Relaxed);
                return Ok(WriteOutcome::PreconditionFailed);
            }

            for op in operations {
                match op {
                    Operation::Set { path, value } => {
                        data.insert(path, value);
                    }
                    Operation::Delete { path } => {
                        data.remove(&path);
                    }
                }
            }
            self.writes.fetch_add(1, Ordering::Relaxed);
            Ok(WriteOutcome::Success)
        })
    }
}
