// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-sync follower tracking and write gating for one shard.
//!
//! The leader of a shard keeps two lists:
//!
//! - **followers**: servers that acknowledged synchronous replication
//! - **failover candidates**: servers supervision may promote if we die
//!
//! Both live in one immutable [`FollowerSet`] behind an `Arc` that is swapped
//! atomically. The write path only ever clones the `Arc`, so it never waits
//! for a mutator.
//!
//! # Write Gate
//!
//! ```text
//!              quorum met + candidates persisted
//!   NoWriteAccess ─────────────────────────────▶ WriteAccess
//!        ▲                                            │
//!        └──── remove() below quorum, clear(), ───────┘
//!              take_over_leadership()
//! ```
//!
//! Opening the gate persists the candidate list first. If this leader dies
//! right after, supervision then promotes a server that really is in sync.
//!
//! # Locking
//!
//! Two locks, always taken in this order:
//!
//! 1. `mutation` (async mutex): serializes mutators and the gate transition,
//!    held across the coordination store round trip
//! 2. `snapshot` (sync rwlock): guards only the `Arc` swap, never held
//!    across an await
//!
//! Debug builds check that followers and candidates are set-equal whenever
//! the gate is open.

use crate::config::QuorumConfig;
use crate::coordination::{CoordinationStore, Operation, Precondition, ShardPaths, WriteOutcome};
use crate::error::{ReplicationError, Result};
use crate::job::AbortSignal;
use crate::metrics;
use crate::resilience::RetryConfig;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Followers and failover candidates of one shard, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowerSet {
    pub followers: Vec<String>,
    pub failover_candidates: Vec<String>,
}

impl FollowerSet {
    pub fn is_follower(&self, server_id: &str) -> bool {
        self.followers.iter().any(|f| f == server_id)
    }

    fn lists_equal_as_sets(&self) -> bool {
        let a: BTreeSet<&String> = self.followers.iter().collect();
        let b: BTreeSet<&String> = self.failover_candidates.iter().collect();
        a == b
    }
}

/// Answer to "may this shard accept a write right now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAccess {
    Allowed,
    /// Followers not established since (re)start.
    Startup,
    /// Not enough followers for the write concern.
    Forbidden,
    /// Quorum met, but the candidate list could not be persisted.
    Unavailable,
}

/// Follower bookkeeping and write gate for one shard.
pub struct FollowerQuorumTracker {
    server_id: String,
    shard: String,
    paths: ShardPaths,
    store: Arc<dyn CoordinationStore>,
    retry: RetryConfig,
    abort: AbortSignal,

    mutation: Mutex<()>,
    snapshot: RwLock<Arc<FollowerSet>>,
    can_write: AtomicBool,
    evaluated: AtomicBool,
    write_concern: AtomicUsize,
}

impl std::fmt::Debug for FollowerQuorumTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowerQuorumTracker")
            .field("shard", &self.shard)
            .field("set", &self.snapshot())
            .field("can_write", &self.can_write())
            .field("write_concern", &self.write_concern())
            .finish()
    }
}

impl FollowerQuorumTracker {
    pub fn new(
        server_id: impl Into<String>,
        shard: impl Into<String>,
        paths: ShardPaths,
        store: Arc<dyn CoordinationStore>,
        config: &QuorumConfig,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            shard: shard.into(),
            paths,
            store,
            retry: config.retry(),
            abort: AbortSignal::new(),
            mutation: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(FollowerSet::default())),
            can_write: AtomicBool::new(false),
            evaluated: AtomicBool::new(false),
            write_concern: AtomicUsize::new(1),
        }
    }

    pub fn with_write_concern(self, write_concern: usize) -> Self {
        self.write_concern.store(write_concern.max(1), Ordering::Release);
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Readers (lock-free apart from the Arc clone)
    // ═══════════════════════════════════════════════════════════════════════

    /// Current snapshot. Cheap; never blocks on a mutator's store round trip.
    pub fn snapshot(&self) -> Arc<FollowerSet> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn followers(&self) -> Vec<String> {
        self.snapshot().followers.clone()
    }

    pub fn failover_candidates(&self) -> Vec<String> {
        self.snapshot().failover_candidates.clone()
    }

    pub fn can_write(&self) -> bool {
        self.can_write.load(Ordering::Acquire)
    }

    pub fn write_concern(&self) -> usize {
        self.write_concern.load(Ordering::Acquire)
    }

    /// Change the write concern. Closes the gate if it is no longer met.
    ///
    /// Waits for any mutator in flight, so a gate being opened under the old
    /// concern is re-evaluated against the new one.
    pub async fn set_write_concern(&self, write_concern: usize) {
        let _guard = self.mutation.lock().await;
        self.write_concern.store(write_concern.max(1), Ordering::Release);
        if !self.quorum_met(&self.snapshot()) && self.can_write.swap(false, Ordering::AcqRel) {
            warn!(shard = %self.shard, write_concern, "Write concern raised above follower count, closing write gate");
        }
        self.publish_state();
    }

    fn quorum_met(&self, set: &FollowerSet) -> bool {
        set.followers.len() + 1 >= self.write_concern()
    }

    fn swap(&self, next: FollowerSet) {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(next);
    }

    fn publish_state(&self) {
        metrics::set_quorum_state(&self.shard, self.can_write(), self.snapshot().followers.len());
        self.check_invariant();
    }

    fn check_invariant(&self) {
        debug_assert!(
            !self.can_write() || self.snapshot().lists_equal_as_sets(),
            "write gate open while followers and failover candidates differ: {:?}",
            self.snapshot()
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Write gate
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether a write may be accepted now.
    ///
    /// When the quorum is met but the gate is still closed, this persists
    /// the follower list as the new candidate list and opens the gate.
    pub async fn allowed_to_write(&self) -> WriteAccess {
        if self.can_write() {
            return WriteAccess::Allowed;
        }
        if !self.evaluated.load(Ordering::Acquire) {
            return WriteAccess::Startup;
        }
        if !self.quorum_met(&self.snapshot()) {
            return WriteAccess::Forbidden;
        }

        let _guard = self.mutation.lock().await;
        // Another caller may have opened it while we waited.
        if self.can_write() {
            return WriteAccess::Allowed;
        }
        let current = self.snapshot();
        if !self.quorum_met(&current) {
            return WriteAccess::Forbidden;
        }
        match self.open_gate(&current).await {
            Ok(()) => WriteAccess::Allowed,
            Err(ReplicationError::NotLeader { .. }) => WriteAccess::Forbidden,
            Err(e) => {
                warn!(shard = %self.shard, error = %e, "Cannot persist failover candidates, shard unavailable for writes");
                WriteAccess::Unavailable
            }
        }
    }

    /// Persist `followers` as the candidate list, then open the gate.
    /// Caller holds `mutation`.
    async fn open_gate(&self, current: &FollowerSet) -> Result<()> {
        let next = FollowerSet {
            followers: current.followers.clone(),
            failover_candidates: current.followers.clone(),
        };
        self.persist(&next).await?;
        self.swap(next);
        self.can_write.store(true, Ordering::Release);
        info!(
            shard = %self.shard,
            followers = current.followers.len(),
            write_concern = self.write_concern(),
            "Write concern met, shard accepts writes"
        );
        self.publish_state();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Mutators
    // ═══════════════════════════════════════════════════════════════════════

    /// Register `server_id` as an in-sync follower.
    ///
    /// The in-memory addition stands even if persistence fails: the follower
    /// did catch up, only the advertised bookkeeping lags.
    pub async fn add(&self, server_id: &str) -> Result<()> {
        let _guard = self.mutation.lock().await;
        self.evaluated.store(true, Ordering::Release);

        let current = self.snapshot();
        if current.is_follower(server_id) {
            return Ok(());
        }

        let mut next = (*current).clone();
        next.followers.push(server_id.to_string());
        if !next.failover_candidates.iter().any(|c| c == server_id) {
            next.failover_candidates.push(server_id.to_string());
        }
        self.swap(next.clone());
        info!(shard = %self.shard, follower = %server_id, "Follower added");

        match self.persist(&next).await {
            Ok(()) => {
                if !self.can_write() && self.quorum_met(&next) {
                    if let Err(e) = self.open_gate(&next).await {
                        debug!(shard = %self.shard, error = %e, "Gate stays closed after add");
                    }
                }
            }
            Err(ReplicationError::NotLeader { .. }) => {
                debug!(shard = %self.shard, "Not plan leader, follower list not persisted");
            }
            Err(e) if e.is_cancellation() => {
                self.publish_state();
                return Err(e);
            }
            Err(e) => {
                warn!(shard = %self.shard, follower = %server_id, error = %e, "Persisting follower list failed, keeping follower");
            }
        }
        self.publish_state();
        Ok(())
    }

    /// Drop `server_id` from followers and candidates.
    ///
    /// Rolled back if persistence fails for any reason but `NotLeader`:
    /// advertising fewer followers than we think we have could let
    /// supervision promote a server that is behind.
    pub async fn remove(&self, server_id: &str) -> Result<()> {
        let _guard = self.mutation.lock().await;
        self.evaluated.store(true, Ordering::Release);

        let previous = self.snapshot();
        let listed = previous.is_follower(server_id)
            || previous.failover_candidates.iter().any(|c| c == server_id);
        if !listed {
            return Ok(());
        }

        let mut next = (*previous).clone();
        next.followers.retain(|f| f != server_id);
        next.failover_candidates.retain(|c| c != server_id);
        self.swap(next.clone());
        if !self.quorum_met(&next) && self.can_write.swap(false, Ordering::AcqRel) {
            warn!(
                shard = %self.shard,
                followers = next.followers.len(),
                write_concern = self.write_concern(),
                "Write concern no longer met, shard stops accepting writes"
            );
        }
        info!(shard = %self.shard, follower = %server_id, "Follower removed");

        let result = match self.persist(&next).await {
            Ok(()) => Ok(()),
            Err(ReplicationError::NotLeader { .. }) => {
                debug!(shard = %self.shard, "Not plan leader, removal not persisted");
                Ok(())
            }
            Err(e) => {
                // The gate stays closed even if `previous` met the quorum;
                // the next `allowed_to_write` reopens it.
                self.swap((*previous).clone());
                warn!(shard = %self.shard, follower = %server_id, error = %e, "Persisting removal failed, rolled back");
                Err(e)
            }
        };
        self.publish_state();
        result
    }

    /// Reset state after this server was promoted to leader.
    ///
    /// Nobody, ourselves included, is trusted to be in sync yet: the gate is
    /// closed and candidates come from the previous epoch's followers.
    pub async fn take_over_leadership(
        &self,
        previous_followers: &[String],
        real_insync_followers: Option<&[String]>,
    ) {
        let _guard = self.mutation.lock().await;

        let without_self = |list: &[String]| -> Vec<String> {
            let mut out: Vec<String> = Vec::with_capacity(list.len());
            for s in list {
                if *s != self.server_id && !out.contains(s) {
                    out.push(s.clone());
                }
            }
            out
        };

        let next = FollowerSet {
            followers: real_insync_followers.map(without_self).unwrap_or_default(),
            failover_candidates: without_self(previous_followers),
        };
        self.can_write.store(false, Ordering::Release);
        self.swap(next);
        self.evaluated.store(true, Ordering::Release);
        info!(shard = %self.shard, candidates = previous_followers.len(), "Took over leadership");
        self.publish_state();
    }

    /// Forget all followers and close the gate, as after a restart.
    pub async fn clear(&self) {
        let _guard = self.mutation.lock().await;
        self.can_write.store(false, Ordering::Release);
        self.evaluated.store(false, Ordering::Release);
        self.swap(FollowerSet::default());
        debug!(shard = %self.shard, "Follower info cleared");
        self.publish_state();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Persistence
    // ═══════════════════════════════════════════════════════════════════════

    /// Write `[self] + followers` and `[self] + candidates` to Current,
    /// conditional on us still being plan leader and Current not having
    /// moved since we read it.
    async fn persist(&self, set: &FollowerSet) -> Result<()> {
        let with_self = |list: &[String]| -> Value {
            let mut servers = Vec::with_capacity(list.len() + 1);
            servers.push(Value::String(self.server_id.clone()));
            servers.extend(list.iter().cloned().map(Value::String));
            Value::Array(servers)
        };
        let operations = vec![
            Operation::Set {
                path: self.paths.current_servers.clone(),
                value: with_self(&set.followers),
            },
            Operation::Set {
                path: self.paths.current_candidates.clone(),
                value: with_self(&set.failover_candidates),
            },
        ];
        let read_paths = [self.paths.plan_servers.clone(), self.paths.current_servers.clone()];

        let mut attempt = 0;
        loop {
            self.abort.check()?;
            attempt += 1;

            let values = match self.store.read(&read_paths).await {
                Ok(v) => v,
                Err(e) => {
                    metrics::record_quorum_persist(&self.shard, "error");
                    return Err(e);
                }
            };
            let plan = values.first().cloned().flatten();
            let current = values.get(1).cloned().flatten();

            let plan_leader = plan
                .as_ref()
                .and_then(|p| p.get(0))
                .and_then(Value::as_str);
            if plan_leader != Some(self.server_id.as_str()) {
                metrics::record_quorum_persist(&self.shard, "not_leader");
                return Err(ReplicationError::NotLeader {
                    shard: self.shard.clone(),
                });
            }

            let preconditions = [
                Precondition::unchanged(self.paths.plan_servers.clone(), plan),
                Precondition::unchanged(self.paths.current_servers.clone(), current),
            ];
            match self.store.write_transaction(&operations, &preconditions).await {
                Ok(WriteOutcome::Success) => {
                    metrics::record_quorum_persist(&self.shard, "success");
                    return Ok(());
                }
                Ok(WriteOutcome::PreconditionFailed) => {
                    if !self.retry.allows(attempt) {
                        metrics::record_quorum_persist(&self.shard, "precondition_failed");
                        warn!(shard = %self.shard, attempts = attempt, "Follower list CAS kept failing");
                        return Err(ReplicationError::PreconditionFailed(format!(
                            "{} after {attempt} attempts",
                            self.paths.current_servers
                        )));
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(shard = %self.shard, attempt, delay_ms = delay.as_millis() as u64, "Follower list CAS lost, retrying");
                    self.abort.sleep(delay).await?;
                }
                Err(e) => {
                    metrics::record_quorum_persist(&self.shard, "error");
                    return Err(e);
                }
            }
        }
    }
}
