// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Initial synchronization of a whole database.
//!
//! Everything happens inside one leader batch, a snapshot the leader keeps
//! alive for us. The batch pins the WAL tick that tailing continues from.
//!
//! # Phases
//!
//! ```text
//! start_batch ──▶ leader_info ──▶ inventory
//!                                    │
//!     Validate (all) ◀───────────────┘     nothing has been touched yet
//!        │
//!        ├─▶ group 1: system collections (_analyzers first)   DropCreate + Dump
//!        ├─▶ group 2: arangosearch views                      DropCreate
//!        ├─▶ group 3: remaining collections                   DropCreate + Dump
//!        └─▶ group 4: search-alias views                      DropCreate
//!                                    │
//!                              finish_batch (exactly once, on every path)
//! ```
//!
//! Per collection, Dump either diffs (incremental mode, local collection not
//! empty) or streams a raw dump. Indexes are created after the documents.
//!
//! # Keep-alive
//!
//! A background task extends the batch every `batch_keepalive_interval`. If
//! an extend fails the batch is as good as gone: the task aborts the run,
//! which then fails with [`ReplicationError::BatchLost`].

use crate::apply_batch::ApplyStats;
use crate::diff::{RevisionDiffEngine, SyncStrategy};
use crate::error::{ReplicationError, Result};
use crate::job::{AbortSignal, JobSlot};
use crate::leader::{DumpChunk, Inventory, InventoryCollection, LeaderBatch, LeaderClient};
use crate::metrics;
use crate::storage::{LocalCollection, ViewSpec, ViewType};
use crate::syncer::{DocumentOp, ObjectRef, SyncerCore};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

const ANALYZERS_COLLECTION: &str = "_analyzers";

/// Initial sync phase, reported through metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Validate,
    DropCreate,
    Dump,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::DropCreate => "drop_create",
            Self::Dump => "dump",
        }
    }
}

/// How one collection was synced.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionReport {
    pub name: String,
    pub strategy: SyncStrategy,
    pub stats: ApplyStats,
    /// Document count after the sync.
    pub documents: u64,
    pub duration: Duration,
}

/// Result of a complete initial sync.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialSyncReport {
    pub batch_id: String,
    /// Tick the batch was pinned at; tailing starts here.
    pub last_tick: u64,
    pub collections: Vec<CollectionReport>,
    pub views: usize,
    /// Local collections and views dropped because the leader has none.
    pub dropped: usize,
    pub duration: Duration,
}

impl InitialSyncReport {
    pub fn collection(&self, name: &str) -> Option<&CollectionReport> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn total_stats(&self) -> ApplyStats {
        let mut total = ApplyStats::default();
        for c in &self.collections {
            total += c.stats;
        }
        total
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sync plan
// ═══════════════════════════════════════════════════════════════════════════════

/// Inventory split into the groups synced in order.
#[derive(Debug, Clone, Default)]
struct SyncPlan {
    system: Vec<InventoryCollection>,
    search_views: Vec<ViewSpec>,
    collections: Vec<InventoryCollection>,
    alias_views: Vec<ViewSpec>,
}

impl SyncPlan {
    /// Validate the inventory and order it. Fails before anything local is
    /// modified.
    fn build(inventory: Inventory, core: &SyncerCore) -> Result<Self> {
        let mut plan = Self::default();
        let mut names = HashSet::new();

        for entry in inventory.collections {
            let spec = &entry.parameters;
            if spec.name.is_empty() {
                return Err(ReplicationError::protocol(format!(
                    "inventory collection {} has no name",
                    spec.id
                )));
            }
            if spec.id.is_empty() && spec.guid.is_empty() {
                return Err(ReplicationError::protocol(format!(
                    "inventory collection {} has neither id nor globally unique id",
                    spec.name
                )));
            }
            if !names.insert(spec.name.clone()) {
                return Err(ReplicationError::protocol(format!(
                    "inventory lists collection {} twice",
                    spec.name
                )));
            }
            if spec.deleted || core.is_excluded(&spec.name) {
                debug!(collection = %spec.name, "Skipping collection");
                continue;
            }
            if spec.is_system {
                plan.system.push(entry);
            } else {
                plan.collections.push(entry);
            }
        }
        // Analyzers first: views and other collections may reference them.
        plan.system
            .sort_by_key(|c| c.parameters.name != ANALYZERS_COLLECTION);

        for view in inventory.views {
            if view.name.is_empty() {
                return Err(ReplicationError::protocol(format!("inventory view {} has no name", view.id)));
            }
            if !names.insert(view.name.clone()) {
                return Err(ReplicationError::protocol(format!(
                    "inventory name {} is used twice",
                    view.name
                )));
            }
            match view.view_type {
                ViewType::ArangoSearch => plan.search_views.push(view),
                ViewType::SearchAlias => plan.alias_views.push(view),
            }
        }
        Ok(plan)
    }

    fn contains_collection(&self, local: &LocalCollection) -> bool {
        self.system.iter().chain(&self.collections).any(|c| {
            let spec = &c.parameters;
            spec.name == local.name || (!spec.guid.is_empty() && spec.guid == local.guid)
        })
    }

    fn contains_view(&self, local: &ViewSpec) -> bool {
        self.search_views
            .iter()
            .chain(&self.alias_views)
            .any(|v| v.name == local.name || (!v.guid.is_empty() && v.guid == local.guid))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Batch lifecycle
// ═══════════════════════════════════════════════════════════════════════════════

/// Owns a leader batch and its keep-alive task.
///
/// [`BatchGuard::finish`] releases the batch. If the guard is dropped
/// without it (the run future was cancelled) the release is spawned.
struct BatchGuard {
    leader: Arc<dyn LeaderClient>,
    batch_id: String,
    keepalive: Option<JoinHandle<()>>,
    lost: Arc<OnceLock<String>>,
    finished: bool,
}

impl BatchGuard {
    fn start(leader: Arc<dyn LeaderClient>, batch: &LeaderBatch, ttl: Duration, interval: Duration, abort: AbortSignal) -> Self {
        let lost = Arc::new(OnceLock::new());
        let keepalive = tokio::spawn(
            keepalive_loop(
                Arc::clone(&leader),
                batch.id.clone(),
                ttl,
                interval,
                abort,
                Arc::clone(&lost),
            )
            .instrument(info_span!("batch_keepalive", batch_id = %batch.id)),
        );
        Self {
            leader,
            batch_id: batch.id.clone(),
            keepalive: Some(keepalive),
            lost,
            finished: false,
        }
    }

    fn lost_reason(&self) -> Option<String> {
        self.lost.get().cloned()
    }

    async fn finish(mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
        self.finished = true;
        match self.leader.finish_batch(&self.batch_id).await {
            Ok(()) => {
                metrics::record_batch_event("finished");
                debug!(batch_id = %self.batch_id, "Leader batch finished");
            }
            Err(e) => {
                // The leader expires it after its TTL anyway.
                warn!(batch_id = %self.batch_id, error = %e, "Failed to finish leader batch");
            }
        }
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
        if self.finished {
            return;
        }
        self.finished = true;
        let leader = Arc::clone(&self.leader);
        let batch_id = std::mem::take(&mut self.batch_id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = leader.finish_batch(&batch_id).await {
                    warn!(batch_id = %batch_id, error = %e, "Failed to finish abandoned leader batch");
                } else {
                    metrics::record_batch_event("finished");
                }
            });
        }
    }
}

async fn keepalive_loop(
    leader: Arc<dyn LeaderClient>,
    batch_id: String,
    ttl: Duration,
    interval: Duration,
    abort: AbortSignal,
    lost: Arc<OnceLock<String>>,
) {
    loop {
        if abort.sleep(interval).await.is_err() {
            return;
        }
        match leader.extend_batch(&batch_id, ttl).await {
            Ok(()) => {
                metrics::record_batch_event("extended");
                debug!("Leader batch extended");
            }
            Err(e) => {
                error!(error = %e, "Failed to extend leader batch, aborting sync");
                let _ = lost.set(e.to_string());
                metrics::record_batch_event("lost");
                abort.abort();
                return;
            }
        }
    }
}

fn dump_job(
    leader: Arc<dyn LeaderClient>,
    abort: AbortSignal,
    collection: String,
    batch_id: String,
    from: u64,
    chunk_size: u64,
) -> impl Future<Output = Result<DumpChunk>> + Send + 'static {
    async move { abort.guard(leader.dump(&collection, &batch_id, from, chunk_size)).await }
}

// ═══════════════════════════════════════════════════════════════════════════════
// The engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Brings the local database in line with a leader snapshot.
pub struct InitialSyncEngine {
    core: Arc<SyncerCore>,
}

impl InitialSyncEngine {
    pub fn new(core: Arc<SyncerCore>) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &Arc<SyncerCore> {
        &self.core
    }

    /// Run a full initial sync. `inventory` is fetched from the leader
    /// unless supplied.
    pub async fn run(&self, inventory: Option<Inventory>) -> Result<InitialSyncReport> {
        let started = Instant::now();
        let result = self
            .run_in_batch(inventory, started)
            .instrument(info_span!("initial_sync", database = %self.core.config().database))
            .await;
        metrics::record_initial_sync(result.is_ok(), started.elapsed());
        match &result {
            Ok(report) => info!(
                collections = report.collections.len(),
                views = report.views,
                last_tick = report.last_tick,
                elapsed_ms = report.duration.as_millis() as u64,
                "Initial sync complete"
            ),
            Err(e) => error!(error = %e, "Initial sync failed"),
        }
        result
    }

    async fn run_in_batch(&self, inventory: Option<Inventory>, started: Instant) -> Result<InitialSyncReport> {
        let config = self.core.config();
        self.core.abort_signal().check()?;

        let batch = self
            .core
            .abort_signal()
            .guard(self.core.leader().start_batch(config.batch_ttl()))
            .await?;
        metrics::record_batch_event("started");
        info!(batch_id = %batch.id, last_tick = batch.last_tick, "Leader batch started");

        let guard = BatchGuard::start(
            Arc::clone(self.core.leader()),
            &batch,
            config.batch_ttl(),
            config.batch_keepalive_interval(),
            self.core.abort_signal().clone(),
        );

        let result = self.sync_all(&batch, inventory).await;
        let lost = guard.lost_reason();
        guard.finish().await;

        let (collections, views, dropped) = match (result, lost) {
            (Err(e), Some(reason)) if e.is_cancellation() => return Err(ReplicationError::BatchLost(reason)),
            (result, _) => result?,
        };
        Ok(InitialSyncReport {
            batch_id: batch.id,
            last_tick: batch.last_tick,
            collections,
            views,
            dropped,
            duration: started.elapsed(),
        })
    }

    async fn sync_all(
        &self,
        batch: &LeaderBatch,
        inventory: Option<Inventory>,
    ) -> Result<(Vec<CollectionReport>, usize, usize)> {
        self.core.leader_info().await?;
        let inventory = match inventory {
            Some(inventory) => inventory,
            None => {
                self.core
                    .abort_signal()
                    .guard(self.core.leader().inventory(&batch.id, None))
                    .await?
            }
        };

        self.enter(SyncPhase::Validate);
        let plan = SyncPlan::build(inventory, &self.core)?;
        info!(
            system = plan.system.len(),
            collections = plan.collections.len(),
            views = plan.search_views.len() + plan.alias_views.len(),
            "Inventory validated"
        );

        let mut reports = Vec::new();
        self.enter(SyncPhase::DropCreate);
        let dropped = self.drop_obsolete(&plan).await?;

        self.sync_collections(&plan.system, &batch.id, &mut reports).await?;
        self.enter(SyncPhase::DropCreate);
        for view in &plan.search_views {
            self.core.create_view(view).await?;
        }
        self.sync_collections(&plan.collections, &batch.id, &mut reports).await?;
        self.enter(SyncPhase::DropCreate);
        for view in &plan.alias_views {
            self.core.create_view(view).await?;
        }

        Ok((reports, plan.search_views.len() + plan.alias_views.len(), dropped))
    }

    fn enter(&self, phase: SyncPhase) {
        metrics::set_sync_phase(phase.as_str());
        debug!(phase = phase.as_str(), "Entering sync phase");
    }

    /// Drop local collections and views the leader no longer has.
    async fn drop_obsolete(&self, plan: &SyncPlan) -> Result<usize> {
        let mut dropped = 0;
        for local in self.core.storage().collections().await? {
            if local.is_system || self.core.is_excluded(&local.name) || plan.contains_collection(&local) {
                continue;
            }
            info!(collection = %local.name, "Dropping collection unknown to leader");
            self.core.drop_collection(&local.name).await?;
            dropped += 1;
        }
        for view in self.core.storage().views().await? {
            if !plan.contains_view(&view) {
                info!(view = %view.name, "Dropping view unknown to leader");
                self.core.drop_view(&view.name).await?;
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    async fn sync_collections(
        &self,
        group: &[InventoryCollection],
        batch_id: &str,
        reports: &mut Vec<CollectionReport>,
    ) -> Result<()> {
        self.enter(SyncPhase::DropCreate);
        let mut locals = Vec::with_capacity(group.len());
        for entry in group {
            let local = self.prepare_collection(entry).await?;
            locals.push(local);
        }

        self.enter(SyncPhase::Dump);
        for (entry, local) in group.iter().zip(locals) {
            let report = self.sync_collection(entry, local, batch_id).await?;
            reports.push(report);
        }
        Ok(())
    }

    /// DropCreate for one collection.
    async fn prepare_collection(&self, entry: &InventoryCollection) -> Result<LocalCollection> {
        let spec = &entry.parameters;
        let existed = self.core.resolve_collection(&ObjectRef::of_spec(spec)).await?.is_some();
        let local = self.core.create_collection(spec).await?;
        if existed && !self.core.config().incremental {
            debug!(collection = %spec.name, "Non-incremental sync, truncating local collection");
            self.core.truncate_collection(&local.name).await?;
        }
        Ok(local)
    }

    /// Dump phase for one collection: data first, then indexes.
    #[instrument(skip_all, fields(collection = %entry.parameters.name))]
    async fn sync_collection(
        &self,
        entry: &InventoryCollection,
        local: LocalCollection,
        batch_id: &str,
    ) -> Result<CollectionReport> {
        let started = Instant::now();
        let name = local.name.clone();
        let storage = self.core.storage();
        let count = self
            .core
            .retry_locked(&name, || storage.document_count(&name))
            .await??;

        let (strategy, stats) = if self.core.config().incremental && count > 0 {
            let report = RevisionDiffEngine::new(&self.core, batch_id)
                .sync_collection(&local)
                .await?;
            (report.strategy, report.stats)
        } else {
            (SyncStrategy::Dump, self.dump_collection(&local, batch_id).await?)
        };

        for index in &entry.indexes {
            self.core.create_index(&name, index).await?;
        }

        let documents = self
            .core
            .retry_locked(&name, || storage.document_count(&name))
            .await??;
        let duration = started.elapsed();
        metrics::record_collection_synced(&name, strategy.as_str(), duration);
        info!(
            strategy = %strategy,
            documents,
            elapsed_ms = duration.as_millis() as u64,
            "Collection synced"
        );
        Ok(CollectionReport {
            name,
            strategy,
            stats,
            documents,
            duration,
        })
    }

    /// Stream the leader's documents into `local`, one chunk in flight while
    /// the previous one is applied.
    async fn dump_collection(&self, local: &LocalCollection, batch_id: &str) -> Result<ApplyStats> {
        let config = self.core.config();
        let name = local.name.clone();
        let leader = Arc::clone(self.core.leader());
        let request = |from: u64| {
            dump_job(
                Arc::clone(&leader),
                self.core.abort_signal().clone(),
                name.clone(),
                batch_id.to_string(),
                from,
                config.chunk_size,
            )
        };

        let mut stats = ApplyStats::default();
        let mut since_commit = 0u64;
        let mut chunks = 0usize;
        let mut from = 0u64;
        let mut slot = JobSlot::new(self.core.abort_signal().clone());
        let mut next = Some(slot.request(request(from)).await);

        let result: Result<()> = async {
            while let Some(in_flight) = next.take() {
                let chunk = in_flight.wait().await?;
                chunks += 1;

                if chunk.check_more {
                    if chunk.last_included <= from {
                        return Err(ReplicationError::protocol(format!(
                            "dump of {name} did not advance past {from}"
                        )));
                    }
                    from = chunk.last_included;
                    next = Some(slot.request(request(from)).await);
                }

                let received = chunk.documents.len() as u64;
                for doc in chunk.documents {
                    let outcome = self.core.apply_marker(local, DocumentOp::Insert(doc)).await?;
                    stats.record(outcome);
                    since_commit += 1;
                    if since_commit >= config.intermediate_commit_count {
                        self.core
                            .retry_locked(&name, || self.core.storage().intermediate_commit(&name))
                            .await??;
                        since_commit = 0;
                    }
                }
                stats.fetched += received;
                stats.fetch_requests += 1;
                metrics::record_documents_fetched(&name, received);
                debug!(chunk = chunks, documents = received, from, "Applied dump chunk");
            }
            Ok(())
        }
        .await;
        drop(next);
        slot.drain().await;
        result?;

        metrics::record_documents_inserted(&name, stats.inserted + stats.replaced);
        Ok(stats)
    }
}
