// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! WAL tailing: apply the leader's write-ahead log after an initial sync.
//!
//! All entry points share one loop:
//!
//! ```text
//! loop {
//!     chunk = tail_wal(from)            // markers with tick > from
//!     from_present == false ──▶ TickNotPresent (resync needed)
//!     for marker in chunk:
//!         transaction start/commit/abort ──▶ buffer / apply / discard
//!         data marker                     ──▶ apply_marker
//!         schema marker                   ──▶ create/drop/rename/...
//!     from = max(from, last_included, last_scanned)
//!     persist applied tick
//! } until the mode says stop
//! ```
//!
//! | Mode | Stops when |
//! |------|------------|
//! | [`TailingEngine::catch_up`] | leader is less than `catch_up_threshold` ahead, or timeout |
//! | [`TailingEngine::finalize`] | `until` reached (later markers ignored), then WAL flushed |
//! | [`TailingEngine::drain`] | leader has nothing more right now |
//!
//! # Transactions
//!
//! Markers tagged with a transaction id are held back until the commit
//! marker arrives and dropped on abort. Open transactions survive between
//! calls on the same engine. The persisted tick never moves past the start
//! of an open transaction, so a restarted tailer sees the whole transaction
//! again.

use crate::error::{ReplicationError, Result};
use crate::leader::{MarkerType, WalChunk, WalMarker};
use crate::metrics;
use crate::storage::{CollectionSpec, Document, IndexSpec, LocalCollection, ViewSpec};
use crate::syncer::{ApplyOutcome, DocumentOp, ObjectRef, SyncerCore};
use crate::tick_store::{scope_for, TickStore};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TailMode {
    CatchUp { deadline: Instant, threshold: u64 },
    Finalize { until: u64 },
    Drain,
}

/// What one tailing call achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailReport {
    pub from: u64,
    /// Tick reached. Markers up to here have been applied or buffered.
    pub last_applied: u64,
    /// Newest tick the leader reported.
    pub leader_tick: u64,
    pub markers_applied: usize,
    pub markers_skipped: usize,
    pub chunks: usize,
    /// Whether the stop condition of the mode was met (as opposed to a
    /// timeout).
    pub caught_up: bool,
    pub open_transactions: usize,
}

impl TailReport {
    pub fn lag(&self) -> u64 {
        self.leader_tick.saturating_sub(self.last_applied)
    }

    /// Whether any marker was seen at all.
    pub fn made_progress(&self) -> bool {
        self.last_applied > self.from
    }
}

#[derive(Debug)]
struct OpenTransaction {
    start_tick: u64,
    markers: Vec<WalMarker>,
}

/// Applies the leader WAL for a database or a single collection.
pub struct TailingEngine {
    core: Arc<SyncerCore>,
    collection: Option<String>,
    tick_store: Option<Arc<TickStore>>,
    open: BTreeMap<String, OpenTransaction>,
    resolved: HashMap<String, LocalCollection>,
}

impl std::fmt::Debug for TailingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailingEngine")
            .field("collection", &self.collection)
            .field("open_transactions", &self.open.len())
            .finish()
    }
}

impl TailingEngine {
    pub fn new(core: Arc<SyncerCore>) -> Self {
        Self {
            core,
            collection: None,
            tick_store: None,
            open: BTreeMap::new(),
            resolved: HashMap::new(),
        }
    }

    /// Tail only markers of `collection`.
    pub fn for_collection(core: Arc<SyncerCore>, collection: impl Into<String>) -> Self {
        Self {
            collection: Some(collection.into()),
            ..Self::new(core)
        }
    }

    /// Record the applied tick in `store` after every chunk.
    pub fn with_tick_store(mut self, store: Arc<TickStore>) -> Self {
        self.tick_store = Some(store);
        self
    }

    /// Tick store scope of this tailer.
    pub fn scope(&self) -> String {
        scope_for(&self.core.config().database, self.collection.as_deref())
    }

    pub fn open_transactions(&self) -> usize {
        self.open.len()
    }

    /// Tail until the leader is close enough or `timeout` elapses; returns
    /// the tick reached.
    pub async fn catch_up(&mut self, from: u64, timeout: Duration) -> Result<TailReport> {
        let mode = TailMode::CatchUp {
            deadline: Instant::now() + timeout,
            threshold: self.core.config().tailing.catch_up_threshold,
        };
        self.tail(from, mode).await
    }

    /// Tail exactly up to `until` and flush the local WAL.
    pub async fn finalize(&mut self, from: u64, until: u64) -> Result<TailReport> {
        let report = self.tail(from, TailMode::Finalize { until }).await?;
        self.core
            .retry_locked("wal", || self.core.storage().flush_wal(true))
            .await??;
        if let Some(store) = &self.tick_store {
            store.flush_dirty().await?;
        }
        info!(until, applied = report.markers_applied, "Tailing finalized");
        Ok(report)
    }

    /// Tail until the leader reports nothing more.
    pub async fn drain(&mut self, from: u64) -> Result<TailReport> {
        self.tail(from, TailMode::Drain).await
    }

    #[instrument(skip(self), fields(scope = %self.scope()))]
    async fn tail(&mut self, from: u64, mode: TailMode) -> Result<TailReport> {
        let chunk_size = self.core.config().chunk_size;
        let idle_wait = self.core.config().tailing.idle_wait();
        let mut report = TailReport {
            from,
            last_applied: from,
            ..TailReport::default()
        };
        let mut position = from;

        loop {
            self.core.abort_signal().check()?;
            if let TailMode::Finalize { until } = mode {
                if position >= until {
                    report.caught_up = true;
                    break;
                }
            }

            let chunk = self
                .core
                .abort_signal()
                .guard(self.core.leader().tail_wal(position, chunk_size, self.collection.as_deref()))
                .await?;
            if !chunk.from_present && position != 0 {
                warn!(tick = position, leader_tick = chunk.last_tick, "Leader no longer has required WAL");
                return Err(ReplicationError::TickNotPresent { required_tick: position });
            }
            report.chunks += 1;
            report.leader_tick = report.leader_tick.max(chunk.last_tick);

            let (reached_until, applied, skipped) = self.apply_chunk(&chunk, position, mode).await?;
            report.markers_applied += applied;
            report.markers_skipped += skipped;
            metrics::record_markers_applied(applied);
            metrics::record_markers_skipped(skipped);

            position = match mode {
                TailMode::Finalize { until } if reached_until => until,
                TailMode::Finalize { until } => chunk.next_from(position).min(until),
                _ => chunk.next_from(position),
            };
            report.last_applied = position;
            self.persist(position).await;
            metrics::set_tailing_tick(position);
            metrics::set_tailing_lag(report.lag());
            debug!(
                tick = position,
                leader_tick = chunk.last_tick,
                markers = chunk.markers.len(),
                "Applied WAL chunk"
            );

            match mode {
                TailMode::CatchUp { deadline, threshold } => {
                    if !chunk.check_more || report.lag() < threshold {
                        report.caught_up = true;
                        break;
                    }
                    if Instant::now() >= deadline {
                        debug!(lag = report.lag(), "Catch-up timed out");
                        break;
                    }
                }
                TailMode::Finalize { until } => {
                    if position >= until {
                        report.caught_up = true;
                        break;
                    }
                    if !chunk.check_more {
                        if chunk.last_tick >= until {
                            // Nothing of ours between the scan end and `until`.
                            report.last_applied = until;
                            self.persist(until).await;
                            report.caught_up = true;
                            break;
                        }
                        self.core.abort_signal().sleep(idle_wait).await?;
                    }
                }
                TailMode::Drain => {
                    if !chunk.check_more {
                        report.caught_up = true;
                        break;
                    }
                }
            }
        }

        report.open_transactions = self.open.len();
        Ok(report)
    }

    /// Apply the markers of one chunk. Returns whether `until` was reached
    /// (finalize only) plus applied and skipped counts.
    async fn apply_chunk(&mut self, chunk: &WalChunk, position: u64, mode: TailMode) -> Result<(bool, usize, usize)> {
        let mut applied = 0;
        let mut skipped = 0;
        for marker in &chunk.markers {
            if marker.tick <= position {
                skipped += 1;
                continue;
            }
            if let TailMode::Finalize { until } = mode {
                if marker.tick > until {
                    return Ok((true, applied, skipped));
                }
            }
            let (a, s) = self.process(marker.clone()).await?;
            applied += a;
            skipped += s;
        }
        Ok((false, applied, skipped))
    }

    async fn persist(&self, position: u64) {
        if !self.core.config().tailing.persist_ticks {
            return;
        }
        if let Some(store) = &self.tick_store {
            let safe = self
                .open
                .values()
                .map(|t| t.start_tick.saturating_sub(1))
                .min()
                .map_or(position, |start| start.min(position));
            store.set(&self.scope(), safe).await;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Markers
    // ═══════════════════════════════════════════════════════════════════════

    /// Route one marker. Returns applied and skipped counts.
    async fn process(&mut self, marker: WalMarker) -> Result<(usize, usize)> {
        let tid = marker.transaction_id().map(str::to_string);
        match (marker.kind, tid) {
            (MarkerType::TransactionStart, Some(tid)) => {
                self.open.insert(
                    tid,
                    OpenTransaction {
                        start_tick: marker.tick,
                        markers: Vec::new(),
                    },
                );
                Ok((0, 0))
            }
            (MarkerType::TransactionCommit, Some(tid)) => {
                let Some(tx) = self.open.remove(&tid) else {
                    debug!(tid = %tid, "Commit for unknown transaction");
                    return Ok((0, 1));
                };
                let (mut applied, mut skipped) = (0, 0);
                for buffered in tx.markers {
                    if self.apply(&buffered).await? {
                        applied += 1;
                    } else {
                        skipped += 1;
                    }
                }
                debug!(tid = %tid, applied, "Transaction committed");
                Ok((applied, skipped))
            }
            (MarkerType::TransactionAbort, Some(tid)) => {
                let discarded = self.open.remove(&tid).map_or(0, |tx| tx.markers.len());
                debug!(tid = %tid, discarded, "Transaction aborted");
                Ok((0, discarded))
            }
            (kind, Some(tid)) if kind.is_data() => {
                let tick = marker.tick;
                let tx = self.open.entry(tid).or_insert_with(|| {
                    warn!(tick, "Transaction data without start marker, buffering");
                    OpenTransaction {
                        start_tick: tick,
                        markers: Vec::new(),
                    }
                });
                tx.markers.push(marker);
                Ok((0, 0))
            }
            (MarkerType::TransactionStart | MarkerType::TransactionCommit | MarkerType::TransactionAbort, None) => {
                Ok((0, 1))
            }
            _ => Ok(if self.apply(&marker).await? { (1, 0) } else { (0, 1) }),
        }
    }

    fn marker_collection_name(&self, marker: &WalMarker) -> Option<String> {
        marker
            .cname
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| {
                marker
                    .cuid
                    .as_ref()
                    .and_then(|cuid| self.resolved.get(cuid))
                    .map(|c| c.name.clone())
            })
    }

    /// Whether `marker` belongs to a collection this tailer ignores.
    fn out_of_scope(&self, marker: &WalMarker) -> bool {
        let Some(name) = self.marker_collection_name(marker) else {
            return false;
        };
        if self.core.is_excluded(&name) {
            return true;
        }
        matches!(&self.collection, Some(scope) if *scope != name)
    }

    /// Apply a non-transactional marker. Returns false if it was skipped.
    async fn apply(&mut self, marker: &WalMarker) -> Result<bool> {
        let is_collection_marker = !matches!(
            marker.kind,
            MarkerType::ViewCreate | MarkerType::ViewDrop | MarkerType::ViewChange
        );
        if is_collection_marker && self.out_of_scope(marker) {
            return Ok(false);
        }

        match marker.kind {
            MarkerType::Document => {
                let collection = self.collection_for(marker).await?;
                let doc = Document::try_from(marker.data.clone())
                    .map_err(|e| ReplicationError::protocol(format!("marker at tick {}: {e}", marker.tick)))?;
                self.core.apply_marker(&collection, DocumentOp::Insert(doc)).await?;
            }
            MarkerType::Remove => {
                let collection = self.collection_for(marker).await?;
                let key = marker
                    .data
                    .get("_key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ReplicationError::protocol(format!("remove marker at tick {} without _key", marker.tick)))?;
                let outcome = self
                    .core
                    .apply_marker(
                        &collection,
                        DocumentOp::Remove {
                            key: key.to_string(),
                        },
                    )
                    .await?;
                if outcome == ApplyOutcome::Absent {
                    debug!(collection = %collection.name, key, "Removed document was already absent");
                }
            }
            MarkerType::TransactionStart | MarkerType::TransactionCommit | MarkerType::TransactionAbort => {
                return Ok(false);
            }
            _ => self.apply_schema(marker).await?,
        }
        Ok(true)
    }

    async fn collection_for(&mut self, marker: &WalMarker) -> Result<LocalCollection> {
        let cache_key = marker.cuid.clone().or_else(|| marker.cname.clone());
        if let Some(found) = cache_key.as_ref().and_then(|k| self.resolved.get(k)) {
            return Ok(found.clone());
        }
        let local = self.core.require_collection(&ObjectRef::of_marker(marker)).await?;
        if let Some(key) = cache_key {
            self.resolved.insert(key, local.clone());
        }
        Ok(local)
    }

    async fn apply_schema(&mut self, marker: &WalMarker) -> Result<()> {
        // Any schema change may invalidate resolved collections.
        self.resolved.clear();
        let reference = ObjectRef::of_marker(marker);
        let payload = marker.data.get("data").unwrap_or(&marker.data);
        let bad = |what: &str, e: serde_json::Error| {
            ReplicationError::protocol(format!("{what} marker at tick {}: {e}", marker.tick))
        };

        match marker.kind {
            MarkerType::CollectionCreate => {
                let spec: CollectionSpec =
                    serde_json::from_value(payload.clone()).map_err(|e| bad("collection create", e))?;
                if self.core.is_excluded(&spec.name) {
                    return Ok(());
                }
                self.core.create_collection(&spec).await?;
            }
            MarkerType::CollectionDrop => {
                if let Some(local) = self.core.resolve_collection(&reference).await? {
                    self.core.drop_collection(&local.name).await?;
                }
            }
            MarkerType::CollectionRename => {
                let to = payload
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ReplicationError::protocol(format!("rename marker at tick {} without name", marker.tick)))?;
                let local = self.core.require_collection(&reference).await?;
                self.core.rename_collection(&local.name, to).await?;
            }
            MarkerType::CollectionChange => {
                // Only identity and type are modelled locally.
                let local = self.core.require_collection(&reference).await?;
                debug!(collection = %local.name, "Collection properties changed");
            }
            MarkerType::CollectionTruncate => {
                let local = self.core.require_collection(&reference).await?;
                self.core.truncate_collection(&local.name).await?;
            }
            MarkerType::IndexCreate => {
                let index: IndexSpec = serde_json::from_value(payload.clone()).map_err(|e| bad("index create", e))?;
                let local = self.core.require_collection(&reference).await?;
                self.core.create_index(&local.name, &index).await?;
            }
            MarkerType::IndexDrop => {
                let id = payload
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ReplicationError::protocol(format!("index drop marker at tick {} without id", marker.tick)))?;
                // Index ids may be qualified as "collection/id".
                let id = id.rsplit('/').next().unwrap_or(id);
                if let Some(local) = self.core.resolve_collection(&reference).await? {
                    self.core.drop_index(&local.name, id).await?;
                }
            }
            MarkerType::ViewCreate => {
                let view: ViewSpec = serde_json::from_value(payload.clone()).map_err(|e| bad("view create", e))?;
                self.core.create_view(&view).await?;
            }
            MarkerType::ViewChange => {
                let view: ViewSpec = serde_json::from_value(payload.clone()).map_err(|e| bad("view change", e))?;
                self.core.change_view(&view).await?;
            }
            MarkerType::ViewDrop => {
                let reference = ObjectRef {
                    guid: payload.get("globallyUniqueId").and_then(Value::as_str).map(str::to_string),
                    id: payload.get("id").and_then(Value::as_str).map(str::to_string),
                    name: payload.get("name").and_then(Value::as_str).map(str::to_string),
                };
                if let Some(view) = self.core.resolve_view(&reference).await? {
                    self.core.drop_view(&view.name).await?;
                }
            }
            MarkerType::Document
            | MarkerType::Remove
            | MarkerType::TransactionStart
            | MarkerType::TransactionCommit
            | MarkerType::TransactionAbort => {}
        }
        info!(kind = ?marker.kind, tick = marker.tick, "Applied schema marker");
        Ok(())
    }
}
