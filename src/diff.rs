// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incremental collection sync by revision diff.
//!
//! Instead of truncating and re-dumping a collection the follower already
//! holds, compare revision trees and only move what differs:
//!
//! ```text
//!  leader tree ──┐
//!                ├─ diff ──▶ [r1] [r2] ... [rn]     ranges where hashes differ
//!  local tree  ──┘              │
//!                               ▼
//!              revisions/ranges (pipelined, resumable)
//!                               │
//!                merge-join against local revisions
//!                   ├─ local only  ──▶ remove(key, rev)
//!                   ├─ leader only ──▶ fetch(rev)
//!                   └─ both        ──▶ skip
//! ```
//!
//! Leaders older than 3.8, and collections whose engine keeps no revision
//! tree, fall back to the key-listing diff: the same three-way compare on
//! `(key, rev)` pairs sorted by key.
//!
//! After either diff the engine's document counter is checked against
//! `before + inserted - removed` and corrected if it drifted.

use crate::apply_batch::{ApplyBatch, ApplyStats, FetchSource};
use crate::error::{ReplicationError, Result};
use crate::job::{AbortSignal, JobSlot};
use crate::leader::{KeyListing, KeyRevision, LeaderClient, RangesResponse};
use crate::metrics;
use crate::revision::{RevisionId, RevisionRange};
use crate::revision_tree::RevisionTree;
use crate::storage::LocalCollection;
use crate::syncer::SyncerCore;
use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Ranges sent per `revisions/ranges` request.
pub const RANGES_PER_REQUEST: usize = 64;

/// How a collection was brought in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStrategy {
    /// Raw chunked dump into an empty collection.
    Dump,
    /// Revision tree diff.
    RevisionTree,
    /// Key-listing diff.
    KeyListing,
    /// Leader collection is empty; local one was truncated.
    Truncate,
}

impl SyncStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dump => "dump",
            Self::RevisionTree => "revision_tree",
            Self::KeyListing => "key_listing",
            Self::Truncate => "truncate",
        }
    }
}

impl std::fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of diffing one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffReport {
    pub strategy: SyncStrategy,
    /// Differing revision ranges (tree diff only).
    pub ranges: usize,
    /// Local documents before the diff.
    pub before: u64,
    pub stats: ApplyStats,
    /// Whether the document counter had to be corrected.
    pub count_corrected: bool,
}

impl DiffReport {
    /// Expected document count after the diff.
    pub fn expected_count(&self) -> u64 {
        (self.before as i64 + self.stats.net_change()).max(0) as u64
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Merge-join
// ═══════════════════════════════════════════════════════════════════════════════

/// Work found by comparing one revision range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeDelta {
    /// Local documents the leader does not have, as `(key, rev)`.
    pub removals: Vec<(String, RevisionId)>,
    /// Leader revisions missing locally.
    pub fetches: Vec<RevisionId>,
}

/// Three-way compare of local `(rev, key)` pairs against the leader's
/// revisions for the same range. Both inputs must be ascending.
pub fn merge_range(local: &[(RevisionId, String)], leader: &[RevisionId]) -> RangeDelta {
    let mut delta = RangeDelta::default();
    let mut l = local.iter().peekable();
    let mut r = leader.iter().peekable();

    loop {
        match (l.peek(), r.peek()) {
            (None, None) => break,
            (Some((rev, key)), None) => {
                delta.removals.push((key.clone(), *rev));
                l.next();
            }
            (None, Some(&&rev)) => {
                delta.fetches.push(rev);
                r.next();
            }
            (Some((local_rev, key)), Some(&&leader_rev)) => match local_rev.cmp(&leader_rev) {
                Ordering::Less => {
                    delta.removals.push((key.clone(), *local_rev));
                    l.next();
                }
                Ordering::Greater => {
                    delta.fetches.push(leader_rev);
                    r.next();
                }
                Ordering::Equal => {
                    l.next();
                    r.next();
                }
            },
        }
    }
    delta
}

/// Work found by comparing key listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyDelta {
    pub removals: Vec<(String, RevisionId)>,
    /// Keys missing locally or present with another revision.
    pub fetches: Vec<String>,
}

/// Three-way compare of `(key, rev)` lists. Both inputs must be sorted by key.
pub fn merge_keys(local: &[KeyRevision], leader: &[KeyRevision]) -> KeyDelta {
    let mut delta = KeyDelta::default();
    let (mut i, mut j) = (0, 0);

    while i < local.len() || j < leader.len() {
        let ord = match (local.get(i), leader.get(j)) {
            (Some((lk, _)), Some((rk, _))) => lk.cmp(rk),
            (Some(_), None) => Ordering::Less,
            _ => Ordering::Greater,
        };
        match ord {
            Ordering::Less => {
                let (key, rev) = &local[i];
                delta.removals.push((key.clone(), *rev));
                i += 1;
            }
            Ordering::Greater => {
                delta.fetches.push(leader[j].0.clone());
                j += 1;
            }
            Ordering::Equal => {
                if local[i].1 != leader[j].1 {
                    delta.fetches.push(leader[j].0.clone());
                }
                i += 1;
                j += 1;
            }
        }
    }
    delta
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resumable range requests
// ═══════════════════════════════════════════════════════════════════════════════

/// Position in the list of differing ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RangeCursor {
    pos: usize,
    /// Lower bound overriding `ranges[pos].low` after a truncated answer.
    resume: Option<RevisionId>,
}

impl RangeCursor {
    fn group(&self, ranges: &[RevisionRange]) -> Vec<RevisionRange> {
        let end = (self.pos + RANGES_PER_REQUEST).min(ranges.len());
        let mut group = ranges[self.pos..end].to_vec();
        if let (Some(first), Some(resume)) = (group.first_mut(), self.resume) {
            first.low = resume;
        }
        group
    }
}

/// Pair each answered range with the leader's revisions and work out where
/// the next request starts.
///
/// Returns the answered segments and how many requested ranges were fully
/// consumed, plus the resume point inside the next one.
fn split_response(
    requested: &[RevisionRange],
    response: RangesResponse,
) -> Result<(Vec<(RevisionRange, Vec<RevisionId>)>, usize, Option<RevisionId>)> {
    let answered = response.ranges.len();
    if answered > requested.len() {
        return Err(ReplicationError::protocol(format!(
            "leader answered {answered} ranges, {} were requested",
            requested.len()
        )));
    }

    let Some(resume) = response.resume else {
        if answered != requested.len() {
            return Err(ReplicationError::protocol(format!(
                "leader answered {answered} of {} ranges without a resume point",
                requested.len()
            )));
        }
        let segments = requested.iter().copied().zip(response.ranges).collect();
        return Ok((segments, answered, None));
    };

    if answered == 0 {
        return Err(ReplicationError::protocol("truncated ranges response without any range"));
    }
    let last = requested[answered - 1];
    if resume <= last.low {
        return Err(ReplicationError::protocol(format!(
            "resume point {resume} does not advance past {}",
            last.low
        )));
    }

    let mut segments: Vec<_> = requested.iter().copied().zip(response.ranges).collect();
    if resume > last.high {
        // The last range happened to be complete after all.
        return Ok((segments, answered, None));
    }
    if let Some((range, _)) = segments.last_mut() {
        range.high = RevisionId::new(resume.as_u64() - 1);
    }
    Ok((segments, answered - 1, Some(resume)))
}

fn ranges_job(
    leader: Arc<dyn LeaderClient>,
    abort: AbortSignal,
    collection: String,
    batch_id: String,
    group: Vec<RevisionRange>,
    resume: Option<RevisionId>,
) -> impl Future<Output = Result<RangesResponse>> + Send + 'static {
    async move {
        abort
            .guard(leader.revision_ranges(&collection, &batch_id, &group, resume))
            .await
    }
}

fn keys_job(
    leader: Arc<dyn LeaderClient>,
    abort: AbortSignal,
    listing: KeyListing,
    offset: u64,
    limit: u64,
) -> impl Future<Output = Result<Vec<KeyRevision>>> + Send + 'static {
    async move { abort.guard(leader.listing_keys(&listing, offset, limit)).await }
}

// ═══════════════════════════════════════════════════════════════════════════════
// The engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Diffs collections against the leader within one leader batch.
pub struct RevisionDiffEngine<'a> {
    core: &'a SyncerCore,
    batch_id: &'a str,
}

impl<'a> RevisionDiffEngine<'a> {
    pub fn new(core: &'a SyncerCore, batch_id: &'a str) -> Self {
        Self { core, batch_id }
    }

    /// Bring `collection` in line with the leader, choosing the tree or key
    /// diff depending on what both sides support.
    #[instrument(skip_all, fields(collection = %collection.name))]
    pub async fn sync_collection(&self, collection: &LocalCollection) -> Result<DiffReport> {
        let info = self.core.leader_info().await?;
        let local_tree = if collection.supports_revision_tree && info.supports_revision_tree() {
            let name = collection.name.as_str();
            self.core
                .retry_locked(name, || self.core.storage().revision_tree(name))
                .await??
        } else {
            None
        };

        let report = match local_tree {
            Some(tree) => self.sync_by_tree(collection, tree).await?,
            None => {
                debug!(leader_version = ?info.version, "Revision trees unavailable, diffing key listings");
                self.sync_by_keys(collection).await?
            }
        };

        info!(
            strategy = %report.strategy,
            ranges = report.ranges,
            inserted = report.stats.inserted,
            replaced = report.stats.replaced,
            removed = report.stats.removed,
            fetched = report.stats.fetched,
            "Collection diff complete"
        );
        Ok(report)
    }

    async fn sync_by_tree(&self, collection: &LocalCollection, local_tree: RevisionTree) -> Result<DiffReport> {
        let name = collection.name.as_str();
        let leader_tree = self
            .core
            .abort_signal()
            .guard(self.core.leader().revision_tree(name, self.batch_id))
            .await?;
        let before = local_tree.count();

        if leader_tree.is_empty() {
            info!(local_documents = before, "Leader collection is empty, truncating");
            self.core.truncate_collection(name).await?;
            return Ok(DiffReport {
                strategy: SyncStrategy::Truncate,
                ranges: 0,
                before,
                stats: ApplyStats {
                    removed: before,
                    ..ApplyStats::default()
                },
                count_corrected: false,
            });
        }

        let local_tree = if local_tree.depth() == leader_tree.depth() {
            local_tree
        } else {
            self.rebuild_like(name, &leader_tree).await?
        };

        let ranges = leader_tree.diff(&local_tree);
        metrics::record_diff_ranges(name, ranges.len());
        debug!(ranges = ranges.len(), leader_count = leader_tree.count(), "Computed differing ranges");

        let mut batch = ApplyBatch::new(
            self.core,
            collection.clone(),
            FetchSource::Revisions {
                batch_id: self.batch_id.to_string(),
            },
        );
        self.apply_ranges(name, &ranges, &mut batch).await?;
        let stats = batch.finish().await?;

        let mut report = DiffReport {
            strategy: SyncStrategy::RevisionTree,
            ranges: ranges.len(),
            before,
            stats,
            count_corrected: false,
        };
        report.count_corrected = self.reconcile_count(name, report.expected_count()).await?;
        Ok(report)
    }

    /// Local tree in the leader's geometry, built from stored revisions.
    async fn rebuild_like(&self, name: &str, template: &RevisionTree) -> Result<RevisionTree> {
        let revisions = self
            .core
            .retry_locked(name, || {
                self.core
                    .storage()
                    .revisions_in_range(name, RevisionId::MIN, RevisionId::MAX)
            })
            .await??;
        let mut tree = RevisionTree::empty_like(template);
        for (rev, _) in revisions {
            tree.insert(rev);
        }
        Ok(tree)
    }

    /// Request leader revisions for `ranges`, keeping one request in flight
    /// while the previous answer is merged.
    async fn apply_ranges(&self, name: &str, ranges: &[RevisionRange], batch: &mut ApplyBatch<'_>) -> Result<()> {
        if ranges.is_empty() {
            return Ok(());
        }
        let leader = Arc::clone(self.core.leader());
        let job = |cursor: RangeCursor| {
            let group = cursor.group(ranges);
            let fut = ranges_job(
                Arc::clone(&leader),
                self.core.abort_signal().clone(),
                name.to_string(),
                self.batch_id.to_string(),
                group.clone(),
                cursor.resume,
            );
            (group, fut)
        };

        let mut slot = JobSlot::new(self.core.abort_signal().clone());
        let first = RangeCursor { pos: 0, resume: None };
        let (group, fut) = job(first);
        let mut next = Some((first, group, slot.request(fut).await));

        let result: Result<()> = async {
            while let Some((cursor, group, in_flight)) = next.take() {
                let response = in_flight.wait().await?;
                let (segments, consumed, resume) = split_response(&group, response)?;

                let following = RangeCursor {
                    pos: cursor.pos + consumed,
                    resume,
                };
                if following.pos < ranges.len() {
                    let (group, fut) = job(following);
                    next = Some((following, group, slot.request(fut).await));
                }

                for (range, leader_revs) in segments {
                    let local = self
                        .core
                        .retry_locked(name, || {
                            self.core.storage().revisions_in_range(name, range.low, range.high)
                        })
                        .await??;
                    let delta = merge_range(&local, &leader_revs);
                    for (key, rev) in delta.removals {
                        batch.schedule_remove(key, rev).await?;
                    }
                    for rev in delta.fetches {
                        batch.schedule_fetch(rev).await?;
                    }
                }
            }
            Ok(())
        }
        .await;
        drop(next);
        slot.drain().await;
        result
    }

    async fn sync_by_keys(&self, collection: &LocalCollection) -> Result<DiffReport> {
        let leader = self.core.leader();
        let listing = self
            .core
            .abort_signal()
            .guard(leader.create_key_listing(&collection.name, self.batch_id))
            .await?;
        debug!(listing = %listing.id, count = listing.count, "Leader key listing ready");

        let result = self.diff_listing(collection, &listing).await;
        if let Err(e) = leader.release_key_listing(&listing).await {
            warn!(listing = %listing.id, error = %e, "Failed to release key listing");
        }
        result
    }

    async fn diff_listing(&self, collection: &LocalCollection, listing: &KeyListing) -> Result<DiffReport> {
        let name = collection.name.as_str();
        let mut leader_keys = self.fetch_listing_keys(listing).await?;
        leader_keys.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut local = self
            .core
            .retry_locked(name, || self.core.storage().keys_with_revisions(name))
            .await??;
        local.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let before = local.len() as u64;

        let delta = merge_keys(&local, &leader_keys);
        debug!(
            removals = delta.removals.len(),
            fetches = delta.fetches.len(),
            "Compared key listings"
        );

        let mut batch = ApplyBatch::new(self.core, collection.clone(), FetchSource::Listing(listing.clone()));
        for (key, rev) in delta.removals {
            batch.schedule_remove(key, rev).await?;
        }
        for key in delta.fetches {
            batch.schedule_fetch_key(key).await?;
        }
        let stats = batch.finish().await?;

        let mut report = DiffReport {
            strategy: SyncStrategy::KeyListing,
            ranges: 0,
            before,
            stats,
            count_corrected: false,
        };
        report.count_corrected = self.reconcile_count(name, report.expected_count()).await?;
        Ok(report)
    }

    /// All `(key, rev)` pairs of a listing, pages pipelined.
    async fn fetch_listing_keys(&self, listing: &KeyListing) -> Result<Vec<KeyRevision>> {
        let page = self.core.config().diff_batch_size.max(1) as u64;
        let leader = Arc::clone(self.core.leader());
        let abort = self.core.abort_signal().clone();
        let request = |offset: u64| keys_job(Arc::clone(&leader), abort.clone(), listing.clone(), offset, page);
        // The leader's count is only a hint for preallocation.
        let mut keys = Vec::with_capacity(listing.count.min(page.saturating_mul(4)) as usize);
        if listing.count == 0 {
            return Ok(keys);
        }

        let mut slot = JobSlot::new(abort.clone());
        let mut next = Some(slot.request(request(0)).await);
        let mut offset = 0u64;
        let result: Result<()> = async {
            while let Some(in_flight) = next.take() {
                let chunk = in_flight.wait().await?;
                if chunk.is_empty() {
                    return Err(ReplicationError::protocol(format!(
                        "key listing {} ended at {offset} of {} keys",
                        listing.id, listing.count
                    )));
                }
                offset += chunk.len() as u64;
                if offset > listing.count {
                    return Err(ReplicationError::protocol(format!(
                        "key listing {} returned {offset} keys, announced {}",
                        listing.id, listing.count
                    )));
                }
                if offset < listing.count {
                    next = Some(slot.request(request(offset)).await);
                }
                keys.extend(chunk);
            }
            Ok(())
        }
        .await;
        drop(next);
        slot.drain().await;
        result.map(|()| keys)
    }

    /// Compare the engine's counter with `expected` and fix it if needed.
    async fn reconcile_count(&self, name: &str, expected: u64) -> Result<bool> {
        let storage = self.core.storage();
        let actual = self
            .core
            .retry_locked(name, || storage.document_count(name))
            .await??;
        if actual == expected {
            return Ok(false);
        }

        warn!(collection = %name, expected, actual, "Document count mismatch after diff, correcting");
        metrics::record_count_mismatch(name);
        let delta = expected as i64 - actual as i64;
        self.core
            .retry_locked(name, || storage.adjust_document_count(name, delta))
            .await??;
        Ok(true)
    }
}
