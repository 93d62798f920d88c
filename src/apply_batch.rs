//! Bounded buffer of pending removals and fetches for one collection.
//!
//! Diffs discover work range by range; applying every item immediately would
//! mean one leader round trip per document. [`ApplyBatch`] collects the work
//! and flushes it once `limit` items are pending:
//!
//! ```text
//! merge-join ──▶ schedule_remove(key, rev) ──┐
//!            └─▶ schedule_fetch(rev | key) ──┼──▶ flush()
//!                                            │      1. removals (by revision)
//!                                            │      2. fetch documents from leader
//!                                            │      3. apply_marker(Insert)
//! ```
//!
//! Removals run before inserts so a stale local document never blocks the
//! leader's version on a unique index.

use crate::error::{ReplicationError, Result};
use crate::leader::KeyListing;
use crate::metrics;
use crate::revision::RevisionId;
use crate::storage::{Document, LocalCollection};
use crate::syncer::{ApplyOutcome, DocumentOp, SyncerCore};
use std::ops::AddAssign;
use tracing::{debug, instrument};

/// Where fetched documents come from.
#[derive(Debug, Clone)]
pub enum FetchSource {
    /// `revisions/documents` within a leader batch.
    Revisions { batch_id: String },
    /// `keys/{id}?type=docs` of a key listing.
    Listing(KeyListing),
}

/// Counters of what a sync did to one collection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyStats {
    pub inserted: u64,
    pub replaced: u64,
    pub unchanged: u64,
    pub removed: u64,
    /// Documents requested from the leader.
    pub fetched: u64,
    pub fetch_requests: u64,
}

impl ApplyStats {
    pub fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Inserted => self.inserted += 1,
            ApplyOutcome::Replaced => self.replaced += 1,
            ApplyOutcome::Unchanged | ApplyOutcome::Absent => self.unchanged += 1,
            ApplyOutcome::Removed => self.removed += 1,
        }
    }

    /// Change in document count implied by these stats.
    pub fn net_change(&self) -> i64 {
        self.inserted as i64 - self.removed as i64
    }
}

impl AddAssign for ApplyStats {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.unchanged += other.unchanged;
        self.removed += other.removed;
        self.fetched += other.fetched;
        self.fetch_requests += other.fetch_requests;
    }
}

/// Pending work for one collection.
pub struct ApplyBatch<'a> {
    core: &'a SyncerCore,
    collection: LocalCollection,
    source: FetchSource,
    limit: usize,
    removals: Vec<(String, RevisionId)>,
    fetch_revisions: Vec<RevisionId>,
    fetch_keys: Vec<String>,
    stats: ApplyStats,
}

impl<'a> ApplyBatch<'a> {
    pub fn new(core: &'a SyncerCore, collection: LocalCollection, source: FetchSource) -> Self {
        let limit = core.config().diff_batch_size.max(1);
        Self {
            core,
            collection,
            source,
            limit,
            removals: Vec::new(),
            fetch_revisions: Vec::new(),
            fetch_keys: Vec::new(),
            stats: ApplyStats::default(),
        }
    }

    pub fn pending(&self) -> usize {
        self.removals.len() + self.fetch_revisions.len() + self.fetch_keys.len()
    }

    pub fn stats(&self) -> ApplyStats {
        self.stats
    }

    /// Remove `key`, but only while it still has `rev`.
    pub async fn schedule_remove(&mut self, key: String, rev: RevisionId) -> Result<()> {
        self.removals.push((key, rev));
        self.flush_if_full().await
    }

    pub async fn schedule_fetch(&mut self, rev: RevisionId) -> Result<()> {
        self.fetch_revisions.push(rev);
        self.flush_if_full().await
    }

    pub async fn schedule_fetch_key(&mut self, key: String) -> Result<()> {
        self.fetch_keys.push(key);
        self.flush_if_full().await
    }

    async fn flush_if_full(&mut self) -> Result<()> {
        if self.pending() >= self.limit {
            self.flush().await?;
        }
        Ok(())
    }

    /// Apply everything pending.
    #[instrument(skip(self), fields(collection = %self.collection.name))]
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending() == 0 {
            return Ok(());
        }
        self.core.abort_signal().check()?;
        let name = self.collection.name.clone();

        let removals = std::mem::take(&mut self.removals);
        let mut removed = 0u64;
        for (key, rev) in removals {
            let outcome = self.core.remove_revision(&name, &key, rev).await?;
            if outcome == ApplyOutcome::Removed {
                removed += 1;
            }
            self.stats.record(outcome);
        }

        let documents = self.fetch_documents().await?;
        let inserted_before = self.stats.inserted + self.stats.replaced;
        let conflicts_before = self.core.conflict_removals();
        for doc in documents {
            let outcome = self
                .core
                .apply_marker(&self.collection, DocumentOp::Insert(doc))
                .await?;
            self.stats.record(outcome);
        }
        // Documents removed to clear unique conflicts change the count too.
        let conflict_removed = self.core.conflict_removals() - conflicts_before;
        self.stats.removed += conflict_removed;
        removed += conflict_removed;

        let written = self.stats.inserted + self.stats.replaced - inserted_before;
        metrics::record_documents_removed(&name, removed);
        metrics::record_documents_inserted(&name, written);
        debug!(removed, written, "Flushed pending changes");
        Ok(())
    }

    async fn fetch_documents(&mut self) -> Result<Vec<Document>> {
        let leader = self.core.leader();
        let abort = self.core.abort_signal();
        let name = self.collection.name.as_str();
        let mut documents = Vec::new();

        let revisions = std::mem::take(&mut self.fetch_revisions);
        if !revisions.is_empty() {
            let FetchSource::Revisions { batch_id } = &self.source else {
                return Err(ReplicationError::Internal("revision fetch without a leader batch".into()));
            };
            let fetched = abort
                .guard(leader.revision_documents(name, batch_id, &revisions))
                .await?;
            self.stats.fetch_requests += 1;
            self.stats.fetched += revisions.len() as u64;
            metrics::record_documents_fetched(name, revisions.len() as u64);
            if fetched.len() != revisions.len() {
                debug!(
                    requested = revisions.len(),
                    received = fetched.len(),
                    "Leader returned fewer documents than requested"
                );
            }
            documents.extend(fetched);
        }

        let keys = std::mem::take(&mut self.fetch_keys);
        if !keys.is_empty() {
            let FetchSource::Listing(listing) = &self.source else {
                return Err(ReplicationError::Internal("key fetch without a key listing".into()));
            };
            let fetched = abort.guard(leader.listing_documents(listing, &keys)).await?;
            self.stats.fetch_requests += 1;
            self.stats.fetched += keys.len() as u64;
            metrics::record_documents_fetched(name, keys.len() as u64);
            documents.extend(fetched);
        }

        Ok(documents)
    }

    /// Flush and return the final counters.
    pub async fn finish(mut self) -> Result<ApplyStats> {
        self.flush().await?;
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_record_and_net_change() {
        let mut stats = ApplyStats::default();
        stats.record(ApplyOutcome::Inserted);
        stats.record(ApplyOutcome::Inserted);
        stats.record(ApplyOutcome::Replaced);
        stats.record(ApplyOutcome::Removed);
        stats.record(ApplyOutcome::Absent);
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.replaced, 1);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.net_change(), 1);
    }

    #[test]
    fn test_stats_add_assign() {
        let mut a = ApplyStats {
            inserted: 1,
            fetched: 3,
            ..ApplyStats::default()
        };
        a += ApplyStats {
            removed: 2,
            fetched: 1,
            fetch_requests: 1,
            ..ApplyStats::default()
        };
        assert_eq!(a.fetched, 4);
        assert_eq!(a.net_change(), -1);
    }
}
