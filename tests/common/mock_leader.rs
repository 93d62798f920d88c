//! In-process leader for integration tests.
//!
//! Serves batches, inventory, dumps, revision trees, key listings and the
//! WAL from its own in-memory collections. Every write through the helper
//! methods gets a fresh revision and a WAL marker, so a follower that
//! replicates correctly ends up with exactly [`MockLeader::documents`].
//!
//! Counters record what the follower asked for, and failures can be
//! injected per operation.

use follower_sync::leader::*;
use follower_sync::revision::{RevisionId, RevisionRange};
use follower_sync::revision_tree::{RevisionTree, DEFAULT_DEPTH};
use follower_sync::storage::{CollectionSpec, Document, IndexSpec, ViewSpec};
use follower_sync::ReplicationError;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Operations failures can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaderOp {
    LeaderInfo,
    StartBatch,
    ExtendBatch,
    Inventory,
    Dump,
    KeyListing,
    RevisionTree,
    RevisionRanges,
    RevisionDocuments,
    TailWal,
}

struct MockCollection {
    spec: CollectionSpec,
    indexes: Vec<IndexSpec>,
    docs: BTreeMap<String, Document>,
}

#[derive(Default)]
struct LeaderState {
    collections: Vec<MockCollection>,
    views: Vec<ViewSpec>,
    wal: Vec<WalMarker>,
    /// Markers at or below this tick were pruned.
    pruned_floor: u64,
    listings: HashMap<String, Vec<Document>>,
    failures: HashMap<LeaderOp, usize>,
}

impl LeaderState {
    fn collection(&self, name: &str) -> Result<&MockCollection, ReplicationError> {
        self.collections
            .iter()
            .find(|c| c.spec.name == name)
            .ok_or_else(|| ReplicationError::CollectionNotFound(name.to_string()))
    }

    fn collection_mut(&mut self, name: &str) -> &mut MockCollection {
        self.collections
            .iter_mut()
            .find(|c| c.spec.name == name)
            .unwrap_or_else(|| panic!("mock leader has no collection {name}"))
    }
}

pub struct MockLeader {
    state: Mutex<LeaderState>,
    version: Mutex<(u32, u32, u32)>,
    tick: AtomicU64,
    rev: AtomicU64,
    next_id: AtomicU64,
    dump_page: AtomicUsize,
    wal_page: AtomicUsize,
    max_revisions_per_response: AtomicUsize,
    dump_delay: Mutex<Duration>,

    pub batches_started: AtomicUsize,
    pub batches_finished: AtomicUsize,
    pub batch_extends: AtomicUsize,
    pub dump_requests: AtomicUsize,
    pub range_requests: AtomicUsize,
    pub revisions_requested: AtomicUsize,
    pub listings_created: AtomicUsize,
    pub listings_released: AtomicUsize,
    pub wal_requests: AtomicUsize,
}

impl Default for MockLeader {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLeader {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LeaderState::default()),
            version: Mutex::new((3, 11, 0)),
            tick: AtomicU64::new(100),
            rev: AtomicU64::new(1_000_000),
            next_id: AtomicU64::new(1),
            dump_page: AtomicUsize::new(1000),
            wal_page: AtomicUsize::new(100),
            max_revisions_per_response: AtomicUsize::new(usize::MAX),
            dump_delay: Mutex::new(Duration::ZERO),
            batches_started: AtomicUsize::new(0),
            batches_finished: AtomicUsize::new(0),
            batch_extends: AtomicUsize::new(0),
            dump_requests: AtomicUsize::new(0),
            range_requests: AtomicUsize::new(0),
            revisions_requested: AtomicUsize::new(0),
            listings_created: AtomicUsize::new(0),
            listings_released: AtomicUsize::new(0),
            wal_requests: AtomicUsize::new(0),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Setup
    // ───────────────────────────────────────────────────────────────────────

    /// Pretend to be an older server without revision trees.
    pub fn set_version(&self, version: (u32, u32, u32)) {
        *self.version.lock().unwrap() = version;
    }

    pub fn set_dump_page(&self, docs: usize) {
        self.dump_page.store(docs.max(1), Ordering::SeqCst);
    }

    pub fn set_wal_page(&self, markers: usize) {
        self.wal_page.store(markers.max(1), Ordering::SeqCst);
    }

    /// Truncate revision range answers after `n` revisions.
    pub fn set_max_revisions_per_response(&self, n: usize) {
        self.max_revisions_per_response.store(n.max(1), Ordering::SeqCst);
    }

    pub fn set_dump_delay(&self, delay: Duration) {
        *self.dump_delay.lock().unwrap() = delay;
    }

    /// Fail the next `times` calls of `op` with a transport error.
    pub fn fail_next(&self, op: LeaderOp, times: usize) {
        self.state.lock().unwrap().failures.insert(op, times);
    }

    fn injected(&self, op: LeaderOp) -> Result<(), ReplicationError> {
        let mut state = self.state.lock().unwrap();
        match state.failures.get_mut(&op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(ReplicationError::transport(format!("{op:?}"), "injected failure"))
            }
            _ => Ok(()),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_rev(&self) -> RevisionId {
        RevisionId::new(self.rev.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    /// Create a collection and log its creation.
    pub fn add_collection(&self, name: &str) -> CollectionSpec {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let spec = CollectionSpec::new(id.clone(), format!("h/{id}"), name);
        let tick = self.next_tick();
        let mut state = self.state.lock().unwrap();
        state.collections.push(MockCollection {
            spec: spec.clone(),
            indexes: Vec::new(),
            docs: BTreeMap::new(),
        });
        state.wal.push(WalMarker {
            tick,
            kind: MarkerType::CollectionCreate,
            tid: None,
            cuid: Some(spec.guid.clone()),
            cname: Some(name.to_string()),
            data: serde_json::to_value(&spec).unwrap(),
        });
        spec
    }

    pub fn add_index(&self, collection: &str, index: IndexSpec) {
        let tick = self.next_tick();
        let mut state = self.state.lock().unwrap();
        let coll = state.collection_mut(collection);
        coll.indexes.push(index.clone());
        let cuid = coll.spec.guid.clone();
        state.wal.push(WalMarker {
            tick,
            kind: MarkerType::IndexCreate,
            tid: None,
            cuid: Some(cuid),
            cname: Some(collection.to_string()),
            data: json!({ "data": serde_json::to_value(&index).unwrap() }),
        });
    }

    pub fn add_view(&self, view: ViewSpec) {
        self.state.lock().unwrap().views.push(view);
    }

    /// Write a document with a fresh revision.
    pub fn put(&self, collection: &str, key: &str, body: Value) -> Document {
        self.put_with_tid(None, collection, key, body)
    }

    /// Write a document as part of transaction `tid`. The caller logs the
    /// start and commit markers with [`MockLeader::push_marker`].
    pub fn put_in_transaction(&self, tid: &str, collection: &str, key: &str, body: Value) -> Document {
        self.put_with_tid(Some(tid), collection, key, body)
    }

    fn put_with_tid(&self, tid: Option<&str>, collection: &str, key: &str, body: Value) -> Document {
        let doc = Document::new(key, self.next_rev(), body);
        let tick = self.next_tick();
        let mut state = self.state.lock().unwrap();
        let coll = state.collection_mut(collection);
        coll.docs.insert(key.to_string(), doc.clone());
        let cuid = coll.spec.guid.clone();
        state.wal.push(WalMarker {
            tick,
            kind: MarkerType::Document,
            tid: tid.map(str::to_string),
            cuid: Some(cuid),
            cname: Some(collection.to_string()),
            data: doc.body.clone(),
        });
        doc
    }

    /// Write many documents `{prefix}{i}` with a numeric `n` attribute.
    pub fn put_many(&self, collection: &str, prefix: &str, count: usize) {
        for i in 0..count {
            self.put(collection, &format!("{prefix}{i}"), json!({ "n": i }));
        }
    }

    pub fn remove(&self, collection: &str, key: &str) {
        let tick = self.next_tick();
        let mut state = self.state.lock().unwrap();
        let coll = state.collection_mut(collection);
        let removed = coll.docs.remove(key).unwrap_or_else(|| panic!("no document {key}"));
        let cuid = coll.spec.guid.clone();
        state.wal.push(WalMarker {
            tick,
            kind: MarkerType::Remove,
            tid: None,
            cuid: Some(cuid),
            cname: Some(collection.to_string()),
            data: json!({ "_key": key, "_rev": removed.rev.to_hlc() }),
        });
    }

    /// Append a raw marker at the next tick and return that tick.
    pub fn push_marker(&self, kind: MarkerType, tid: Option<&str>, cname: Option<&str>, data: Value) -> u64 {
        let tick = self.next_tick();
        self.state.lock().unwrap().wal.push(WalMarker {
            tick,
            kind,
            tid: tid.map(str::to_string),
            cuid: None,
            cname: cname.map(str::to_string),
            data,
        });
        tick
    }

    /// Drop WAL markers at or below `tick`.
    pub fn prune_wal(&self, tick: u64) {
        let mut state = self.state.lock().unwrap();
        state.wal.retain(|m| m.tick > tick);
        state.pruned_floor = state.pruned_floor.max(tick);
    }

    /// Documents of a collection, ordered by key.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        let state = self.state.lock().unwrap();
        state
            .collection(collection)
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn document(&self, collection: &str, key: &str) -> Option<Document> {
        let state = self.state.lock().unwrap();
        state.collection(collection).ok()?.docs.get(key).cloned()
    }

    pub fn inventory_spec(&self, collection: &str) -> Option<CollectionSpec> {
        let state = self.state.lock().unwrap();
        state.collection(collection).ok().map(|c| c.spec.clone())
    }

    pub fn open_listings(&self) -> usize {
        self.state.lock().unwrap().listings.len()
    }

    fn sorted_revisions(&self, collection: &str) -> Result<Vec<(RevisionId, Document)>, ReplicationError> {
        let state = self.state.lock().unwrap();
        let mut revs: Vec<_> = state
            .collection(collection)?
            .docs
            .values()
            .map(|d| (d.rev, d.clone()))
            .collect();
        revs.sort_by_key(|(rev, _)| *rev);
        Ok(revs)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LeaderClient
// ═══════════════════════════════════════════════════════════════════════════════

impl LeaderClient for MockLeader {
    fn leader_info(&self) -> LeaderFuture<'_, LeaderInfo> {
        Box::pin(async move {
            self.injected(LeaderOp::LeaderInfo)?;
            Ok(LeaderInfo {
                server_id: "PRMR-mock".to_string(),
                engine: "rocksdb".to_string(),
                version: *self.version.lock().unwrap(),
            })
        })
    }

    fn start_batch(&self, _ttl: Duration) -> LeaderFuture<'_, LeaderBatch> {
        Box::pin(async move {
            self.injected(LeaderOp::StartBatch)?;
            let n = self.batches_started.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(LeaderBatch {
                id: format!("batch-{n}"),
                last_tick: self.current_tick(),
            })
        })
    }

    fn extend_batch(&self, _batch_id: &str, _ttl: Duration) -> LeaderFuture<'_, ()> {
        Box::pin(async move {
            self.batch_extends.fetch_add(1, Ordering::SeqCst);
            self.injected(LeaderOp::ExtendBatch)
        })
    }

    fn finish_batch(&self, _batch_id: &str) -> LeaderFuture<'_, ()> {
        Box::pin(async move {
            self.batches_finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn inventory(&self, _batch_id: &str, collection: Option<&str>) -> LeaderFuture<'_, Inventory> {
        let collection = collection.map(str::to_string);
        Box::pin(async move {
            self.injected(LeaderOp::Inventory)?;
            let state = self.state.lock().unwrap();
            let collections = state
                .collections
                .iter()
                .filter(|c| collection.as_deref().map_or(true, |n| n == c.spec.name))
                .map(|c| InventoryCollection {
                    parameters: c.spec.clone(),
                    indexes: c.indexes.clone(),
                })
                .collect();
            let views = if collection.is_some() { Vec::new() } else { state.views.clone() };
            Ok(Inventory { collections, views })
        })
    }

    fn dump(&self, collection: &str, _batch_id: &str, from: u64, _chunk_size: u64) -> LeaderFuture<'_, DumpChunk> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.dump_requests.fetch_add(1, Ordering::SeqCst);
            let delay = *self.dump_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.injected(LeaderOp::Dump)?;
            let page = self.dump_page.load(Ordering::SeqCst);
            let state = self.state.lock().unwrap();
            let docs = &state.collection(&collection)?.docs;
            let start = from as usize;
            let documents: Vec<Document> = docs.values().skip(start).take(page).cloned().collect();
            let end = start + documents.len();
            Ok(DumpChunk {
                check_more: end < docs.len(),
                last_included: end as u64,
                documents,
            })
        })
    }

    fn create_key_listing(&self, collection: &str, _batch_id: &str) -> LeaderFuture<'_, KeyListing> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.injected(LeaderOp::KeyListing)?;
            let n = self.listings_created.fetch_add(1, Ordering::SeqCst) + 1;
            let mut state = self.state.lock().unwrap();
            let docs: Vec<Document> = state.collection(&collection)?.docs.values().cloned().collect();
            let listing = KeyListing {
                id: format!("listing-{n}"),
                collection: collection.clone(),
                count: docs.len() as u64,
            };
            state.listings.insert(listing.id.clone(), docs);
            Ok(listing)
        })
    }

    fn listing_keys(&self, listing: &KeyListing, offset: u64, limit: u64) -> LeaderFuture<'_, Vec<KeyRevision>> {
        let id = listing.id.clone();
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            let docs = state
                .listings
                .get(&id)
                .ok_or_else(|| ReplicationError::protocol(format!("unknown listing {id}")))?;
            Ok(docs
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .map(|d| (d.key.clone(), d.rev))
                .collect())
        })
    }

    fn listing_documents(&self, listing: &KeyListing, keys: &[String]) -> LeaderFuture<'_, Vec<Document>> {
        let id = listing.id.clone();
        let keys = keys.to_vec();
        Box::pin(async move {
            self.revisions_requested.fetch_add(keys.len(), Ordering::SeqCst);
            let state = self.state.lock().unwrap();
            let docs = state
                .listings
                .get(&id)
                .ok_or_else(|| ReplicationError::protocol(format!("unknown listing {id}")))?;
            Ok(keys
                .iter()
                .filter_map(|k| docs.iter().find(|d| &d.key == k).cloned())
                .collect())
        })
    }

    fn release_key_listing(&self, listing: &KeyListing) -> LeaderFuture<'_, ()> {
        let id = listing.id.clone();
        Box::pin(async move {
            self.listings_released.fetch_add(1, Ordering::SeqCst);
            self.state.lock().unwrap().listings.remove(&id);
            Ok(())
        })
    }

    fn revision_tree(&self, collection: &str, _batch_id: &str) -> LeaderFuture<'_, RevisionTree> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.injected(LeaderOp::RevisionTree)?;
            let revs = self.sorted_revisions(&collection)?;
            Ok(RevisionTree::from_revisions(DEFAULT_DEPTH, revs.into_iter().map(|(rev, _)| rev)))
        })
    }

    fn revision_ranges(
        &self,
        collection: &str,
        _batch_id: &str,
        ranges: &[RevisionRange],
        resume: Option<RevisionId>,
    ) -> LeaderFuture<'_, RangesResponse> {
        let collection = collection.to_string();
        let ranges = ranges.to_vec();
        Box::pin(async move {
            self.range_requests.fetch_add(1, Ordering::SeqCst);
            self.injected(LeaderOp::RevisionRanges)?;
            let revs = self.sorted_revisions(&collection)?;
            let limit = self.max_revisions_per_response.load(Ordering::SeqCst);

            let mut response = RangesResponse::default();
            let mut used = 0usize;
            for (i, range) in ranges.iter().enumerate() {
                let low = match (i, resume) {
                    (0, Some(r)) => r.max(range.low),
                    _ => range.low,
                };
                let in_range: Vec<RevisionId> = revs
                    .iter()
                    .map(|(rev, _)| *rev)
                    .filter(|rev| *rev >= low && *rev <= range.high)
                    .collect();
                let take = limit.saturating_sub(used).max(1);
                if take >= in_range.len() {
                    used += in_range.len();
                    response.ranges.push(in_range);
                    continue;
                }
                response.resume = Some(in_range[take]);
                response.ranges.push(in_range[..take].to_vec());
                break;
            }
            Ok(response)
        })
    }

    fn revision_documents(
        &self,
        collection: &str,
        _batch_id: &str,
        revisions: &[RevisionId],
    ) -> LeaderFuture<'_, Vec<Document>> {
        let collection = collection.to_string();
        let revisions = revisions.to_vec();
        Box::pin(async move {
            self.revisions_requested.fetch_add(revisions.len(), Ordering::SeqCst);
            self.injected(LeaderOp::RevisionDocuments)?;
            let by_rev: HashMap<RevisionId, Document> = self.sorted_revisions(&collection)?.into_iter().collect();
            Ok(revisions.iter().filter_map(|rev| by_rev.get(rev).cloned()).collect())
        })
    }

    fn tail_wal(&self, from: u64, _chunk_size: u64, collection: Option<&str>) -> LeaderFuture<'_, WalChunk> {
        let collection = collection.map(str::to_string);
        Box::pin(async move {
            self.wal_requests.fetch_add(1, Ordering::SeqCst);
            self.injected(LeaderOp::TailWal)?;
            let page = self.wal_page.load(Ordering::SeqCst);
            let state = self.state.lock().unwrap();

            let mut chunk = WalChunk {
                from_present: from >= state.pruned_floor,
                last_tick: self.current_tick(),
                last_scanned: from,
                ..WalChunk::default()
            };
            let mut pending = state.wal.iter().filter(|m| m.tick > from).peekable();
            while let Some(marker) = pending.next() {
                chunk.last_scanned = marker.tick;
                let wanted = match (&collection, &marker.cname) {
                    (Some(scope), Some(name)) => scope == name,
                    _ => true,
                };
                if wanted {
                    chunk.last_included = marker.tick;
                    chunk.markers.push(marker.clone());
                }
                if chunk.markers.len() >= page {
                    chunk.check_more = pending.peek().is_some();
                    break;
                }
            }
            Ok(chunk)
        })
    }
}
