//! In-memory [`StorageEngine`] for standalone use and tests.
//!
//! Keeps documents in ordered maps, enforces the primary key and unique
//! secondary indexes, computes revision trees on demand and counts every
//! mutating call. Lock timeouts can be injected to exercise the retry paths.

use super::{
    CollectionSpec, Document, IndexSpec, LocalCollection, StorageEngine, StorageError, StorageFuture,
    StorageResult, ViewSpec,
};
use crate::revision::RevisionId;
use crate::revision_tree::{RevisionTree, DEFAULT_DEPTH};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::trace;

/// Snapshot of operation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStorageStats {
    pub inserts: u64,
    pub replaces: u64,
    pub removes: u64,
    pub truncates: u64,
    pub collections_created: u64,
    pub collections_dropped: u64,
    pub indexes_created: u64,
    pub views_created: u64,
    pub intermediate_commits: u64,
    pub wal_flushes: u64,
}

#[derive(Default)]
struct Counters {
    inserts: AtomicU64,
    replaces: AtomicU64,
    removes: AtomicU64,
    truncates: AtomicU64,
    collections_created: AtomicU64,
    collections_dropped: AtomicU64,
    indexes_created: AtomicU64,
    views_created: AtomicU64,
    intermediate_commits: AtomicU64,
    wal_flushes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct MemCollection {
    info: LocalCollection,
    docs: BTreeMap<String, Document>,
    by_rev: BTreeSet<(RevisionId, String)>,
    counter: u64,
}

impl MemCollection {
    fn index_values(doc: &Document, index: &IndexSpec) -> Option<Vec<Value>> {
        let values: Vec<Value> = index
            .fields
            .iter()
            .map(|f| doc.field(f).cloned().unwrap_or(Value::Null))
            .collect();
        if index.sparse && values.iter().any(Value::is_null) {
            None
        } else {
            Some(values)
        }
    }

    /// First unique index on which `doc` collides with a document other
    /// than `doc.key`.
    fn unique_conflict(&self, doc: &Document) -> Option<StorageError> {
        for index in self.info.indexes.iter().filter(|i| i.unique && !i.is_builtin()) {
            let Some(wanted) = Self::index_values(doc, index) else {
                continue;
            };
            let hit = self.docs.values().find(|other| {
                other.key != doc.key && Self::index_values(other, index).as_ref() == Some(&wanted)
            });
            if let Some(other) = hit {
                return Some(StorageError::UniqueConstraintViolated {
                    index: index.id.clone(),
                    conflicting_key: other.key.clone(),
                });
            }
        }
        None
    }

    fn put(&mut self, doc: Document) -> Option<Document> {
        self.by_rev.insert((doc.rev, doc.key.clone()));
        let previous = self.docs.insert(doc.key.clone(), doc);
        if let Some(prev) = &previous {
            self.by_rev.remove(&(prev.rev, prev.key.clone()));
        }
        previous
    }
}

#[derive(Default)]
struct Inner {
    collections: BTreeMap<String, MemCollection>,
    views: BTreeMap<String, ViewSpec>,
}

impl Inner {
    fn collection(&self, name: &str) -> StorageResult<&MemCollection> {
        self.collections
            .get(name)
            .ok_or_else(|| StorageError::CollectionNotFound(name.to_string()))
    }

    fn collection_mut(&mut self, name: &str) -> StorageResult<&mut MemCollection> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| StorageError::CollectionNotFound(name.to_string()))
    }
}

/// Storage engine backed by ordered in-memory maps.
pub struct MemoryStorage {
    inner: RwLock<Inner>,
    revision_trees: bool,
    counters: Counters,
    pending_lock_timeouts: AtomicUsize,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            revision_trees: true,
            counters: Counters::default(),
            pending_lock_timeouts: AtomicUsize::new(0),
        }
    }

    /// Collections created by this instance report no revision tree, as on
    /// engines or collection formats that do not maintain one.
    pub fn without_revision_trees() -> Self {
        Self {
            revision_trees: false,
            ..Self::new()
        }
    }

    /// The next `n` mutating calls fail with `LockTimeout`.
    pub fn inject_lock_timeouts(&self, n: usize) {
        self.pending_lock_timeouts.store(n, Ordering::SeqCst);
    }

    fn take_lock_timeout(&self, what: &str) -> StorageResult<()> {
        let took = self
            .pending_lock_timeouts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            Err(StorageError::LockTimeout(what.to_string()))
        } else {
            Ok(())
        }
    }

    pub fn stats(&self) -> MemoryStorageStats {
        let c = &self.counters;
        MemoryStorageStats {
            inserts: c.inserts.load(Ordering::Relaxed),
            replaces: c.replaces.load(Ordering::Relaxed),
            removes: c.removes.load(Ordering::Relaxed),
            truncates: c.truncates.load(Ordering::Relaxed),
            collections_created: c.collections_created.load(Ordering::Relaxed),
            collections_dropped: c.collections_dropped.load(Ordering::Relaxed),
            indexes_created: c.indexes_created.load(Ordering::Relaxed),
            views_created: c.views_created.load(Ordering::Relaxed),
            intermediate_commits: c.intermediate_commits.load(Ordering::Relaxed),
            wal_flushes: c.wal_flushes.load(Ordering::Relaxed),
        }
    }

    /// All documents of a collection, ascending by key.
    pub async fn documents(&self, collection: &str) -> Vec<Document> {
        let inner = self.inner.read().await;
        inner
            .collections
            .get(collection)
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of documents actually stored (as opposed to the counter).
    pub async fn stored_count(&self, collection: &str) -> usize {
        let inner = self.inner.read().await;
        inner.collections.get(collection).map_or(0, |c| c.docs.len())
    }

    fn local_info(&self, spec: &CollectionSpec) -> LocalCollection {
        LocalCollection {
            id: spec.id.clone(),
            guid: spec.guid.clone(),
            name: spec.name.clone(),
            kind: spec.kind,
            is_system: spec.is_system,
            indexes: vec![IndexSpec {
                id: "0".to_string(),
                kind: "primary".to_string(),
                fields: vec!["_key".to_string()],
                unique: true,
                sparse: false,
                name: Some("primary".to_string()),
            }],
            supports_revision_tree: self.revision_trees,
        }
    }
}

impl StorageEngine for MemoryStorage {
    fn collections(&self) -> StorageFuture<'_, Vec<LocalCollection>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner.collections.values().map(|c| c.info.clone()).collect())
        })
    }

    fn views(&self) -> StorageFuture<'_, Vec<ViewSpec>> {
        Box::pin(async move { Ok(self.inner.read().await.views.values().cloned().collect()) })
    }

    fn create_collection(&self, spec: &CollectionSpec) -> StorageFuture<'_, LocalCollection> {
        let spec = spec.clone();
        Box::pin(async move {
            self.take_lock_timeout(&spec.name)?;
            let mut inner = self.inner.write().await;
            if inner.collections.contains_key(&spec.name) {
                return Err(StorageError::DuplicateName(spec.name));
            }
            let info = self.local_info(&spec);
            inner.collections.insert(
                spec.name.clone(),
                MemCollection {
                    info: info.clone(),
                    docs: BTreeMap::new(),
                    by_rev: BTreeSet::new(),
                    counter: 0,
                },
            );
            bump(&self.counters.collections_created);
            Ok(info)
        })
    }

    fn drop_collection(&self, name: &str) -> StorageFuture<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            self.take_lock_timeout(&name)?;
            let mut inner = self.inner.write().await;
            inner
                .collections
                .remove(&name)
                .ok_or(StorageError::CollectionNotFound(name))?;
            bump(&self.counters.collections_dropped);
            Ok(())
        })
    }

    fn rename_collection(&self, from: &str, to: &str) -> StorageFuture<'_, ()> {
        let from = from.to_string();
        let to = to.to_string();
        Box::pin(async move {
            self.take_lock_timeout(&from)?;
            let mut inner = self.inner.write().await;
            if inner.collections.contains_key(&to) {
                return Err(StorageError::DuplicateName(to));
            }
            let mut coll = inner
                .collections
                .remove(&from)
                .ok_or(StorageError::CollectionNotFound(from))?;
            coll.info.name = to.clone();
            inner.collections.insert(to, coll);
            Ok(())
        })
    }

    fn truncate_collection(&self, name: &str) -> StorageFuture<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            self.take_lock_timeout(&name)?;
            let mut inner = self.inner.write().await;
            let coll = inner.collection_mut(&name)?;
            coll.docs.clear();
            coll.by_rev.clear();
            coll.counter = 0;
            bump(&self.counters.truncates);
            Ok(())
        })
    }

    fn create_index(&self, collection: &str, index: &IndexSpec) -> StorageFuture<'_, ()> {
        let collection = collection.to_string();
        let index = index.clone();
        Box::pin(async move {
            self.take_lock_timeout(&collection)?;
            let mut inner = self.inner.write().await;
            let coll = inner.collection_mut(&collection)?;
            if coll.info.indexes.iter().any(|i| i.id == index.id) {
                return Err(StorageError::DuplicateName(format!("{collection}/{}", index.id)));
            }
            coll.info.indexes.push(index);
            bump(&self.counters.indexes_created);
            Ok(())
        })
    }

    fn drop_index(&self, collection: &str, index_id: &str) -> StorageFuture<'_, ()> {
        let collection = collection.to_string();
        let index_id = index_id.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            let coll = inner.collection_mut(&collection)?;
            let before = coll.info.indexes.len();
            coll.info.indexes.retain(|i| i.id != index_id);
            if coll.info.indexes.len() == before {
                return Err(StorageError::IndexNotFound(format!("{collection}/{index_id}")));
            }
            Ok(())
        })
    }

    fn create_view(&self, view: &ViewSpec) -> StorageFuture<'_, ()> {
        let view = view.clone();
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            if inner.views.contains_key(&view.name) {
                return Err(StorageError::DuplicateName(view.name));
            }
            inner.views.insert(view.name.clone(), view);
            bump(&self.counters.views_created);
            Ok(())
        })
    }

    fn drop_view(&self, name: &str) -> StorageFuture<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            inner
                .views
                .remove(&name)
                .map(|_| ())
                .ok_or(StorageError::ViewNotFound(name))
        })
    }

    fn update_view(&self, view: &ViewSpec) -> StorageFuture<'_, ()> {
        let view = view.clone();
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            match inner.views.get_mut(&view.name) {
                Some(existing) => {
                    existing.properties = view.properties;
                    Ok(())
                }
                None => Err(StorageError::ViewNotFound(view.name)),
            }
        })
    }

    fn document_count(&self, collection: &str) -> StorageFuture<'_, u64> {
        let collection = collection.to_string();
        Box::pin(async move { Ok(self.inner.read().await.collection(&collection)?.counter) })
    }

    fn adjust_document_count(&self, collection: &str, delta: i64) -> StorageFuture<'_, ()> {
        let collection = collection.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            let coll = inner.collection_mut(&collection)?;
            coll.counter = coll.counter.saturating_add_signed(delta);
            Ok(())
        })
    }

    fn lookup(&self, collection: &str, key: &str) -> StorageFuture<'_, Option<Document>> {
        let collection = collection.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner.collection(&collection)?.docs.get(&key).cloned())
        })
    }

    fn insert(&self, collection: &str, doc: Document) -> StorageFuture<'_, ()> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.take_lock_timeout(&collection)?;
            let mut inner = self.inner.write().await;
            let coll = inner.collection_mut(&collection)?;
            if coll.docs.contains_key(&doc.key) {
                return Err(StorageError::UniqueConstraintViolated {
                    index: "primary".to_string(),
                    conflicting_key: doc.key,
                });
            }
            if let Some(conflict) = coll.unique_conflict(&doc) {
                return Err(conflict);
            }
            trace!(collection = %collection, key = %doc.key, "insert");
            coll.put(doc);
            coll.counter += 1;
            bump(&self.counters.inserts);
            Ok(())
        })
    }

    fn replace(&self, collection: &str, doc: Document) -> StorageFuture<'_, ()> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.take_lock_timeout(&collection)?;
            let mut inner = self.inner.write().await;
            let coll = inner.collection_mut(&collection)?;
            if !coll.docs.contains_key(&doc.key) {
                return Err(StorageError::DocumentNotFound(doc.key));
            }
            if let Some(conflict) = coll.unique_conflict(&doc) {
                return Err(conflict);
            }
            coll.put(doc);
            bump(&self.counters.replaces);
            Ok(())
        })
    }

    fn remove(&self, collection: &str, key: &str) -> StorageFuture<'_, ()> {
        let collection = collection.to_string();
        let key = key.to_string();
        Box::pin(async move {
            self.take_lock_timeout(&collection)?;
            let mut inner = self.inner.write().await;
            let coll = inner.collection_mut(&collection)?;
            let doc = coll
                .docs
                .remove(&key)
                .ok_or(StorageError::DocumentNotFound(key))?;
            coll.by_rev.remove(&(doc.rev, doc.key));
            coll.counter = coll.counter.saturating_sub(1);
            bump(&self.counters.removes);
            Ok(())
        })
    }

    fn revisions_in_range(
        &self,
        collection: &str,
        low: RevisionId,
        high: RevisionId,
    ) -> StorageFuture<'_, Vec<(RevisionId, String)>> {
        let collection = collection.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            let coll = inner.collection(&collection)?;
            Ok(coll
                .by_rev
                .range((low, String::new())..)
                .take_while(|(rev, _)| *rev <= high)
                .cloned()
                .collect())
        })
    }

    fn keys_with_revisions(&self, collection: &str) -> StorageFuture<'_, Vec<(String, RevisionId)>> {
        let collection = collection.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            let coll = inner.collection(&collection)?;
            Ok(coll.docs.values().map(|d| (d.key.clone(), d.rev)).collect())
        })
    }

    fn revision_tree(&self, collection: &str) -> StorageFuture<'_, Option<RevisionTree>> {
        let collection = collection.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            let coll = inner.collection(&collection)?;
            if !coll.info.supports_revision_tree {
                return Ok(None);
            }
            Ok(Some(RevisionTree::from_revisions(
                DEFAULT_DEPTH,
                coll.by_rev.iter().map(|(rev, _)| *rev),
            )))
        })
    }

    fn intermediate_commit(&self, collection: &str) -> StorageFuture<'_, ()> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.inner.read().await.collection(&collection)?;
            bump(&self.counters.intermediate_commits);
            Ok(())
        })
    }

    fn flush_wal(&self, _wait_for_sync: bool) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            bump(&self.counters.wal_flushes);
            Ok(())
        })
    }
}
