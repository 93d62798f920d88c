// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Apply and schema logic shared by the initial syncer and the tailer.
//!
//! Everything here is idempotent: replication replays markers after
//! restarts and during the catch-up/finalize hand-off, so applying the same
//! insert or remove twice must end in the same state as applying it once.
//!
//! # Conflict Resolution
//!
//! ```text
//! insert(doc)
//!   ├─ ok ───────────────────────────────────────────▶ Inserted
//!   ├─ primary key taken
//!   │    ├─ same revision ─────────────────────────▶ Unchanged
//!   │    └─ other revision ──▶ replace(doc) ─────────▶ Replaced
//!   └─ unique index taken by other key
//!        └─ remove(other) ──▶ retry
//! ```
//!
//! Each retry can clear at most one unique secondary index, so the loop is
//! bounded by `1 + unique_index_count` attempts.

use crate::config::ReplicationConfiguration;
use crate::error::{ReplicationError, Result};
use crate::job::AbortSignal;
use crate::leader::{LeaderClient, LeaderInfo, WalMarker};
use crate::metrics;
use crate::revision::RevisionId;
use crate::storage::{
    CollectionSpec, Document, IndexSpec, LocalCollection, StorageEngine, StorageError, StorageResult, ViewSpec,
};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// How a collection or view is referred to by the leader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectRef {
    pub guid: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
}

impl ObjectRef {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    fn non_empty(s: &str) -> Option<String> {
        (!s.is_empty()).then(|| s.to_string())
    }

    pub fn of_spec(spec: &CollectionSpec) -> Self {
        Self {
            guid: Self::non_empty(&spec.guid),
            id: Self::non_empty(&spec.id),
            name: Self::non_empty(&spec.name),
        }
    }

    pub fn of_view(view: &ViewSpec) -> Self {
        Self {
            guid: Self::non_empty(&view.guid),
            id: Self::non_empty(&view.id),
            name: Self::non_empty(&view.name),
        }
    }

    pub fn of_marker(marker: &WalMarker) -> Self {
        Self {
            guid: marker.cuid.clone().filter(|s| !s.is_empty()),
            id: marker
                .data
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            name: marker.cname.clone().filter(|s| !s.is_empty()),
        }
    }

    fn describe(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.guid.clone())
            .or_else(|| self.id.clone())
            .unwrap_or_else(|| "<unnamed>".to_string())
    }
}

/// A single document mutation from a dump, diff or WAL marker.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOp {
    Insert(Document),
    Remove { key: String },
}

/// What [`SyncerCore::apply_marker`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Replaced,
    /// Same key and revision already present.
    Unchanged,
    Removed,
    /// Remove of a document that was not there.
    Absent,
}

impl ApplyOutcome {
    pub fn is_write(self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced | Self::Removed)
    }
}

/// Shared state and logic of one sync run.
pub struct SyncerCore {
    config: Arc<ReplicationConfiguration>,
    storage: Arc<dyn StorageEngine>,
    leader: Arc<dyn LeaderClient>,
    abort: AbortSignal,
    leader_info: OnceCell<LeaderInfo>,
    conflict_removals: AtomicU64,
}

impl std::fmt::Debug for SyncerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncerCore")
            .field("endpoint", &self.config.endpoint)
            .field("database", &self.config.database)
            .field("leader_info", &self.leader_info.get())
            .finish()
    }
}

impl SyncerCore {
    pub fn new(
        config: Arc<ReplicationConfiguration>,
        storage: Arc<dyn StorageEngine>,
        leader: Arc<dyn LeaderClient>,
        abort: AbortSignal,
    ) -> Self {
        Self {
            config,
            storage,
            leader,
            abort,
            leader_info: OnceCell::new(),
            conflict_removals: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Arc<ReplicationConfiguration> {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    pub fn leader(&self) -> &Arc<dyn LeaderClient> {
        &self.leader
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Leader identity, fetched on first use and cached for the run.
    pub async fn leader_info(&self) -> Result<&LeaderInfo> {
        self.leader_info
            .get_or_try_init(|| async {
                let info = self.abort.guard(self.leader.leader_info()).await?;
                info!(
                    leader = %info.server_id,
                    engine = %info.engine,
                    version = ?info.version,
                    "Connected to leader"
                );
                Ok::<_, ReplicationError>(info)
            })
            .await
    }

    /// Local documents removed so far to clear unique index conflicts.
    pub fn conflict_removals(&self) -> u64 {
        self.conflict_removals.load(Ordering::Relaxed)
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.config.is_collection_excluded(name)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Storage calls with lock-timeout retry
    // ═══════════════════════════════════════════════════════════════════════

    /// Run a storage call, retrying lock timeouts with a fixed delay.
    ///
    /// The outer `Err` is abort; the inner result is the storage outcome
    /// after retries, so callers can still match on [`StorageError`].
    pub async fn retry_locked<T, F, Fut>(&self, what: &str, mut op: F) -> Result<StorageResult<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Err(StorageError::LockTimeout(msg)) if retries < self.config.lock_timeout_retries => {
                    retries += 1;
                    warn!(what, retries, error = %msg, "Lock timeout, retrying");
                    self.abort.sleep(self.config.lock_timeout_retry_delay()).await?;
                }
                other => return Ok(other),
            }
        }
    }

    async fn storage_call<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        Ok(self.retry_locked(what, op).await??)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Document apply
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply one document mutation to `collection`. Safe to replay.
    pub async fn apply_marker(&self, collection: &LocalCollection, op: DocumentOp) -> Result<ApplyOutcome> {
        match op {
            DocumentOp::Insert(doc) => self.apply_insert(collection, doc).await,
            DocumentOp::Remove { key } => self.remove_document(&collection.name, &key).await,
        }
    }

    async fn apply_insert(&self, collection: &LocalCollection, doc: Document) -> Result<ApplyOutcome> {
        let name = collection.name.as_str();
        let bound = 1 + collection.unique_index_count();
        let mut attempts = 0;
        let mut use_replace = false;
        let mut primary_resolved = false;

        loop {
            attempts += 1;
            let result = if use_replace {
                self.retry_locked(name, || self.storage.replace(name, doc.clone())).await?
            } else {
                self.retry_locked(name, || self.storage.insert(name, doc.clone())).await?
            };

            let conflicting_key = match result {
                Ok(()) if use_replace => return Ok(ApplyOutcome::Replaced),
                Ok(()) => return Ok(ApplyOutcome::Inserted),
                Err(StorageError::UniqueConstraintViolated { conflicting_key, .. }) => conflicting_key,
                // Vanished between lookup and replace: insert instead.
                Err(StorageError::DocumentNotFound(_)) if use_replace && !primary_resolved => {
                    use_replace = false;
                    primary_resolved = true;
                    attempts -= 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if conflicting_key == doc.key && !primary_resolved {
                // The primary index is not one of the counted unique indexes.
                primary_resolved = true;
                attempts -= 1;
                let existing = self.storage_call(name, || self.storage.lookup(name, &doc.key)).await?;
                match existing {
                    Some(local) if local.rev == doc.rev => return Ok(ApplyOutcome::Unchanged),
                    Some(_) => use_replace = true,
                    None => use_replace = false,
                }
                continue;
            }

            if attempts >= bound {
                return Err(ReplicationError::UniqueConflict {
                    collection: name.to_string(),
                    key: doc.key.clone(),
                    attempts,
                });
            }

            debug!(
                collection = %name,
                key = %doc.key,
                conflicting_key = %conflicting_key,
                attempt = attempts,
                "Unique constraint conflict, removing local document"
            );
            if self.remove_document(name, &conflicting_key).await? == ApplyOutcome::Removed {
                self.conflict_removals.fetch_add(1, Ordering::Relaxed);
            }
            metrics::record_conflict_resolution(name);
        }
    }

    /// Remove a document; a missing document counts as success.
    pub async fn remove_document(&self, collection: &str, key: &str) -> Result<ApplyOutcome> {
        match self
            .retry_locked(collection, || self.storage.remove(collection, key))
            .await?
        {
            Ok(()) => Ok(ApplyOutcome::Removed),
            Err(StorageError::DocumentNotFound(_)) => Ok(ApplyOutcome::Absent),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove `key` only if it still carries `rev`.
    ///
    /// A diff schedules removals by revision; by the time they are applied
    /// the key may already hold the leader's version.
    pub async fn remove_revision(&self, collection: &str, key: &str, rev: RevisionId) -> Result<ApplyOutcome> {
        let current = self
            .storage_call(collection, || self.storage.lookup(collection, key))
            .await?;
        match current {
            Some(doc) if doc.rev == rev => self.remove_document(collection, key).await,
            Some(_) => Ok(ApplyOutcome::Unchanged),
            None => Ok(ApplyOutcome::Absent),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Resolution
    // ═══════════════════════════════════════════════════════════════════════

    /// Find the local collection the leader means: globally unique id first,
    /// then name, then numeric id. A name match beats an id match because a
    /// local rename is newer than a stale id.
    pub async fn resolve_collection(&self, reference: &ObjectRef) -> Result<Option<LocalCollection>> {
        let locals = self.storage.collections().await?;

        if let Some(guid) = &reference.guid {
            if let Some(found) = locals.iter().find(|c| &c.guid == guid) {
                return Ok(Some(found.clone()));
            }
        }
        let by_name = reference
            .name
            .as_ref()
            .and_then(|n| locals.iter().find(|c| &c.name == n));
        let by_id = reference
            .id
            .as_ref()
            .and_then(|id| locals.iter().find(|c| &c.id == id));

        if let (Some(n), Some(i)) = (by_name, by_id) {
            if n.name != i.name {
                debug!(name = %n.name, id_match = %i.name, "Collection id and name disagree, using name");
            }
        }
        Ok(by_name.or(by_id).cloned())
    }

    /// Same rule as [`SyncerCore::resolve_collection`], for views.
    pub async fn resolve_view(&self, reference: &ObjectRef) -> Result<Option<ViewSpec>> {
        let views = self.storage.views().await?;

        if let Some(guid) = &reference.guid {
            if let Some(found) = views.iter().find(|v| !v.guid.is_empty() && &v.guid == guid) {
                return Ok(Some(found.clone()));
            }
        }
        let by_name = reference
            .name
            .as_ref()
            .and_then(|n| views.iter().find(|v| &v.name == n));
        let by_id = reference
            .id
            .as_ref()
            .and_then(|id| views.iter().find(|v| &v.id == id));
        Ok(by_name.or(by_id).cloned())
    }

    /// Resolve or fail with `CollectionNotFound`.
    pub async fn require_collection(&self, reference: &ObjectRef) -> Result<LocalCollection> {
        self.resolve_collection(reference)
            .await?
            .ok_or_else(|| ReplicationError::CollectionNotFound(reference.describe()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Schema
    // ═══════════════════════════════════════════════════════════════════════

    /// Make a collection shaped like `spec` exist.
    ///
    /// A local collection with the same globally unique id but another name
    /// is renamed. A same-named collection of another shape is dropped and
    /// recreated, or only truncated if it is a system collection.
    pub async fn create_collection(&self, spec: &CollectionSpec) -> Result<LocalCollection> {
        let locals = self.storage.collections().await?;
        let by_name = locals.iter().find(|c| c.name == spec.name);

        if by_name.is_none() && !spec.guid.is_empty() {
            if let Some(renamed) = locals.iter().find(|c| c.guid == spec.guid) {
                info!(from = %renamed.name, to = %spec.name, "Renaming collection to match leader");
                self.rename_collection(&renamed.name, &spec.name).await?;
                return self.require_collection(&ObjectRef::by_name(&spec.name)).await;
            }
        }

        if let Some(local) = by_name {
            if local.matches(spec) {
                return Ok(local.clone());
            }
            if local.is_system {
                warn!(collection = %spec.name, "System collection differs from leader, truncating instead of dropping");
                self.truncate_collection(&spec.name).await?;
                return Ok(local.clone());
            }
            warn!(collection = %spec.name, "Collection differs from leader, recreating");
            self.drop_collection(&spec.name).await?;
        }

        let name = spec.name.as_str();
        match self
            .retry_locked(name, || self.storage.create_collection(spec))
            .await?
        {
            Ok(created) => {
                info!(collection = %name, "Created collection");
                Ok(created)
            }
            Err(StorageError::DuplicateName(_)) => self.require_collection(&ObjectRef::by_name(name)).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Drop a collection. Missing is fine; system collections are truncated.
    pub async fn drop_collection(&self, name: &str) -> Result<()> {
        let locals = self.storage.collections().await?;
        match locals.iter().find(|c| c.name == name) {
            None => Ok(()),
            Some(c) if c.is_system => self.truncate_collection(name).await,
            Some(_) => {
                match self.retry_locked(name, || self.storage.drop_collection(name)).await? {
                    Ok(()) | Err(StorageError::CollectionNotFound(_)) => {
                        info!(collection = %name, "Dropped collection");
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    pub async fn truncate_collection(&self, name: &str) -> Result<()> {
        self.storage_call(name, || self.storage.truncate_collection(name)).await
    }

    /// Rename `from` to `to`. Already renamed is success.
    pub async fn rename_collection(&self, from: &str, to: &str) -> Result<()> {
        match self
            .retry_locked(from, || self.storage.rename_collection(from, to))
            .await?
        {
            Ok(()) => Ok(()),
            Err(StorageError::CollectionNotFound(_)) => {
                let locals = self.storage.collections().await?;
                if locals.iter().any(|c| c.name == to) {
                    Ok(())
                } else {
                    Err(ReplicationError::CollectionNotFound(from.to_string()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Make an index shaped like `index` exist on `collection`.
    pub async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<()> {
        if index.is_builtin() {
            return Ok(());
        }
        let local = self.require_collection(&ObjectRef::by_name(collection)).await?;

        if local.indexes.iter().any(|i| i.same_shape(index)) {
            return Ok(());
        }
        let clash = local.indexes.iter().find(|i| {
            !i.is_builtin() && (i.id == index.id || (i.name.is_some() && i.name == index.name))
        });
        if let Some(old) = clash {
            warn!(collection = %collection, index = %old.id, "Index differs from leader, recreating");
            self.drop_index(collection, &old.id).await?;
        }

        match self
            .retry_locked(collection, || self.storage.create_index(collection, index))
            .await?
        {
            Ok(()) | Err(StorageError::DuplicateName(_)) => {
                debug!(collection = %collection, index = %index.id, fields = ?index.fields, "Created index");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn drop_index(&self, collection: &str, index_id: &str) -> Result<()> {
        match self
            .retry_locked(collection, || self.storage.drop_index(collection, index_id))
            .await?
        {
            Ok(()) | Err(StorageError::IndexNotFound(_)) | Err(StorageError::CollectionNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Make a view shaped like `view` exist.
    pub async fn create_view(&self, view: &ViewSpec) -> Result<()> {
        if let Some(local) = self.resolve_view(&ObjectRef::of_view(view)).await? {
            if local.name == view.name && local.same_shape(view) {
                return Ok(());
            }
            warn!(view = %view.name, "View differs from leader, recreating");
            self.drop_view(&local.name).await?;
        }
        match self.storage.create_view(view).await {
            Ok(()) => {
                info!(view = %view.name, view_type = ?view.view_type, "Created view");
                Ok(())
            }
            Err(StorageError::DuplicateName(_)) => self.storage.update_view(view).await.map_err(Into::into),
            Err(e) => Err(e.into()),
        }
    }

    /// Update a view's properties in place, creating it if missing.
    pub async fn change_view(&self, view: &ViewSpec) -> Result<()> {
        match self.storage.update_view(view).await {
            Ok(()) => Ok(()),
            Err(StorageError::ViewNotFound(_)) => self.create_view(view).await,
            Err(e) => Err(e.into()),
        }
    }

    pub async fn drop_view(&self, name: &str) -> Result<()> {
        match self.storage.drop_view(name).await {
            Ok(()) | Err(StorageError::ViewNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::test_support::UnreachableLeader;
    use serde_json::json;

    async fn core_with(storage: Arc<MemoryStorage>) -> SyncerCore {
        SyncerCore::new(
            Arc::new(ReplicationConfiguration::for_testing("f1")),
            storage,
            Arc::new(UnreachableLeader),
            AbortSignal::new(),
        )
    }

    async fn collection(core: &SyncerCore, name: &str) -> LocalCollection {
        core.create_collection(&CollectionSpec::new("1", format!("g-{name}"), name))
            .await
            .unwrap()
    }

    fn doc(key: &str, rev: u64, body: serde_json::Value) -> Document {
        Document::new(key, RevisionId::new(rev), body)
    }

    #[tokio::test]
    async fn test_insert_then_replay_is_unchanged() {
        let storage = Arc::new(MemoryStorage::new());
        let core = core_with(storage.clone()).await;
        let c = collection(&core, "c").await;

        let d = doc("a", 5, json!({"x": 1}));
        assert_eq!(core.apply_marker(&c, DocumentOp::Insert(d.clone())).await.unwrap(), ApplyOutcome::Inserted);
        assert_eq!(core.apply_marker(&c, DocumentOp::Insert(d)).await.unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(storage.stats().inserts, 1);
        assert_eq!(storage.stats().replaces, 0);
    }

    #[tokio::test]
    async fn test_insert_newer_revision_replaces() {
        let storage = Arc::new(MemoryStorage::new());
        let core = core_with(storage.clone()).await;
        let c = collection(&core, "c").await;

        core.apply_marker(&c, DocumentOp::Insert(doc("a", 5, json!({})))).await.unwrap();
        let outcome = core.apply_marker(&c, DocumentOp::Insert(doc("a", 6, json!({})))).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Replaced);
        assert_eq!(storage.documents("c").await[0].rev, RevisionId::new(6));
    }

    #[tokio::test]
    async fn test_remove_missing_is_success() {
        let storage = Arc::new(MemoryStorage::new());
        let core = core_with(storage).await;
        let c = collection(&core, "c").await;
        let outcome = core
            .apply_marker(&c, DocumentOp::Remove { key: "nope".into() })
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Absent);
    }

    #[tokio::test]
    async fn test_unique_conflict_removes_other_document() {
        let storage = Arc::new(MemoryStorage::new());
        let core = core_with(storage.clone()).await;
        collection(&core, "users").await;
        core.create_index("users", &IndexSpec::persistent("7", &["email"], true))
            .await
            .unwrap();
        let c = core.require_collection(&ObjectRef::by_name("users")).await.unwrap();

        core.apply_marker(&c, DocumentOp::Insert(doc("k1", 1, json!({"email": "v"}))))
            .await
            .unwrap();
        let outcome = core
            .apply_marker(&c, DocumentOp::Insert(doc("k2", 2, json!({"email": "v"}))))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Inserted);
        let keys: Vec<String> = storage.documents("users").await.into_iter().map(|d| d.key).collect();
        assert_eq!(keys, vec!["k2".to_string()]);
    }

    #[tokio::test]
    async fn test_lock_timeouts_retried() {
        let storage = Arc::new(MemoryStorage::new());
        let core = core_with(storage.clone()).await;
        let c = collection(&core, "c").await;

        storage.inject_lock_timeouts(2);
        core.apply_marker(&c, DocumentOp::Insert(doc("a", 1, json!({})))).await.unwrap();

        // more timeouts than configured retries surface as LockTimeout
        storage.inject_lock_timeouts(5);
        let err = core
            .apply_marker(&c, DocumentOp::Insert(doc("b", 2, json!({}))))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::LockTimeout(_)));
    }

    #[tokio::test]
    async fn test_resolve_prefers_guid_then_name() {
        let storage = Arc::new(MemoryStorage::new());
        let core = core_with(storage.clone()).await;
        storage.create_collection(&CollectionSpec::new("10", "ga", "a")).await.unwrap();
        storage.create_collection(&CollectionSpec::new("11", "gb", "b")).await.unwrap();

        let by_guid = ObjectRef {
            guid: Some("gb".into()),
            id: Some("10".into()),
            name: Some("a".into()),
        };
        assert_eq!(core.resolve_collection(&by_guid).await.unwrap().unwrap().name, "b");

        // id points at "b", name at "a": the name wins
        let disagree = ObjectRef {
            guid: Some("unknown".into()),
            id: Some("11".into()),
            name: Some("a".into()),
        };
        assert_eq!(core.resolve_collection(&disagree).await.unwrap().unwrap().name, "a");

        let by_id = ObjectRef {
            id: Some("10".into()),
            ..ObjectRef::default()
        };
        assert_eq!(core.resolve_collection(&by_id).await.unwrap().unwrap().name, "a");
        assert!(core.resolve_collection(&ObjectRef::by_name("zzz")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_collection_idempotent_and_recreates() {
        let storage = Arc::new(MemoryStorage::new());
        let core = core_with(storage.clone()).await;
        let spec = CollectionSpec::new("1", "g1", "c");
        core.create_collection(&spec).await.unwrap();
        core.create_collection(&spec).await.unwrap();
        assert_eq!(storage.stats().collections_created, 1);

        let mut edge = spec.clone();
        edge.kind = crate::storage::CollectionKind::Edge;
        core.create_collection(&edge).await.unwrap();
        assert_eq!(storage.stats().collections_dropped, 1);
        assert_eq!(storage.stats().collections_created, 2);
    }

    #[tokio::test]
    async fn test_system_collection_truncated_not_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        let core = core_with(storage.clone()).await;
        let users = core
            .create_collection(&CollectionSpec::new("5", "g-users", "_users"))
            .await
            .unwrap();
        core.apply_marker(&users, DocumentOp::Insert(doc("root", 1, json!({}))))
            .await
            .unwrap();

        let mut other = CollectionSpec::new("5", "g-users", "_users");
        other.kind = crate::storage::CollectionKind::Edge;
        core.create_collection(&other).await.unwrap();
        assert_eq!(storage.stats().collections_dropped, 0);
        assert_eq!(storage.stats().truncates, 1);
        assert_eq!(storage.stored_count("_users").await, 0);

        core.drop_collection("_users").await.unwrap();
        assert_eq!(storage.stats().collections_dropped, 0);
    }

    #[tokio::test]
    async fn test_create_collection_renames_by_guid() {
        let storage = Arc::new(MemoryStorage::new());
        let core = core_with(storage.clone()).await;
        storage
            .create_collection(&CollectionSpec::new("1", "g1", "old"))
            .await
            .unwrap();
        let c = core
            .create_collection(&CollectionSpec::new("1", "g1", "new"))
            .await
            .unwrap();
        assert_eq!(c.name, "new");
        assert_eq!(storage.stats().collections_created, 1);
    }

    #[tokio::test]
    async fn test_index_and_view_idempotence() {
        let storage = Arc::new(MemoryStorage::new());
        let core = core_with(storage.clone()).await;
        collection(&core, "c").await;
        let idx = IndexSpec::persistent("7", &["a"], false);
        core.create_index("c", &idx).await.unwrap();
        core.create_index("c", &idx).await.unwrap();
        assert_eq!(storage.stats().indexes_created, 1);

        // same id, different shape: replaced
        core.create_index("c", &IndexSpec::persistent("7", &["b"], true)).await.unwrap();
        let c = core.require_collection(&ObjectRef::by_name("c")).await.unwrap();
        assert_eq!(c.unique_index_count(), 1);

        core.drop_index("c", "nope").await.unwrap();

        let view = ViewSpec {
            id: "9".into(),
            guid: String::new(),
            name: "v".into(),
            view_type: crate::storage::ViewType::ArangoSearch,
            properties: json!({"links": {}}),
        };
        core.create_view(&view).await.unwrap();
        core.create_view(&view).await.unwrap();
        assert_eq!(storage.stats().views_created, 1);
        core.drop_view("v").await.unwrap();
        core.drop_view("v").await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_twice_is_success() {
        let storage = Arc::new(MemoryStorage::new());
        let core = core_with(storage).await;
        collection(&core, "a").await;
        core.rename_collection("a", "b").await.unwrap();
        core.rename_collection("a", "b").await.unwrap();
        assert!(core.rename_collection("x", "y").await.is_err());
    }
}
