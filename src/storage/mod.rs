// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local storage engine seam.
//!
//! The syncers never touch documents directly: everything goes through the
//! [`StorageEngine`] trait so the physical engine can be swapped and tests
//! can run against [`MemoryStorage`].
//!
//! # Implementing
//!
//! Methods return boxed futures ([`StorageFuture`]) so the trait stays
//! object-safe. Borrowed arguments must be copied into the future before it
//! is returned:
//!
//! ```rust,ignore
//! fn lookup(&self, collection: &str, key: &str) -> StorageFuture<'_, Option<Document>> {
//!     let collection = collection.to_string();
//!     let key = key.to_string();
//!     Box::pin(async move { self.backend.get(&collection, &key).await })
//! }
//! ```
//!
//! # Errors
//!
//! Implementations report failures as [`StorageError`]. Two variants carry
//! protocol meaning for the syncers:
//!
//! - [`StorageError::UniqueConstraintViolated`] names the key of the document
//!   that blocks an insert, which drives conflict resolution
//! - [`StorageError::DocumentNotFound`] on remove is treated as success

pub mod memory;

pub use memory::{MemoryStorage, MemoryStorageStats};

use crate::revision::RevisionId;
use crate::revision_tree::RevisionTree;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Boxed future returned by [`StorageEngine`] methods.
pub type StorageFuture<'a, T> = BoxFuture<'a, StorageResult<T>>;

/// Failures reported by a storage engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("lock timeout on {0}")]
    LockTimeout(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("view not found: {0}")]
    ViewNotFound(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// An insert or replace collided with `conflicting_key` in `index`.
    #[error("unique constraint violated in index {index} by document {conflicting_key}")]
    UniqueConstraintViolated { index: String, conflicting_key: String },

    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("{0}")]
    Other(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Documents
// ═══════════════════════════════════════════════════════════════════════════════

/// A stored document: key, revision, and the full JSON body.
///
/// The body always contains `_key` and `_rev` matching the typed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Document {
    pub key: String,
    pub rev: RevisionId,
    pub body: Value,
}

impl Document {
    /// Build a document, stamping `_key` and `_rev` into `body`.
    ///
    /// A non-object body is wrapped as `{"value": body}`.
    pub fn new(key: impl Into<String>, rev: RevisionId, body: Value) -> Self {
        let key = key.into();
        let mut map = match body {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        map.insert("_key".to_string(), Value::String(key.clone()));
        map.insert("_rev".to_string(), Value::String(rev.to_hlc()));
        Self {
            key,
            rev,
            body: Value::Object(map),
        }
    }

    /// Value of a (possibly dotted) attribute path.
    pub fn field(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.body, |v, part| v.get(part))
    }
}

impl TryFrom<Value> for Document {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let key = value
            .get("_key")
            .and_then(Value::as_str)
            .ok_or_else(|| "document without _key".to_string())?
            .to_string();
        let rev = match value.get("_rev") {
            Some(raw) => serde_json::from_value::<RevisionId>(raw.clone())
                .map_err(|e| format!("document {key}: bad _rev: {e}"))?,
            None => return Err(format!("document {key} without _rev")),
        };
        Ok(Self { key, rev, body: value })
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.body
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schema
// ═══════════════════════════════════════════════════════════════════════════════

/// Document or edge collection; serialized as the numeric type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum CollectionKind {
    #[default]
    Document,
    Edge,
}

impl TryFrom<u8> for CollectionKind {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            2 => Ok(Self::Document),
            3 => Ok(Self::Edge),
            other => Err(format!("unknown collection type {other}")),
        }
    }
}

impl From<CollectionKind> for u8 {
    fn from(kind: CollectionKind) -> Self {
        match kind {
            CollectionKind::Document => 2,
            CollectionKind::Edge => 3,
        }
    }
}

/// Desired shape of a collection, as described by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSpec {
    pub id: String,
    #[serde(rename = "globallyUniqueId", default)]
    pub guid: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: CollectionKind,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl CollectionSpec {
    pub fn new(id: impl Into<String>, guid: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            guid: guid.into(),
            is_system: name.starts_with('_'),
            name,
            kind: CollectionKind::Document,
            deleted: false,
        }
    }
}

/// A collection as it exists locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCollection {
    pub id: String,
    pub guid: String,
    pub name: String,
    pub kind: CollectionKind,
    pub is_system: bool,
    pub indexes: Vec<IndexSpec>,
    /// Whether the engine keeps a revision tree for this collection.
    pub supports_revision_tree: bool,
}

impl LocalCollection {
    /// Same identity and type as `spec`. Index differences are reconciled
    /// separately and do not count here.
    pub fn matches(&self, spec: &CollectionSpec) -> bool {
        self.kind == spec.kind
            && self.is_system == spec.is_system
            && (spec.guid.is_empty() || self.guid.is_empty() || self.guid == spec.guid)
    }

    /// Unique secondary indexes (the primary index is not counted).
    pub fn unique_index_count(&self) -> usize {
        self.indexes
            .iter()
            .filter(|i| i.unique && !i.is_builtin())
            .count()
    }
}

/// A secondary (or built-in) index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl IndexSpec {
    pub fn persistent(id: impl Into<String>, fields: &[&str], unique: bool) -> Self {
        Self {
            id: id.into(),
            kind: "persistent".to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique,
            sparse: false,
            name: None,
        }
    }

    /// Primary and edge indexes exist implicitly and are never created.
    pub fn is_builtin(&self) -> bool {
        matches!(self.kind.as_str(), "primary" | "edge")
    }

    /// Same definition, ignoring id and name.
    pub fn same_shape(&self, other: &IndexSpec) -> bool {
        self.kind == other.kind
            && self.fields == other.fields
            && self.unique == other.unique
            && self.sparse == other.sparse
    }
}

/// Search view flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewType {
    #[serde(rename = "arangosearch")]
    ArangoSearch,
    #[serde(rename = "search-alias")]
    SearchAlias,
}

/// A view definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewSpec {
    pub id: String,
    #[serde(rename = "globallyUniqueId", default)]
    pub guid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub view_type: ViewType,
    #[serde(default)]
    pub properties: Value,
}

impl ViewSpec {
    pub fn same_shape(&self, other: &ViewSpec) -> bool {
        self.view_type == other.view_type && self.properties == other.properties
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// The trait
// ═══════════════════════════════════════════════════════════════════════════════

/// What the syncers need from the local storage engine.
pub trait StorageEngine: Send + Sync + 'static {
    fn collections(&self) -> StorageFuture<'_, Vec<LocalCollection>>;

    fn views(&self) -> StorageFuture<'_, Vec<ViewSpec>>;

    /// Create a collection. Fails with `DuplicateName` if the name is taken.
    fn create_collection(&self, spec: &CollectionSpec) -> StorageFuture<'_, LocalCollection>;

    fn drop_collection(&self, name: &str) -> StorageFuture<'_, ()>;

    fn rename_collection(&self, from: &str, to: &str) -> StorageFuture<'_, ()>;

    fn truncate_collection(&self, name: &str) -> StorageFuture<'_, ()>;

    /// Create an index. Fails with `DuplicateName` if an index with the same
    /// id exists.
    fn create_index(&self, collection: &str, index: &IndexSpec) -> StorageFuture<'_, ()>;

    fn drop_index(&self, collection: &str, index_id: &str) -> StorageFuture<'_, ()>;

    fn create_view(&self, view: &ViewSpec) -> StorageFuture<'_, ()>;

    fn drop_view(&self, name: &str) -> StorageFuture<'_, ()>;

    /// Replace a view's properties in place.
    fn update_view(&self, view: &ViewSpec) -> StorageFuture<'_, ()>;

    /// The engine's document counter for a collection. It may drift from the
    /// real number of documents and can be corrected with
    /// [`StorageEngine::adjust_document_count`].
    fn document_count(&self, collection: &str) -> StorageFuture<'_, u64>;

    fn adjust_document_count(&self, collection: &str, delta: i64) -> StorageFuture<'_, ()>;

    fn lookup(&self, collection: &str, key: &str) -> StorageFuture<'_, Option<Document>>;

    /// Insert a new document. Fails with `UniqueConstraintViolated` when the
    /// key or a unique index value is taken.
    fn insert(&self, collection: &str, doc: Document) -> StorageFuture<'_, ()>;

    /// Replace the document with the same key.
    fn replace(&self, collection: &str, doc: Document) -> StorageFuture<'_, ()>;

    /// Remove by key. Fails with `DocumentNotFound` if absent.
    fn remove(&self, collection: &str, key: &str) -> StorageFuture<'_, ()>;

    /// `(revision, key)` pairs with `low <= revision <= high`, ascending.
    fn revisions_in_range(
        &self,
        collection: &str,
        low: RevisionId,
        high: RevisionId,
    ) -> StorageFuture<'_, Vec<(RevisionId, String)>>;

    /// All `(key, revision)` pairs, ascending by key.
    fn keys_with_revisions(&self, collection: &str) -> StorageFuture<'_, Vec<(String, RevisionId)>>;

    /// Revision tree snapshot, or `None` if the collection has none.
    fn revision_tree(&self, collection: &str) -> StorageFuture<'_, Option<RevisionTree>>;

    /// Commit what has been written so far without ending the sync.
    fn intermediate_commit(&self, collection: &str) -> StorageFuture<'_, ()>;

    /// Flush the local write-ahead log, optionally waiting for fsync.
    fn flush_wal(&self, wait_for_sync: bool) -> StorageFuture<'_, ()>;
}
