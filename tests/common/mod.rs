//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-process leader ([`MockLeader`])
//! - Follower construction helpers
//! - Local seeding helpers for diff scenarios

pub mod mock_leader;

pub use mock_leader::*;

use follower_sync::job::AbortSignal;
use follower_sync::storage::{Document, MemoryStorage, StorageEngine};
use follower_sync::{ReplicationConfiguration, SyncerCore};
use std::sync::Arc;

/// Test configuration with tick persistence in memory.
pub fn test_config() -> ReplicationConfiguration {
    ReplicationConfiguration::for_testing("follower-1")
}

/// A syncer context for `leader` writing into a fresh memory storage.
pub fn follower(leader: &Arc<MockLeader>) -> (Arc<SyncerCore>, Arc<MemoryStorage>) {
    follower_with(leader, test_config(), MemoryStorage::new())
}

pub fn follower_with(
    leader: &Arc<MockLeader>,
    config: ReplicationConfiguration,
    storage: MemoryStorage,
) -> (Arc<SyncerCore>, Arc<MemoryStorage>) {
    let storage = Arc::new(storage);
    let core = SyncerCore::new(
        Arc::new(config),
        storage.clone(),
        leader.clone(),
        AbortSignal::new(),
    );
    (Arc::new(core), storage)
}

/// Copy the leader's collection and documents into `storage` as if an
/// earlier sync had completed.
pub async fn seed_from_leader(storage: &MemoryStorage, leader: &MockLeader, collection: &str) {
    let spec = leader
        .inventory_spec(collection)
        .unwrap_or_else(|| panic!("leader has no collection {collection}"));
    storage.create_collection(&spec).await.unwrap();
    for doc in leader.documents(collection) {
        storage.insert(collection, doc).await.unwrap();
    }
}

/// Insert a document locally only.
pub async fn insert_local(storage: &MemoryStorage, collection: &str, doc: Document) {
    storage.insert(collection, doc).await.unwrap();
}

/// Local documents as sorted `(key, rev)` pairs.
pub async fn local_state(storage: &MemoryStorage, collection: &str) -> Vec<(String, u64)> {
    let mut docs: Vec<_> = storage
        .documents(collection)
        .await
        .into_iter()
        .map(|d| (d.key, d.rev.as_u64()))
        .collect();
    docs.sort();
    docs
}

/// Leader documents as sorted `(key, rev)` pairs.
pub fn leader_state(leader: &MockLeader, collection: &str) -> Vec<(String, u64)> {
    leader
        .documents(collection)
        .into_iter()
        .map(|d| (d.key, d.rev.as_u64()))
        .collect()
}
