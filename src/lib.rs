//! # Follower Sync
//!
//! Leader-to-follower replication for a document database: a follower
//! copies a consistent snapshot of the leader, then keeps up by applying the
//! leader's write-ahead log.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           FollowerReplicator                              │
//! │                                                                           │
//! │  ┌──────────────────┐   ┌───────────────────┐   ┌──────────────────────┐  │
//! │  │ InitialSyncEngine│──►│ RevisionDiffEngine│──►│ ApplyBatch           │  │
//! │  │ (batch, dump)    │   │ (tree / key diff) │   │ (remove, fetch, put) │  │
//! │  └──────────────────┘   └───────────────────┘   └──────────────────────┘  │
//! │           │                                                │              │
//! │           ▼                                                ▼              │
//! │  ┌──────────────────┐   ┌───────────────────┐   ┌──────────────────────┐  │
//! │  │ TailingEngine    │──►│ SyncerCore        │──►│ StorageEngine        │  │
//! │  │ (WAL markers)    │   │ (apply, retry)    │   │ (local database)     │  │
//! │  └──────────────────┘   └───────────────────┘   └──────────────────────┘  │
//! │           │                                                               │
//! │           ▼                                                               │
//! │  ┌──────────────────┐                                                     │
//! │  │ TickStore        │                                                     │
//! │  │ (SQLite)         │                                                     │
//! │  └──────────────────┘                                                     │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! On the leader side, [`FollowerQuorumTracker`] decides whether a shard
//! leader may accept writes given the followers currently in sync.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use follower_sync::{FollowerReplicator, ReplicationConfiguration, MemoryStorage};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ReplicationConfiguration::for_testing("follower-1");
//!     let storage = Arc::new(MemoryStorage::new());
//!
//!     let mut replicator = FollowerReplicator::connect(config, storage).expect("valid config");
//!     replicator.start().await.expect("Failed to start");
//!
//!     // Replicates until shutdown
//!     replicator.shutdown().await;
//! }
//! ```

pub mod apply_batch;
pub mod circuit_breaker;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod diff;
pub mod error;
pub mod initial_sync;
pub mod job;
pub mod leader;
pub mod metrics;
pub mod quorum;
pub mod resilience;
pub mod revision;
pub mod revision_tree;
pub mod storage;
pub mod syncer;
pub mod tailing;
pub mod tick_store;

// Re-exports for convenience
pub use apply_batch::{ApplyBatch, ApplyStats, FetchSource};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, LeaderCircuit};
pub use config::{ReplicationConfiguration, RestrictConfig, RestrictMode, TailingConfig, TickStoreConfig};
pub use coordination::{CoordinationStore, MemoryCoordinationStore};
pub use coordinator::{EngineState, FollowerReplicator, ReplicatorStatus};
pub use diff::{DiffReport, RevisionDiffEngine, SyncStrategy};
pub use error::{ReplicationError, Result};
pub use initial_sync::{InitialSyncEngine, InitialSyncReport};
pub use job::{AbortSignal, JobSlot};
pub use leader::{HttpLeaderClient, LeaderClient, WalChunk, WalMarker};
pub use quorum::{FollowerQuorumTracker, WriteAccess};
pub use revision::{RevisionId, RevisionRange};
pub use revision_tree::RevisionTree;
pub use storage::{Document, MemoryStorage, StorageEngine};
pub use syncer::SyncerCore;
pub use tailing::{TailReport, TailingEngine};
pub use tick_store::TickStore;

#[cfg(test)]
pub(crate) mod test_support {
    //! Leader stand-ins for unit tests.

    use crate::error::ReplicationError;
    use crate::leader::*;
    use crate::revision::{RevisionId, RevisionRange};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn unreachable<'a, T: Send + 'a>() -> LeaderFuture<'a, T> {
        Box::pin(async { Err(ReplicationError::transport("unreachable", "connection refused")) })
    }

    /// A leader that refuses every request.
    pub struct UnreachableLeader;

    impl LeaderClient for UnreachableLeader {
        fn leader_info(&self) -> LeaderFuture<'_, LeaderInfo> {
            unreachable()
        }

        fn start_batch(&self, _ttl: Duration) -> LeaderFuture<'_, LeaderBatch> {
            unreachable()
        }

        fn extend_batch(&self, _batch_id: &str, _ttl: Duration) -> LeaderFuture<'_, ()> {
            unreachable()
        }

        fn finish_batch(&self, _batch_id: &str) -> LeaderFuture<'_, ()> {
            unreachable()
        }

        fn inventory(&self, _batch_id: &str, _collection: Option<&str>) -> LeaderFuture<'_, Inventory> {
            unreachable()
        }

        fn dump(&self, _collection: &str, _batch_id: &str, _from: u64, _chunk_size: u64) -> LeaderFuture<'_, DumpChunk> {
            unreachable()
        }

        fn create_key_listing(&self, _collection: &str, _batch_id: &str) -> LeaderFuture<'_, KeyListing> {
            unreachable()
        }

        fn listing_keys(&self, _listing: &KeyListing, _offset: u64, _limit: u64) -> LeaderFuture<'_, Vec<KeyRevision>> {
            unreachable()
        }

        fn listing_documents(&self, _listing: &KeyListing, _keys: &[String]) -> LeaderFuture<'_, Vec<crate::storage::Document>> {
            unreachable()
        }

        fn release_key_listing(&self, _listing: &KeyListing) -> LeaderFuture<'_, ()> {
            unreachable()
        }

        fn revision_tree(&self, _collection: &str, _batch_id: &str) -> LeaderFuture<'_, crate::revision_tree::RevisionTree> {
            unreachable()
        }

        fn revision_ranges(
            &self,
            _collection: &str,
            _batch_id: &str,
            _ranges: &[RevisionRange],
            _resume: Option<RevisionId>,
        ) -> LeaderFuture<'_, RangesResponse> {
            unreachable()
        }

        fn revision_documents(
            &self,
            _collection: &str,
            _batch_id: &str,
            _revisions: &[RevisionId],
        ) -> LeaderFuture<'_, Vec<crate::storage::Document>> {
            unreachable()
        }

        fn tail_wal(&self, _from: u64, _chunk_size: u64, _collection: Option<&str>) -> LeaderFuture<'_, WalChunk> {
            unreachable()
        }
    }

    /// Serves one-key listing pages; every page after the first takes
    /// `page_delay`. Tracks how many page requests are still running.
    pub struct SlowKeysLeader {
        pub page_delay: Duration,
        pub requests: AtomicUsize,
        pub running: AtomicUsize,
    }

    impl SlowKeysLeader {
        pub fn new(page_delay: Duration) -> Self {
            Self {
                page_delay,
                requests: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
            }
        }
    }

    struct Running<'a>(&'a AtomicUsize);

    impl Drop for Running<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl LeaderClient for SlowKeysLeader {
        fn leader_info(&self) -> LeaderFuture<'_, LeaderInfo> {
            unreachable()
        }

        fn start_batch(&self, _ttl: Duration) -> LeaderFuture<'_, LeaderBatch> {
            unreachable()
        }

        fn extend_batch(&self, _batch_id: &str, _ttl: Duration) -> LeaderFuture<'_, ()> {
            unreachable()
        }

        fn finish_batch(&self, _batch_id: &str) -> LeaderFuture<'_, ()> {
            unreachable()
        }

        fn inventory(&self, _batch_id: &str, _collection: Option<&str>) -> LeaderFuture<'_, Inventory> {
            unreachable()
        }

        fn dump(&self, _collection: &str, _batch_id: &str, _from: u64, _chunk_size: u64) -> LeaderFuture<'_, DumpChunk> {
            unreachable()
        }

        fn create_key_listing(&self, _collection: &str, _batch_id: &str) -> LeaderFuture<'_, KeyListing> {
            unreachable()
        }

        fn listing_keys(&self, _listing: &KeyListing, offset: u64, _limit: u64) -> LeaderFuture<'_, Vec<KeyRevision>> {
            Box::pin(async move {
                self.requests.fetch_add(1, Ordering::SeqCst);
                self.running.fetch_add(1, Ordering::SeqCst);
                let _running = Running(&self.running);
                if offset > 0 {
                    tokio::time::sleep(self.page_delay).await;
                }
                Ok(vec![(format!("k{offset}"), RevisionId::new(offset + 1))])
            })
        }

        fn listing_documents(&self, _listing: &KeyListing, _keys: &[String]) -> LeaderFuture<'_, Vec<crate::storage::Document>> {
            unreachable()
        }

        fn release_key_listing(&self, _listing: &KeyListing) -> LeaderFuture<'_, ()> {
            unreachable()
        }

        fn revision_tree(&self, _collection: &str, _batch_id: &str) -> LeaderFuture<'_, crate::revision_tree::RevisionTree> {
            unreachable()
        }

        fn revision_ranges(
            &self,
            _collection: &str,
            _batch_id: &str,
            _ranges: &[RevisionRange],
            _resume: Option<RevisionId>,
        ) -> LeaderFuture<'_, RangesResponse> {
            unreachable()
        }

        fn revision_documents(
            &self,
            _collection: &str,
            _batch_id: &str,
            _revisions: &[RevisionId],
        ) -> LeaderFuture<'_, Vec<crate::storage::Document>> {
            unreachable()
        }

        fn tail_wal(&self, _from: u64, _chunk_size: u64, _collection: Option<&str>) -> LeaderFuture<'_, WalChunk> {
            unreachable()
        }
    }
}
