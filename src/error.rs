// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for follower synchronization.
//!
//! Every core operation returns [`Result<T>`]. Storage engine failures are
//! converted at the trait boundary (see [`crate::storage::StorageError`]) so
//! that a single error type flows through the protocol state machines.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Leader unreachable, timeout, 5xx |
//! | `PreconditionFailed` | Yes | Coordination store CAS contention |
//! | `LockTimeout` | Yes | Local storage lock could not be acquired in time |
//! | `Protocol` | No | Missing header, malformed body, unexpected shape |
//! | `TickNotPresent` | No | Leader pruned WAL the follower still needs |
//! | `UniqueConflict` | No | Conflict resolution attempts exhausted |
//! | `BatchLost` | No | Leader batch could not be kept alive |
//! | `NotLeader` | No | This server is no longer plan leader for the shard |
//! | `Storage` | No | Local storage engine failure |
//! | `TickStore` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `Cancelled` | No | Syncer was aborted |
//! | `Shutdown` | No | Process is shutting down |
//!
//! # Retry Behavior
//!
//! [`ReplicationError::is_retryable()`] tells the call site whether a retry
//! with backoff makes sense. [`ReplicationError::requires_resync()`] marks the
//! one error that cannot be fixed by retrying the same operation: the
//! follower must start over with a fresh initial sync.

use crate::storage::StorageError;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Connection or transport-level failure talking to the leader.
    ///
    /// Retried with capped exponential backoff by the leader client before
    /// surfacing here.
    #[error("Transport error ({endpoint}): {message}")]
    Transport { endpoint: String, message: String },

    /// The leader answered, but not in a shape we understand.
    ///
    /// Indicates a version or configuration mismatch. Never retried.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A coordination store write lost a compare-and-swap race.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// This server is not (or no longer) the plan leader of the shard.
    #[error("Not leader for {shard}")]
    NotLeader { shard: String },

    /// The leader no longer holds the WAL tick the follower needs.
    ///
    /// Not retryable: tailing cannot continue and a new initial sync is
    /// required.
    #[error("Required tick {required_tick} is no longer present on the leader")]
    TickNotPresent { required_tick: u64 },

    /// Unique constraint conflicts could not be resolved within the attempt
    /// bound.
    #[error("Unique constraint conflict on {collection}/{key} after {attempts} attempts")]
    UniqueConflict {
        collection: String,
        key: String,
        attempts: usize,
    },

    /// The leader batch expired or could not be extended.
    #[error("Leader batch lost: {0}")]
    BatchLost(String),

    /// A local storage lock could not be acquired in time.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// A referenced collection does not exist locally.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// Local storage engine failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite error while persisting the applied tick.
    #[error("Tick store error: {0}")]
    TickStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// State machine violation (e.g. starting an engine twice).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The owning syncer was aborted.
    #[error("Operation cancelled")]
    Cancelled,

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error for an endpoint.
    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::PreconditionFailed(_) => true,
            Self::LockTimeout(_) => true,
            Self::Protocol(_) => false,
            Self::NotLeader { .. } => false,
            Self::TickNotPresent { .. } => false,
            Self::UniqueConflict { .. } => false,
            Self::BatchLost(_) => false,
            Self::CollectionNotFound(_) => false,
            Self::Storage(_) => false,
            Self::TickStore(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Cancelled => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Whether the follower has to restart from a fresh initial sync.
    pub fn requires_resync(&self) -> bool {
        matches!(self, Self::TickNotPresent { .. })
    }

    /// Whether this error came from the abort signal rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Shutdown)
    }
}

impl From<StorageError> for ReplicationError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::LockTimeout(msg) => Self::LockTimeout(msg),
            StorageError::CollectionNotFound(name) => Self::CollectionNotFound(name),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ReplicationError {
    fn from(e: reqwest::Error) -> Self {
        let endpoint = e
            .url()
            .map(|u| u.path().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        if e.is_decode() {
            Self::Protocol(format!("{endpoint}: {e}"))
        } else {
            Self::transport(endpoint, e.to_string())
        }
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(format!("malformed JSON: {e}"))
    }
}
