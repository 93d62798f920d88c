//! Replicator state types.
//!
//! Defines the state machine for the follower lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ InitialSync ←─────────────┐
//!    │                              │                     │
//!    │ (resume from stored tick)    │ (snapshot applied)  │ auto-resync
//!    │                              ↓                     │ (tick gone)
//!    └─────────────────────────→ Tailing ─────────────────┘
//!                                   │
//!                        shutdown() │          (unrecoverable error)
//!                                   ↓                     │
//!                             ShuttingDown               ↓
//!                                   │                  Failed
//!                                   ↓
//!                                Stopped
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `FollowerReplicator::new()`. Nothing started.
//! - **InitialSync**: Copying or diffing the leader snapshot.
//! - **Tailing**: Applying the leader WAL continuously.
//! - **ShuttingDown**: `shutdown()` called. Tasks are draining.
//! - **Stopped**: Graceful shutdown complete. Safe to drop.
//! - **Failed**: Unrecoverable error. See `FollowerReplicator::last_error()`.

use std::time::Duration;

/// State of the follower replicator.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Created but not started.
    Created,

    /// Running an initial sync against a leader batch.
    InitialSync,

    /// Tailing the leader WAL.
    Tailing,

    /// Shutting down gracefully.
    ///
    /// The applied tick is flushed before transitioning to `Stopped`.
    ShuttingDown,

    /// Stopped.
    Stopped,

    /// Unrecoverable error, e.g. the leader pruned the WAL and auto-resync
    /// is disabled or exhausted.
    Failed,
}

impl EngineState {
    /// Whether the replicator is doing work.
    pub fn is_active(self) -> bool {
        matches!(self, Self::InitialSync | Self::Tailing)
    }

    /// Whether the replicator will not change state on its own any more.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::InitialSync => write!(f, "InitialSync"),
            EngineState::Tailing => write!(f, "Tailing"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time status for monitoring endpoints.
///
/// Built from cached state only; taking one performs no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatorStatus {
    pub state: EngineState,
    /// Last WAL tick applied locally.
    pub applied_tick: u64,
    /// Newest tick the leader reported.
    pub leader_tick: u64,
    /// Initial syncs run so far, including the first one.
    pub initial_syncs: usize,
    /// Initial syncs triggered by a lost WAL position.
    pub resyncs: usize,
    /// Duration of the last completed initial sync.
    pub last_sync_duration: Option<Duration>,
    pub last_error: Option<String>,
}

impl ReplicatorStatus {
    pub fn lag(&self) -> u64 {
        self.leader_tick.saturating_sub(self.applied_tick)
    }

    /// Ready to serve reads: tailing and not failed.
    pub fn is_ready(&self) -> bool {
        self.state == EngineState::Tailing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::InitialSync.to_string(), "InitialSync");
        assert_eq!(EngineState::Tailing.to_string(), "Tailing");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_engine_state_classes() {
        assert!(EngineState::Tailing.is_active());
        assert!(EngineState::InitialSync.is_active());
        assert!(!EngineState::Created.is_active());
        assert!(EngineState::Failed.is_terminal());
        assert!(!EngineState::ShuttingDown.is_terminal());
    }

    #[test]
    fn test_status_lag_and_readiness() {
        let status = ReplicatorStatus {
            state: EngineState::Tailing,
            applied_tick: 90,
            leader_tick: 100,
            initial_syncs: 1,
            resyncs: 0,
            last_sync_duration: None,
            last_error: None,
        };
        assert_eq!(status.lag(), 10);
        assert!(status.is_ready());

        let behind = ReplicatorStatus {
            applied_tick: 120,
            state: EngineState::Failed,
            ..status
        };
        assert_eq!(behind.lag(), 0);
        assert!(!behind.is_ready());
    }
}
