// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pipelined request/response jobs with cooperative cancellation.
//!
//! Both syncers overlap network I/O with local apply: while chunk N is being
//! written to storage, the request for chunk N+1 is already in flight.
//!
//! ```text
//!   control task                       tokio runtime
//!   ────────────                       ─────────────
//!   slot.request(fetch 1) ───────────▶ [fetch 1]
//!   job.wait()  ◀──────────────────────  result 1
//!   slot.request(fetch 2) ───────────▶ [fetch 2]
//!   apply(result 1)                      ...
//!   job.wait()  ◀──────────────────────  result 2
//! ```
//!
//! [`JobSlot::request`] returns an owned [`InFlight`] handle while the slot
//! keeps the job itself, so at most one job is ever posted: a new request
//! first waits for whatever the slot still holds. [`InFlight::wait`] returns
//! the job's result, or `Cancelled`/`Shutdown` as soon as the
//! [`AbortSignal`] fires. A job abandoned that way, or whose handle is
//! dropped, keeps running as an *orphan*: it owns everything it captured,
//! and the slot awaits it in [`JobSlot::drain`] or before the next request.
//!
//! # Pipelining Loop
//!
//! ```rust,ignore
//! let mut next = Some(slot.request(fetch(0)).await);
//! let result = async {
//!     while let Some(job) = next.take() {
//!         let chunk = job.wait().await?;
//!         if chunk.check_more {
//!             next = Some(slot.request(fetch(chunk.last)).await);
//!         }
//!         apply(chunk).await?;
//!     }
//!     Ok(())
//! }
//! .await;
//! slot.drain().await;
//! ```
//!
//! Draining after the loop means an early return never leaves a request
//! running against the leader.

use crate::error::{ReplicationError, Result};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Interval used when polling leader-side state (async jobs, idle WAL).
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

async fn changed_or_pending(rx: Option<&mut watch::Receiver<bool>>) {
    if let Some(rx) = rx {
        if rx.changed().await.is_ok() {
            return;
        }
    }
    // No sender left: this source can never fire.
    std::future::pending::<()>().await
}

/// Syncer-scoped abort flag combined with the process shutdown flag.
///
/// Cloning shares the flag. Aborting one clone aborts all of them.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            shutdown: None,
        }
    }

    /// A fresh signal that also fires when `shutdown` becomes `true`.
    pub fn with_shutdown(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            shutdown: Some(shutdown),
            ..Self::new()
        }
    }

    /// A new, independently abortable signal sharing the shutdown flag.
    pub fn fresh(&self) -> Self {
        Self {
            shutdown: self.shutdown.clone(),
            ..Self::new()
        }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow() || self.is_shutdown()
    }

    /// `Err(Shutdown)` or `Err(Cancelled)` once fired, `Ok(())` otherwise.
    pub fn check(&self) -> Result<()> {
        if self.is_shutdown() {
            Err(ReplicationError::Shutdown)
        } else if *self.rx.borrow() {
            Err(ReplicationError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the signal fires.
    pub async fn cancelled(&self) {
        let mut own = self.rx.clone();
        let mut shutdown = self.shutdown.clone();
        while !self.is_aborted() {
            tokio::select! {
                _ = changed_or_pending(Some(&mut own)) => {}
                _ = changed_or_pending(shutdown.as_mut()) => {}
            }
        }
    }

    /// Run `fut` unless the signal fires first, in which case `fut` is
    /// dropped and the abort error returned.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(self.check().err().unwrap_or(ReplicationError::Cancelled)),
            result = fut => result,
        }
    }

    /// Sleep for `duration`, returning early with an error if aborted.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => self.check(),
        }
    }
}

type Posted<T> = Arc<Mutex<Option<(u64, JoinHandle<Result<T>>)>>>;

fn lock<T>(posted: &Posted<T>) -> MutexGuard<'_, Option<(u64, JoinHandle<Result<T>>)>> {
    posted.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Single-slot holder for one background job at a time.
#[derive(Debug)]
pub struct JobSlot<T> {
    abort: AbortSignal,
    posted: Posted<T>,
    generation: u64,
}

impl<T: Send + 'static> JobSlot<T> {
    pub fn new(abort: AbortSignal) -> Self {
        Self {
            abort,
            posted: Arc::new(Mutex::new(None)),
            generation: 0,
        }
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Spawn `job` and return a handle to its eventual result.
    ///
    /// A job still held by the slot is awaited first and its result
    /// discarded, so an [`InFlight`] from an earlier request that was never
    /// waited on is superseded.
    pub async fn request<F>(&mut self, job: F) -> InFlight<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.drain().await;
        self.generation += 1;
        *lock(&self.posted) = Some((self.generation, tokio::spawn(job)));
        InFlight {
            id: self.generation,
            abort: self.abort.clone(),
            posted: Arc::clone(&self.posted),
        }
    }

    /// Wait for a job nobody is collecting to finish, discarding its result.
    pub async fn drain(&mut self) {
        let held = lock(&self.posted).take();
        if let Some((_, handle)) = held {
            match handle.await {
                Ok(Ok(_)) => debug!("Orphaned job finished"),
                Ok(Err(e)) => debug!(error = %e, "Orphaned job failed"),
                Err(e) => warn!(error = %e, "Orphaned job panicked or was aborted"),
            }
        }
    }

    /// Whether a posted job is still held by the slot.
    pub fn has_orphan(&self) -> bool {
        lock(&self.posted).is_some()
    }
}

/// A job that has been posted but whose result has not been collected.
///
/// Dropping it without calling [`InFlight::wait`] leaves the job with the
/// slot as an orphan.
#[must_use = "an in-flight job does nothing useful unless waited on"]
#[derive(Debug)]
pub struct InFlight<T> {
    id: u64,
    abort: AbortSignal,
    posted: Posted<T>,
}

impl<T: Send + 'static> InFlight<T> {
    /// The job's result, or `Cancelled`/`Shutdown` if the slot's abort
    /// signal fires first.
    pub async fn wait(self) -> Result<T> {
        let mut claimed = self.claim()?;
        let Some(handle) = claimed.handle.as_mut() else {
            return Err(ReplicationError::Internal("job result already taken".into()));
        };

        let joined = tokio::select! {
            biased;
            joined = handle => Some(joined),
            _ = self.abort.cancelled() => None,
        };

        match joined {
            Some(joined) => {
                claimed.handle = None;
                match joined {
                    Ok(result) => result,
                    Err(e) if e.is_cancelled() => Err(ReplicationError::Cancelled),
                    Err(e) => Err(ReplicationError::Internal(format!("job panicked: {e}"))),
                }
            }
            // `claimed` hands the unfinished job back to the slot.
            None => Err(self.abort.check().err().unwrap_or(ReplicationError::Cancelled)),
        }
    }

    fn claim(&self) -> Result<Claimed<T>> {
        let mut posted = lock(&self.posted);
        match posted.take() {
            Some((id, handle)) if id == self.id => Ok(Claimed {
                id,
                posted: Arc::clone(&self.posted),
                handle: Some(handle),
            }),
            other => {
                *posted = other;
                Err(ReplicationError::Internal("job superseded by a later request".into()))
            }
        }
    }
}

/// A job taken out of the slot for waiting. Returned to the slot when
/// dropped unfinished.
struct Claimed<T> {
    id: u64,
    posted: Posted<T>,
    handle: Option<JoinHandle<Result<T>>>,
}

impl<T> Drop for Claimed<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let mut posted = lock(&self.posted);
            if posted.is_none() {
                *posted = Some((self.id, handle));
            }
        }
    }
}
