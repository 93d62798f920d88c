// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Follower replicator.
//!
//! The owning orchestrator that ties together:
//! - Initial sync via [`crate::initial_sync::InitialSyncEngine`]
//! - Continuous WAL tailing via [`crate::tailing::TailingEngine`]
//! - Applied-tick persistence via [`crate::tick_store::TickStore`]
//!
//! # Lifecycle
//!
//! 1. Opens the tick store (SQLite)
//! 2. Resumes tailing from the stored tick, or runs an initial sync first
//! 3. Tails the leader WAL, polling every `tailing.idle_wait` when idle and
//!    backing off `tailing.error_backoff` after transient failures
//! 4. If the leader no longer has the WAL we need, reruns the initial sync
//!    (`auto_resync`, at most `auto_resync_retries` times in a row)
//! 5. On shutdown, drains the worker tasks and flushes the applied tick

mod types;

pub use types::{EngineState, ReplicatorStatus};

use crate::config::ReplicationConfiguration;
use crate::error::{ReplicationError, Result};
use crate::initial_sync::{InitialSyncEngine, InitialSyncReport};
use crate::job::AbortSignal;
use crate::leader::{HttpLeaderClient, LeaderClient};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::storage::StorageEngine;
use crate::syncer::SyncerCore;
use crate::tailing::TailingEngine;
use crate::tick_store::{scope_for, TickStore};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How long shutdown waits for each worker task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval of the debounced tick store flush.
const TICK_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Progress shared between the worker task and status queries.
#[derive(Debug, Default)]
struct Progress {
    applied_tick: AtomicU64,
    leader_tick: AtomicU64,
    initial_syncs: AtomicUsize,
    resyncs: AtomicUsize,
    last_sync: StdMutex<Option<InitialSyncReport>>,
    last_error: StdMutex<Option<String>>,
}

impl Progress {
    fn set_error(&self, e: &ReplicationError) {
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn last_sync(&self) -> Option<InitialSyncReport> {
        self.last_sync.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Keeps a local database in sync with one leader database.
///
/// Owns the full follower lifecycle: initial sync, continuous tailing,
/// automatic resync and graceful shutdown. State changes are broadcast on a
/// watch channel.
pub struct FollowerReplicator {
    config: Arc<ReplicationConfiguration>,
    storage: Arc<dyn StorageEngine>,
    leader: Arc<dyn LeaderClient>,
    state_tx: Arc<watch::Sender<EngineState>>,
    state_rx: watch::Receiver<EngineState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tick_store: Option<Arc<TickStore>>,
    progress: Arc<Progress>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl FollowerReplicator {
    /// Create a replicator using `leader` as the leader connection.
    ///
    /// The replicator starts in `Created` state. Call
    /// [`start()`](Self::start) to begin replication.
    pub fn new(
        config: ReplicationConfiguration,
        storage: Arc<dyn StorageEngine>,
        leader: Arc<dyn LeaderClient>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self::build(Arc::new(config), storage, leader, shutdown_tx, shutdown_rx)
    }

    /// Create a replicator talking HTTP to `config.endpoint`.
    pub fn connect(config: ReplicationConfiguration, storage: Arc<dyn StorageEngine>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let leader = HttpLeaderClient::new(
            Arc::clone(&config),
            AbortSignal::with_shutdown(shutdown_rx.clone()),
        )?;
        Ok(Self::build(config, storage, Arc::new(leader), shutdown_tx, shutdown_rx))
    }

    fn build(
        config: Arc<ReplicationConfiguration>,
        storage: Arc<dyn StorageEngine>,
        leader: Arc<dyn LeaderClient>,
        shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        Self {
            config,
            storage,
            leader,
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx,
            shutdown_rx,
            tick_store: None,
            progress: Arc::new(Progress::default()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Arc<ReplicationConfiguration> {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_tailing(&self) -> bool {
        self.state() == EngineState::Tailing
    }

    pub fn last_error(&self) -> Option<String> {
        self.progress.last_error()
    }

    /// Report of the most recent initial sync.
    pub fn last_sync_report(&self) -> Option<InitialSyncReport> {
        self.progress.last_sync()
    }

    pub fn tick_store(&self) -> Option<&Arc<TickStore>> {
        self.tick_store.as_ref()
    }

    /// Current status for monitoring endpoints. Performs no I/O.
    pub fn status(&self) -> ReplicatorStatus {
        ReplicatorStatus {
            state: self.state(),
            applied_tick: self.progress.applied_tick.load(Ordering::Relaxed),
            leader_tick: self.progress.leader_tick.load(Ordering::Relaxed),
            initial_syncs: self.progress.initial_syncs.load(Ordering::Relaxed),
            resyncs: self.progress.resyncs.load(Ordering::Relaxed),
            last_sync_duration: self.progress.last_sync().map(|r| r.duration),
            last_error: self.progress.last_error(),
        }
    }

    /// Wait until the replicator reaches `target` or a terminal state.
    pub async fn wait_for(&self, target: EngineState) -> EngineState {
        let mut rx = self.state_rx.clone();
        loop {
            let state = *rx.borrow_and_update();
            if state == target || state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// Start replicating.
    ///
    /// 1. Opens the tick store
    /// 2. Spawns the worker task (initial sync if no tick is stored, then tailing)
    /// 3. Spawns the debounced tick flush task
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }
        self.config.validate()?;

        info!(
            server_id = %self.config.server_id,
            endpoint = %self.config.endpoint,
            database = %self.config.database,
            "Starting follower replicator"
        );

        let tick_store = Arc::new(TickStore::open(&self.config.tick_store).await?);
        let scope = scope_for(&self.config.database, None);
        let resume_from = tick_store.get(&scope).await.filter(|t| *t > 0);
        match resume_from {
            Some(tick) => info!(tick, "Resuming tailing from stored tick"),
            None => info!("No stored tick, initial sync required"),
        }
        self.tick_store = Some(Arc::clone(&tick_store));
        self.set_state(if resume_from.is_some() {
            EngineState::Tailing
        } else {
            EngineState::InitialSync
        });

        let worker = Worker {
            config: Arc::clone(&self.config),
            storage: Arc::clone(&self.storage),
            leader: Arc::clone(&self.leader),
            state_tx: Arc::clone(&self.state_tx),
            shutdown_rx: self.shutdown_rx.clone(),
            tick_store: Arc::clone(&tick_store),
            progress: Arc::clone(&self.progress),
            scope,
        };
        let worker_handle = tokio::spawn(
            worker
                .run(resume_from)
                .instrument(info_span!("follower", database = %self.config.database)),
        );

        let mut handles = self.handles.lock().await;
        handles.push(worker_handle);
        handles.push(self.spawn_tick_flush_task(tick_store));
        Ok(())
    }

    /// Spawn the debounced tick flush task.
    fn spawn_tick_flush_task(&self, tick_store: Arc<TickStore>) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(TICK_FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = tick_store.flush_dirty().await {
                            warn!(error = %e, "Failed to flush applied ticks");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Tick flush task stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Shut down gracefully.
    ///
    /// 1. Signal the worker to stop (in-flight requests are abandoned)
    /// 2. Wait for tasks to finish (bounded)
    /// 3. Flush, checkpoint and close the tick store
    pub async fn shutdown(&mut self) {
        info!("Shutting down follower replicator");
        let failed = self.state() == EngineState::Failed;
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().await);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        if let Some(store) = self.tick_store.take() {
            store.close().await;
        }

        self.set_state(if failed { EngineState::Failed } else { EngineState::Stopped });
        info!("Follower replicator stopped");
    }

    fn set_state(&self, state: EngineState) {
        self.state_tx.send_replace(state);
        metrics::set_engine_state(&state.to_string());
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

/// State moved into the worker task.
struct Worker {
    config: Arc<ReplicationConfiguration>,
    storage: Arc<dyn StorageEngine>,
    leader: Arc<dyn LeaderClient>,
    state_tx: Arc<watch::Sender<EngineState>>,
    shutdown_rx: watch::Receiver<bool>,
    tick_store: Arc<TickStore>,
    progress: Arc<Progress>,
    scope: String,
}

impl Worker {
    fn set_state(&self, state: EngineState) {
        // Never overwrite a shutdown in progress.
        let replaced = self.state_tx.send_if_modified(|current| {
            if matches!(current, EngineState::ShuttingDown | EngineState::Stopped) || *current == state {
                return false;
            }
            *current = state;
            true
        });
        if replaced {
            metrics::set_engine_state(&state.to_string());
            info!(state = %state, "Follower state changed");
        }
    }

    fn fail(&self, e: &ReplicationError) {
        error!(error = %e, "Follower replication failed");
        self.progress.set_error(e);
        self.set_state(EngineState::Failed);
    }

    fn stopping(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// A syncer context with its own abort flag tied to process shutdown.
    fn new_core(&self) -> Arc<SyncerCore> {
        Arc::new(SyncerCore::new(
            Arc::clone(&self.config),
            Arc::clone(&self.storage),
            Arc::clone(&self.leader),
            AbortSignal::with_shutdown(self.shutdown_rx.clone()),
        ))
    }

    async fn run(self, resume_from: Option<u64>) {
        let mut from = resume_from;
        let mut resyncs_in_a_row = 0usize;

        loop {
            let tick = match from {
                Some(tick) => tick,
                None => match self.initial_sync().await {
                    Ok(tick) => tick,
                    Err(e) if e.is_cancellation() && self.stopping() => return,
                    Err(e) => {
                        self.fail(&e);
                        return;
                    }
                },
            };

            self.set_state(EngineState::Tailing);
            let mut progressed = false;
            match self.tail_forever(tick, &mut progressed).await {
                Ok(()) => return,
                Err(e) if e.is_cancellation() && self.stopping() => return,
                Err(e) if e.requires_resync() => {
                    if progressed {
                        resyncs_in_a_row = 0;
                    }
                    if !self.config.auto_resync || resyncs_in_a_row >= self.config.auto_resync_retries {
                        self.fail(&e);
                        return;
                    }
                    resyncs_in_a_row += 1;
                    self.progress.resyncs.fetch_add(1, Ordering::Relaxed);
                    metrics::record_resync("tick_not_present");
                    warn!(error = %e, attempt = resyncs_in_a_row, "WAL position lost, resyncing");
                    from = None;
                }
                Err(e) => {
                    self.fail(&e);
                    return;
                }
            }
        }
    }

    /// Run initial syncs until one succeeds; returns the tick to tail from.
    async fn initial_sync(&self) -> Result<u64> {
        self.set_state(EngineState::InitialSync);
        let retry = RetryConfig::startup();
        let mut attempt = 0;

        loop {
            let core = self.new_core();
            let abort = core.abort_signal().clone();
            self.progress.initial_syncs.fetch_add(1, Ordering::Relaxed);
            match InitialSyncEngine::new(core).run(None).await {
                Ok(report) => {
                    self.tick_store.reset(&self.scope, report.last_tick).await;
                    if let Err(e) = self.tick_store.flush_dirty().await {
                        warn!(error = %e, "Failed to persist tick after initial sync");
                    }
                    self.progress.applied_tick.store(report.last_tick, Ordering::Relaxed);
                    let tick = report.last_tick;
                    *self.progress.last_sync.lock().unwrap_or_else(|p| p.into_inner()) = Some(report);
                    return Ok(tick);
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) if (e.is_retryable() || matches!(e, ReplicationError::BatchLost(_))) && retry.allows(attempt + 1) => {
                    attempt += 1;
                    self.progress.set_error(&e);
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Initial sync failed, retrying");
                    abort.fresh().sleep(delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Tail until shutdown or a non-transient error.
    async fn tail_forever(&self, from: u64, progressed: &mut bool) -> Result<()> {
        let core = self.new_core();
        let abort = core.abort_signal().clone();
        let idle_wait = self.config.tailing.idle_wait();
        let error_backoff = self.config.tailing.error_backoff();
        let mut engine = TailingEngine::new(core).with_tick_store(Arc::clone(&self.tick_store));
        let mut from = from;

        loop {
            if abort.is_aborted() {
                return Ok(());
            }
            match engine.drain(from).await {
                Ok(report) => {
                    from = report.last_applied;
                    self.progress.applied_tick.store(from, Ordering::Relaxed);
                    self.progress
                        .leader_tick
                        .fetch_max(report.leader_tick, Ordering::Relaxed);
                    if report.made_progress() {
                        *progressed = true;
                    } else if abort.sleep(idle_wait).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) if e.is_cancellation() => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, tick = from, "Tailing round failed, backing off");
                    self.progress.set_error(&e);
                    if abort.sleep(error_backoff).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
