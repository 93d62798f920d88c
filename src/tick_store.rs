// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence of the last applied WAL tick.
//!
//! Tailing resumes from the last tick it applied. That tick lives in SQLite
//! so a follower restart continues where it stopped instead of running a full
//! initial sync again. Ticks are kept per *scope*: a database (`"shop"`) or a
//! single collection (`"shop/users"`).
//!
//! # Debounced Writes
//!
//! - [`TickStore::set`] updates the in-memory cache and marks the scope dirty
//! - [`TickStore::flush_dirty`] writes every dirty scope in one pass
//! - [`TickStore::close`] flushes and checkpoints
//!
//! Losing the last few `set` calls to a crash only means re-applying some
//! markers, which is harmless because marker apply is idempotent.
//!
//! ```text
//! tail chunk → apply markers → set(scope, last_included) → flush_dirty()
//!                              (crash here = replay chunk, idempotent)
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY / SQLITE_LOCKED are retried with capped exponential backoff;
//! the cache is updated first so readers never see a stale value.

use crate::config::TickStoreConfig;
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

async fn execute_with_retry<F, Fut, T>(operation: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(operation, attempts, delay_ms, "SQLite busy, retrying");
                crate::metrics::tick_store_retries_total(operation);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Tick store scope for a whole database or one of its collections.
pub fn scope_for(database: &str, collection: Option<&str>) -> String {
    match collection {
        Some(c) => format!("{database}/{c}"),
        None => database.to_string(),
    }
}

/// SQLite-backed map from scope to last applied tick.
pub struct TickStore {
    pool: SqlitePool,
    cache: RwLock<HashMap<String, u64>>,
    dirty: RwLock<HashSet<String>>,
    path: String,
}

impl std::fmt::Debug for TickStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickStore").field("path", &self.path).finish()
    }
}

impl TickStore {
    /// Open (or create) the store described by `config`.
    pub async fn open(config: &TickStoreConfig) -> Result<Self> {
        let in_memory = config.sqlite_path == ":memory:";
        info!(path = %config.sqlite_path, "Opening tick store");

        let (options, max_connections) = if in_memory {
            // Each connection gets its own in-memory database, so only one.
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {e}")))?;
            (options, 1)
        } else {
            let journal = if config.wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            };
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {e}")))?
                .journal_mode(journal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true);
            (options, 2)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(if in_memory { 1 } else { 0 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS applied_ticks (
                scope TEXT PRIMARY KEY,
                tick TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT scope, tick FROM applied_ticks")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (scope, tick) in rows {
            match tick.parse::<u64>() {
                Ok(t) => {
                    cache.insert(scope, t);
                }
                Err(_) => warn!(scope = %scope, tick = %tick, "Ignoring unparsable stored tick"),
            }
        }
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored applied ticks from previous run");
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            dirty: RwLock::new(HashSet::new()),
            path: config.sqlite_path.clone(),
        })
    }

    /// Last applied tick for `scope`, if one was ever recorded.
    pub async fn get(&self, scope: &str) -> Option<u64> {
        self.cache.read().await.get(scope).copied()
    }

    /// Record a new applied tick (debounced). Ticks never move backwards
    /// through this call; use [`TickStore::reset`] after a resync.
    pub async fn set(&self, scope: &str, tick: u64) {
        {
            let mut cache = self.cache.write().await;
            let entry = cache.entry(scope.to_string()).or_insert(0);
            if tick <= *entry && *entry != 0 {
                return;
            }
            *entry = tick;
        }
        self.dirty.write().await.insert(scope.to_string());
        debug!(scope, tick, "Applied tick updated (pending flush)");
    }

    /// Replace the tick for `scope` unconditionally. Used when a fresh
    /// initial sync establishes a new starting point.
    pub async fn reset(&self, scope: &str, tick: u64) {
        self.cache.write().await.insert(scope.to_string(), tick);
        self.dirty.write().await.insert(scope.to_string());
        info!(scope, tick, "Applied tick reset");
    }

    /// Write all dirty scopes to disk. Returns how many were written.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let scopes: Vec<String> = self.dirty.write().await.drain().collect();
        if scopes.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let snapshot: Vec<(String, u64)> = {
            let cache = self.cache.read().await;
            scopes
                .iter()
                .filter_map(|s| cache.get(s).map(|t| (s.clone(), *t)))
                .collect()
        };

        let mut flushed = 0;
        let mut errors = 0;
        for (scope, tick) in snapshot {
            let pool = &self.pool;
            let tick_text = tick.to_string();
            let result = execute_with_retry("flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO applied_ticks (scope, tick, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(scope) DO UPDATE SET
                        tick = excluded.tick,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&scope)
                .bind(&tick_text)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(scope = %scope, error = %e, "Failed to flush applied tick");
                    self.dirty.write().await.insert(scope);
                }
            }
        }

        crate::metrics::record_tick_store_flush(flushed, errors);
        if errors > 0 {
            return Err(ReplicationError::Internal(format!(
                "Failed to flush {errors} applied ticks"
            )));
        }
        debug!(flushed, "Flushed applied ticks");
        Ok(flushed)
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Forget a scope, e.g. before a full resync.
    pub async fn delete(&self, scope: &str) -> Result<()> {
        self.cache.write().await.remove(scope);
        self.dirty.write().await.remove(scope);
        let pool = &self.pool;
        let owned = scope.to_string();
        execute_with_retry("delete", || async {
            sqlx::query("DELETE FROM applied_ticks WHERE scope = ?")
                .bind(&owned)
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Fold the SQLite WAL into the main database file.
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        Ok(())
    }

    /// Flush, checkpoint and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.flush_dirty().await {
            warn!(error = %e, "Failed to flush applied ticks on close");
        }
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint tick store on close");
        }
        self.pool.close().await;
        info!("Tick store closed");
    }
}
