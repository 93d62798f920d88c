//! Configuration for follower synchronization.
//!
//! A [`ReplicationConfiguration`] is immutable for the duration of a sync run
//! and shared between the syncers as `Arc<ReplicationConfiguration>`. It can
//! be built programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use follower_sync::config::ReplicationConfiguration;
//!
//! let config = ReplicationConfiguration {
//!     endpoint: "http://leader:8529".into(),
//!     database: "shop".into(),
//!     ..ReplicationConfiguration::for_testing("follower-1")
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfiguration
//! ├── endpoint / database / server_id / credentials
//! ├── chunk_size, timeouts, batch TTL + keep-alive
//! ├── lock retry policy, intermediate commits, diff batch size
//! ├── incremental / auto_resync / include_system
//! ├── restrict: RestrictConfig     # collection filter
//! ├── tailing: TailingConfig       # WAL tailing policy
//! ├── quorum: QuorumConfig         # CAS retry policy
//! ├── leader: LeaderConnectionConfig # rate limit, circuit, retries
//! └── tick_store: TickStoreConfig  # SQLite applied-tick persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! endpoint: "http://leader.db.internal:8529"
//! database: "shop"
//! server_id: "PRMR-follower-1"
//! credentials:
//!   type: basic
//!   username: "replicator"
//!   password: "secret"
//! batch_ttl: "10m"
//! incremental: true
//! auto_resync: true
//! restrict:
//!   mode: exclude
//!   collections: ["sessions"]
//! tailing:
//!   catch_up_threshold: 500
//! tick_store:
//!   sqlite_path: "/var/lib/follower/ticks.db"
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_or(raw: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(raw).unwrap_or(fallback)
}

fn check_duration(field: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw)
        .map_err(|e| ReplicationError::Config(format!("{field}: invalid duration {raw:?}: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything a follower needs to sync against one leader database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfiguration {
    /// Leader base URL, e.g. `http://leader:8529`.
    pub endpoint: String,

    /// Database to replicate.
    pub database: String,

    /// This follower's server id, sent to the leader with every batch and
    /// WAL request.
    pub server_id: String,

    #[serde(default)]
    pub credentials: Credentials,

    /// Dump and WAL chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Per-request timeout ("10m").
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// TCP connect timeout ("10s").
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Leader batch time-to-live ("10m").
    #[serde(default = "default_batch_ttl")]
    pub batch_ttl: String,

    /// How often the batch is extended while a sync runs ("2m").
    /// Must be shorter than `batch_ttl`.
    #[serde(default = "default_batch_keepalive_interval")]
    pub batch_keepalive_interval: String,

    /// Upper bound for waiting on leader-side async jobs such as key
    /// listings ("15m").
    #[serde(default = "default_initial_sync_max_wait")]
    pub initial_sync_max_wait: String,

    /// Attempts after a local lock timeout before giving up.
    #[serde(default = "default_lock_timeout_retries")]
    pub lock_timeout_retries: usize,

    /// Fixed pause between lock-timeout retries ("5s").
    #[serde(default = "default_lock_timeout_retry_delay")]
    pub lock_timeout_retry_delay: String,

    /// Documents applied between intermediate commits during a dump.
    #[serde(default = "default_intermediate_commit_count")]
    pub intermediate_commit_count: u64,

    /// Revisions fetched or removed per flush in the diff engines.
    #[serde(default = "default_diff_batch_size")]
    pub diff_batch_size: usize,

    /// Diff non-empty local collections instead of truncating and dumping.
    #[serde(default = "default_true")]
    pub incremental: bool,

    /// Rerun the initial sync when tailing can no longer continue.
    #[serde(default)]
    pub auto_resync: bool,

    /// How many times in a row auto-resync may run before giving up.
    #[serde(default = "default_auto_resync_retries")]
    pub auto_resync_retries: usize,

    /// Replicate system collections (names starting with `_`).
    #[serde(default = "default_true")]
    pub include_system: bool,

    #[serde(default)]
    pub restrict: RestrictConfig,

    #[serde(default)]
    pub tailing: TailingConfig,

    #[serde(default)]
    pub quorum: QuorumConfig,

    #[serde(default)]
    pub leader: LeaderConnectionConfig,

    #[serde(default)]
    pub tick_store: TickStoreConfig,
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> u64 {
    16 * 1024 * 1024
}

fn default_request_timeout() -> String {
    "10m".to_string()
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

fn default_batch_ttl() -> String {
    "10m".to_string()
}

fn default_batch_keepalive_interval() -> String {
    "2m".to_string()
}

fn default_initial_sync_max_wait() -> String {
    "15m".to_string()
}

fn default_lock_timeout_retries() -> usize {
    3
}

fn default_lock_timeout_retry_delay() -> String {
    "5s".to_string()
}

fn default_intermediate_commit_count() -> u64 {
    10_000
}

fn default_diff_batch_size() -> usize {
    5000
}

fn default_auto_resync_retries() -> usize {
    2
}

impl ReplicationConfiguration {
    /// Minimal config pointing at a local leader, with short timings and an
    /// in-memory tick store.
    pub fn for_testing(server_id: &str) -> Self {
        Self {
            endpoint: "http://127.0.0.1:8529".to_string(),
            database: "_system".to_string(),
            server_id: server_id.to_string(),
            credentials: Credentials::None,
            chunk_size: 64 * 1024,
            request_timeout: "5s".to_string(),
            connect_timeout: "1s".to_string(),
            batch_ttl: "30s".to_string(),
            batch_keepalive_interval: "5s".to_string(),
            initial_sync_max_wait: "5s".to_string(),
            lock_timeout_retries: 2,
            lock_timeout_retry_delay: "10ms".to_string(),
            intermediate_commit_count: 1000,
            diff_batch_size: default_diff_batch_size(),
            incremental: true,
            auto_resync: false,
            auto_resync_retries: default_auto_resync_retries(),
            include_system: true,
            restrict: RestrictConfig::default(),
            tailing: TailingConfig::for_testing(),
            quorum: QuorumConfig::for_testing(),
            leader: LeaderConnectionConfig::for_testing(),
            tick_store: TickStoreConfig::in_memory(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        parse_or(&self.request_timeout, Duration::from_secs(600))
    }

    pub fn connect_timeout(&self) -> Duration {
        parse_or(&self.connect_timeout, Duration::from_secs(10))
    }

    pub fn batch_ttl(&self) -> Duration {
        parse_or(&self.batch_ttl, Duration::from_secs(600))
    }

    pub fn batch_keepalive_interval(&self) -> Duration {
        parse_or(&self.batch_keepalive_interval, Duration::from_secs(120))
    }

    pub fn initial_sync_max_wait(&self) -> Duration {
        parse_or(&self.initial_sync_max_wait, Duration::from_secs(900))
    }

    pub fn lock_timeout_retry_delay(&self) -> Duration {
        parse_or(&self.lock_timeout_retry_delay, Duration::from_secs(5))
    }

    /// Check for values that would make a sync run misbehave.
    ///
    /// Duration strings are parsed strictly here; the accessors above fall
    /// back to defaults instead.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(ReplicationError::Config("endpoint is empty".into()));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ReplicationError::Config(format!(
                "endpoint {:?} must be an http(s) URL",
                self.endpoint
            )));
        }
        if self.database.is_empty() {
            return Err(ReplicationError::Config("database is empty".into()));
        }
        if self.server_id.is_empty() {
            return Err(ReplicationError::Config("server_id is empty".into()));
        }
        if self.chunk_size == 0 {
            return Err(ReplicationError::Config("chunk_size must be positive".into()));
        }
        if self.diff_batch_size == 0 {
            return Err(ReplicationError::Config("diff_batch_size must be positive".into()));
        }
        if self.intermediate_commit_count == 0 {
            return Err(ReplicationError::Config(
                "intermediate_commit_count must be positive".into(),
            ));
        }

        check_duration("request_timeout", &self.request_timeout)?;
        check_duration("connect_timeout", &self.connect_timeout)?;
        check_duration("initial_sync_max_wait", &self.initial_sync_max_wait)?;
        check_duration("lock_timeout_retry_delay", &self.lock_timeout_retry_delay)?;
        let ttl = check_duration("batch_ttl", &self.batch_ttl)?;
        let keepalive = check_duration("batch_keepalive_interval", &self.batch_keepalive_interval)?;
        if keepalive.is_zero() || keepalive >= ttl {
            return Err(ReplicationError::Config(format!(
                "batch_keepalive_interval ({}) must be positive and shorter than batch_ttl ({})",
                self.batch_keepalive_interval, self.batch_ttl
            )));
        }

        self.restrict.validate()?;
        self.tailing.validate()?;
        self.quorum.validate()?;
        check_duration("leader.circuit_reset_timeout", &self.leader.circuit_reset_timeout)?;
        Ok(())
    }

    /// Whether markers and data for `name` are skipped.
    pub fn is_collection_excluded(&self, name: &str) -> bool {
        if name.starts_with('_') && !self.include_system {
            return true;
        }
        self.restrict.excludes(name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Credentials
// ═══════════════════════════════════════════════════════════════════════════════

/// How the follower authenticates against the leader.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Credentials {
    #[default]
    None,
    Basic { username: String, password: String },
    /// Bearer token, e.g. a cluster-internal JWT.
    Jwt { token: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// RestrictConfig: collection filter
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RestrictMode {
    Include,
    Exclude,
}

/// Restricts replication to (or away from) a set of collections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestrictConfig {
    #[serde(default)]
    pub mode: Option<RestrictMode>,

    #[serde(default)]
    pub collections: Vec<String>,
}

impl RestrictConfig {
    fn validate(&self) -> Result<()> {
        if self.mode.is_some() && self.collections.is_empty() {
            return Err(ReplicationError::Config(
                "restrict.mode set but restrict.collections is empty".into(),
            ));
        }
        if self.mode.is_none() && !self.collections.is_empty() {
            return Err(ReplicationError::Config(
                "restrict.collections set without restrict.mode".into(),
            ));
        }
        Ok(())
    }

    pub fn excludes(&self, name: &str) -> bool {
        let listed = self.collections.iter().any(|c| c == name);
        match self.mode {
            None => false,
            Some(RestrictMode::Include) => !listed,
            Some(RestrictMode::Exclude) => listed,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TailingConfig: WAL tailing policy
// ═══════════════════════════════════════════════════════════════════════════════

/// WAL tailing behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailingConfig {
    /// Catch-up stops once the leader is fewer than this many ticks ahead.
    #[serde(default = "default_catch_up_threshold")]
    pub catch_up_threshold: u64,

    /// Pause between polls when the leader has nothing new ("1s").
    #[serde(default = "default_idle_wait")]
    pub idle_wait: String,

    /// Pause after a failed tailing round before trying again ("5s").
    #[serde(default = "default_error_backoff")]
    pub error_backoff: String,

    /// Persist the applied tick after every chunk.
    #[serde(default = "default_true")]
    pub persist_ticks: bool,
}

fn default_catch_up_threshold() -> u64 {
    1000
}

fn default_idle_wait() -> String {
    "1s".to_string()
}

fn default_error_backoff() -> String {
    "5s".to_string()
}

impl Default for TailingConfig {
    fn default() -> Self {
        Self {
            catch_up_threshold: default_catch_up_threshold(),
            idle_wait: default_idle_wait(),
            error_backoff: default_error_backoff(),
            persist_ticks: true,
        }
    }
}

impl TailingConfig {
    pub fn for_testing() -> Self {
        Self {
            catch_up_threshold: 10,
            idle_wait: "10ms".to_string(),
            error_backoff: "10ms".to_string(),
            persist_ticks: true,
        }
    }

    pub fn idle_wait(&self) -> Duration {
        parse_or(&self.idle_wait, Duration::from_secs(1))
    }

    pub fn error_backoff(&self) -> Duration {
        parse_or(&self.error_backoff, Duration::from_secs(5))
    }

    fn validate(&self) -> Result<()> {
        check_duration("tailing.idle_wait", &self.idle_wait)?;
        check_duration("tailing.error_backoff", &self.error_backoff)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QuorumConfig: follower set persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry policy for persisting the in-sync follower list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Attempts for one compare-and-swap persistence.
    #[serde(default = "default_cas_retries")]
    pub cas_retries: usize,

    /// First backoff after a lost CAS ("50ms"), doubled per attempt.
    #[serde(default = "default_cas_backoff")]
    pub cas_backoff: String,

    /// Backoff ceiling ("2s").
    #[serde(default = "default_cas_backoff_max")]
    pub cas_backoff_max: String,
}

fn default_cas_retries() -> usize {
    10
}

fn default_cas_backoff() -> String {
    "50ms".to_string()
}

fn default_cas_backoff_max() -> String {
    "2s".to_string()
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            cas_retries: default_cas_retries(),
            cas_backoff: default_cas_backoff(),
            cas_backoff_max: default_cas_backoff_max(),
        }
    }
}

impl QuorumConfig {
    pub fn for_testing() -> Self {
        Self {
            cas_retries: 10,
            cas_backoff: "1ms".to_string(),
            cas_backoff_max: "10ms".to_string(),
        }
    }

    /// Backoff schedule for lost compare-and-swap rounds.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.cas_retries.max(1),
            initial_delay: parse_or(&self.cas_backoff, Duration::from_millis(50)),
            max_delay: parse_or(&self.cas_backoff_max, Duration::from_secs(2)),
            backoff_factor: 2.0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.cas_retries == 0 {
            return Err(ReplicationError::Config("quorum.cas_retries must be positive".into()));
        }
        check_duration("quorum.cas_backoff", &self.cas_backoff)?;
        check_duration("quorum.cas_backoff_max", &self.cas_backoff_max)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LeaderConnectionConfig: transport resilience
// ═══════════════════════════════════════════════════════════════════════════════

/// Resilience settings for talking to the leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderConnectionConfig {
    /// Attempts per request on transport failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Failures before the circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long the circuit stays open ("30s").
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout: String,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

fn default_max_attempts() -> usize {
    5
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> String {
    "30s".to_string()
}

impl Default for LeaderConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_timeout: default_circuit_reset_timeout(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl LeaderConnectionConfig {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            circuit_failure_threshold: 5,
            circuit_reset_timeout: "50ms".to_string(),
            rate_limit: RateLimitConfig::unlimited(),
        }
    }

    pub fn circuit_reset_timeout(&self) -> Duration {
        parse_or(&self.circuit_reset_timeout, Duration::from_secs(30))
    }

    /// Transport retry schedule.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            ..RetryConfig::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TickStoreConfig: applied-tick persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Where the last applied WAL tick is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickStoreConfig {
    /// SQLite database path, or `:memory:`.
    pub sqlite_path: String,

    /// Use SQLite WAL journal mode.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for TickStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "follower_ticks.db".to_string(),
            wal_mode: true,
        }
    }
}

impl TickStoreConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
