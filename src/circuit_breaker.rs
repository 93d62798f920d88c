//! Circuit breakers guarding calls to the leader.
//!
//! A leader that is down or overloaded should not be hit by every retry of
//! every syncer. Calls go through a [`CircuitBreaker`] built on `recloser`;
//! once it trips, requests fail fast with [`CircuitError::Rejected`] until
//! the recovery timeout lets a few probe calls through.
//!
//! # States
//!
//! - **Closed**: requests pass through
//! - **Open**: leader considered unhealthy, requests rejected immediately
//! - **HalfOpen**: probing whether the leader recovered
//!
//! Two breakers exist per leader ([`LeaderCircuit`]): one for control
//! requests (batches, inventory, version) and one for bulk data transfer
//! (dump, revisions, WAL). A slow dump endpoint must not block batch
//! keep-alives.

use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Breaker state as reported to metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Outcome of a breaker-protected call.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The breaker is open and did not attempt the call.
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The call was attempted and failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Trip and recovery thresholds.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failures within the closed window that trip the breaker.
    pub failure_threshold: u32,
    /// Probe calls allowed while half-open.
    pub success_threshold: u32,
    /// Time spent open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips quickly, recovers cautiously. Used for bulk data endpoints.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// Tolerates more failures. Used for control requests.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(15),
        }
    }

    /// Short recovery for tests.
    pub fn testing() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    calls_total: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("calls_total", &self.calls_total())
            .field("failures", &self.failures())
            .field("rejections", &self.rejections())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_threshold as f32 / 100.0)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` through the breaker.
    ///
    /// Only the outer `Err` counts against the breaker. Callers that want
    /// some failures (e.g. malformed responses) not to trip it return them
    /// inside an `Ok`.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                metrics::record_circuit_state(&self.name, CircuitState::Closed);
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit open, leader request rejected");
                metrics::record_circuit_state(&self.name, CircuitState::Open);
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// Breakers for one leader endpoint.
#[derive(Debug)]
pub struct LeaderCircuit {
    /// Version, batch, inventory, job polling.
    pub control: CircuitBreaker,
    /// Dump, key listings, revision trees/ranges/documents, WAL tail.
    pub data: CircuitBreaker,
}

impl Default for LeaderCircuit {
    fn default() -> Self {
        Self::new(CircuitConfig::lenient(), CircuitConfig::aggressive())
    }
}

impl LeaderCircuit {
    pub fn new(control: CircuitConfig, data: CircuitConfig) -> Self {
        Self {
            control: CircuitBreaker::new("leader_control", control),
            data: CircuitBreaker::new("leader_data", data),
        }
    }

    pub fn any_rejecting(&self) -> bool {
        self.control.rejections() > 0 || self.data.rejections() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_passes_through() {
        let cb = CircuitBreaker::new("t", CircuitConfig::testing());
        let r: Result<u32, CircuitError<String>> = cb.call(|| async { Ok(7) }).await;
        assert_eq!(r.unwrap(), 7);
        assert_eq!(cb.calls_total(), 1);
        assert_eq!(cb.failures(), 0);
    }

    #[tokio::test]
    async fn test_trips_after_failures() {
        let cb = CircuitBreaker::new("t", CircuitConfig::testing());
        for _ in 0..5 {
            let _ = cb.call(|| async { Err::<(), _>("down".to_string()) }).await;
        }
        let r = cb.call(|| async { Ok::<_, String>(()) }).await;
        assert!(r.unwrap_err().is_rejected());
        assert!(cb.rejections() >= 1);
    }

    #[tokio::test]
    async fn test_recovers_after_timeout() {
        let cb = CircuitBreaker::new("t", CircuitConfig::testing());
        for _ in 0..5 {
            let _ = cb.call(|| async { Err::<(), _>("down".to_string()) }).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        let r = cb.call(|| async { Ok::<_, String>(1) }).await;
        assert_eq!(r.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ok_wrapped_errors_do_not_trip() {
        let cb = CircuitBreaker::new("t", CircuitConfig::testing());
        for _ in 0..10 {
            let r: Result<Result<(), String>, CircuitError<String>> =
                cb.call(|| async { Ok(Err("malformed".to_string())) }).await;
            assert!(r.unwrap().is_err());
        }
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.rejections(), 0);
    }

    #[test]
    fn test_leader_circuit_names() {
        let lc = LeaderCircuit::default();
        assert_eq!(lc.control.name(), "leader_control");
        assert_eq!(lc.data.name(), "leader_data");
        assert!(!lc.any_rejecting());
    }
}
