//! Retry schedules and leader request rate limiting.
//!
//! - [`RetryConfig`]: exponential backoff for transient leader failures
//! - [`RateLimiter`]: token bucket bounding how fast we hit the leader
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use follower_sync::resilience::{RateLimiter, RateLimitConfig, RetryConfig};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await;
//!
//! let retry = RetryConfig::default();
//! let pause = retry.delay_for_attempt(3);
//! # let _ = pause;
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;

/// Backoff schedule for retried leader requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    /// `usize::MAX` retries forever.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,

    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    /// Five attempts, 250ms doubling up to 10s.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Patient schedule for the first contact with a leader.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        500ms
    /// 2        750ms
    /// 3        1.12s
    /// ...
    /// 15       30s (cap)
    /// ```
    pub fn startup() -> Self {
        Self {
            max_attempts: 15,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
        }
    }

    /// Never give up. Used by continuous tailing between chunks, where
    /// the follower should recover on its own once the leader returns.
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }

    /// Fast-failing schedule for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }
        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens that may be spent at once.
    #[serde(default = "default_burst")]
    pub burst_size: u32,

    /// Tokens refilled per second.
    #[serde(default = "default_refill")]
    pub refill_rate: u32,
}

fn default_burst() -> u32 {
    50
}

fn default_refill() -> u32 {
    200
}

impl Default for RateLimitConfig {
    /// 200 leader requests/sec with a burst of 50.
    fn default() -> Self {
        Self {
            burst_size: default_burst(),
            refill_rate: default_refill(),
        }
    }
}

impl RateLimitConfig {
    /// Tight limit for leaders shared with heavy client traffic.
    pub fn conservative() -> Self {
        Self {
            burst_size: 5,
            refill_rate: 20,
        }
    }

    /// Effectively unlimited.
    pub fn unlimited() -> Self {
        Self {
            burst_size: u32::MAX,
            refill_rate: u32::MAX,
        }
    }
}

/// Token bucket limiter shared by all requests of one leader client.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait for a token. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(RetryConfig::daemon().max_attempts, usize::MAX);
        assert_eq!(RetryConfig::startup().max_attempts, 15);
        assert_eq!(RetryConfig::testing().initial_delay, Duration::from_millis(5));
        assert_eq!(RetryConfig::default().max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
        // Large exponents must not overflow Duration
        assert_eq!(config.delay_for_attempt(100_000), Duration::from_secs(30));
    }

    #[test]
    fn test_allows() {
        let config = RetryConfig::testing();
        assert!(config.allows(0));
        assert!(config.allows(2));
        assert!(!config.allows(3));
        assert!(RetryConfig::daemon().allows(1_000_000));
    }

    #[test]
    fn test_rate_limiter_burst_exhaustion() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 3,
            refill_rate: 1,
        });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_rate_limiter_refills() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 1,
            refill_rate: 1000,
        });
        limiter.acquire().await;
        let start = std::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_rate_limit_config_serde_defaults() {
        let config: RateLimitConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.burst_size, 50);
        assert_eq!(config.refill_rate, 200);
        assert_eq!(RateLimitConfig::unlimited().burst_size, u32::MAX);
    }
}
