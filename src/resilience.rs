// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backoff, apply throttling and session limits.
//!
//! - [`RetryConfig`]: exponential backoff between Client reconnects
//! - [`RateLimiter`]: token bucket in front of a Client's applier
//! - [`Bulkhead`]: cap on concurrent wire sessions per listener
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), mesh_replication::resilience::BulkheadFull> {
//! use mesh_replication::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! // At most 1000 applies/sec, bursts of 100
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await;
//!
//! // At most 10 concurrent sessions
//! let bulkhead = Bulkhead::new(10);
//! let _permit = bulkhead.acquire().await?;
//! # Ok(())
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
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Reconnect policy for a Client.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Consecutive failed sessions before the Client halts.
    /// `usize::MAX` retries forever.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,

    /// Multiplier applied per attempt.
    pub backoff_factor: f64,

    /// Bound on opening one upstream stream.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Bounded retry for the first connection of a fresh replica.
    ///
    /// Gives up after roughly 45s so a misconfigured upstream address
    /// surfaces as a halt instead of silent retrying.
    pub fn startup() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Retry forever, backoff capped at 5 minutes.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9        256s
    /// 10+      300s
    /// ```
    ///
    /// A replica that outlives an upstream outage catches up on its own.
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Delay before retry `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        // Clamp the exponent; powi overflows to inf long before usize does
        let exponent = (attempt - 1).min(64) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket settings: `refill_rate` tokens/sec, up to `burst_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,

    #[serde(default = "default_refill_rate")]
    pub refill_rate: u32,
}

fn default_burst_size() -> u32 {
    100
}

fn default_refill_rate() -> u32 {
    1000
}

impl Default for RateLimitConfig {
    /// 1000 applies/sec with a burst of 100.
    fn default() -> Self {
        Self {
            burst_size: default_burst_size(),
            refill_rate: default_refill_rate(),
        }
    }
}

impl RateLimitConfig {
    /// For constrained replicas sharing a disk with other workloads.
    pub fn conservative() -> Self {
        Self {
            burst_size: 10,
            refill_rate: 100,
        }
    }
}

/// Token bucket limiter. One token per applied event.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
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

    /// Take a token if one is available.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent sessions")]
pub struct BulkheadFull {
    pub max_concurrent: usize,
}

/// Semaphore-backed limit on concurrent sessions.
///
/// The listener uses [`try_acquire`](Self::try_acquire) so a full
/// bulkhead turns a new session away immediately instead of queueing it.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Wait for a slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Take a slot without waiting; `None` when full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.max_concurrent.saturating_sub(self.available())
    }

    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_config() {
        let config = RetryConfig::daemon();
        assert_eq!(config.max_attempts, usize::MAX);
        assert_eq!(config.max_delay, Duration::from_secs(300));
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_for_huge_attempt_is_capped() {
        let config = RetryConfig::daemon();
        assert_eq!(config.delay_for_attempt(10_000), Duration::from_secs(300));
        assert_eq!(config.delay_for_attempt(usize::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_startup_preset_is_bounded() {
        let config = RetryConfig::startup();
        assert_eq!(config.max_attempts, 20);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(1125));
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_config_testing_preset() {
        let config = RetryConfig::testing();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay, Duration::from_millis(10));
        assert_eq!(config.connection_timeout, Duration::from_millis(500));
    }

    // =========================================================================
    // Rate Limiter Tests
    // =========================================================================

    #[test]
    fn test_rate_limit_config_deserialize_defaults() {
        let config: RateLimitConfig = serde_json::from_str(r#"{"refill_rate": 50}"#).unwrap();
        assert_eq!(config.refill_rate, 50);
        assert_eq!(config.burst_size, 100);
    }

    #[test]
    fn test_rate_limiter_try_acquire_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 5,
            refill_rate: 1000,
        });

        for _ in 0..5 {
            assert!(limiter.try_acquire(), "should acquire within burst");
        }
        assert!(!limiter.try_acquire(), "should fail after burst exhausted");
    }

    #[tokio::test]
    async fn test_rate_limiter_acquire_refills() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 1,
            refill_rate: 1000,
        });

        limiter.acquire().await;
        let start = std::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100), "should refill quickly");
    }

    #[test]
    fn test_zero_rates_do_not_panic() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 0,
            refill_rate: 0,
        });
        assert!(limiter.try_acquire());
    }

    // =========================================================================
    // Bulkhead Tests
    // =========================================================================

    #[test]
    fn test_bulkhead_try_acquire() {
        let bulkhead = Bulkhead::new(2);

        let p1 = bulkhead.try_acquire();
        assert!(p1.is_some());
        let p2 = bulkhead.try_acquire();
        assert!(p2.is_some());
        assert!(bulkhead.is_full());
        assert_eq!(bulkhead.in_use(), 2);
        assert!(bulkhead.try_acquire().is_none());

        drop(p1);
        assert_eq!(bulkhead.available(), 1);
        assert!(bulkhead.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_bulkhead_acquire_waits() {
        let bulkhead = Arc::new(Bulkhead::new(1));
        let bulkhead2 = Arc::clone(&bulkhead);

        let permit = bulkhead.acquire().await.unwrap();
        let handle = tokio::spawn(async move {
            let start = std::time::Instant::now();
            let _p = bulkhead2.acquire().await.unwrap();
            start.elapsed()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(permit);

        let wait_time = handle.await.unwrap();
        assert!(wait_time >= Duration::from_millis(40), "should have waited");
    }

    #[test]
    fn test_bulkhead_full_error() {
        let err = BulkheadFull { max_concurrent: 10 };
        assert_eq!(err.to_string(), "bulkhead full: max 10 concurrent sessions");
    }
}
