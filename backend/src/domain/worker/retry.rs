//! Retry pacing: exponential backoff, jitter, and sleeping abstractions.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

/// Retry limits and backoff bounds for one task class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum re-dispatches after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Exponential base delay for the given 1-indexed attempt, capped.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = 2_u32.saturating_pow(attempt.saturating_sub(1));
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(u64::from(exponent)).min(cap_ms))
    }
}

/// Async sleeping abstraction so tests can run without wall-clock waits.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Jitter strategy applied over the exponential base delay.
pub trait BackoffJitter: Send + Sync {
    fn jittered(&self, base: Duration) -> Duration;
}

/// Equal jitter: half the delay is fixed, half uniformly random, so retries
/// from a burst of failures spread out instead of stampeding.
pub struct EqualJitter;

impl BackoffJitter for EqualJitter {
    fn jittered(&self, base: Duration) -> Duration {
        let half = base / 2;
        let spread = half.as_millis() as u64;
        if spread == 0 {
            return base;
        }
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}
