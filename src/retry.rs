//! Retry decisions for failed attempts.
//!
//! Pure: the decision depends only on the attempt number and the failure
//! kind. Delays come from a jitter-free backon exponential schedule with a
//! per-kind base and a shared cap. Rate-limited failures start from a longer
//! base than transient ones.

use backon::{BackoffBuilder, ExponentialBuilder};
use std::time::Duration;

use crate::model::FailureKind;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Submit again after the delay.
    Retry(Duration),
    /// Give up. The item is recorded as failed.
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed per item, including the first.
    pub max_attempts: u32,
    /// Delay after the first transient failure.
    pub backoff_base: Duration,
    /// Upper bound on any delay.
    pub backoff_cap: Duration,
    /// Delay after the first rate-limited failure.
    pub rate_limit_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            rate_limit_base: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Decide what follows failed attempt number `attempt` (1-based).
    pub fn decide(&self, attempt: u32, kind: FailureKind) -> RetryDecision {
        if !kind.is_retryable() || attempt >= self.max_attempts {
            return RetryDecision::Stop;
        }
        RetryDecision::Retry(self.delay(attempt, kind))
    }

    /// Backoff after failed attempt number `attempt`, ignoring the attempt limit.
    pub fn delay(&self, attempt: u32, kind: FailureKind) -> Duration {
        // Doubling reaches any cap within this many steps; later attempts
        // all wait the cap.
        const MAX_STEPS: u32 = 64;
        let steps = attempt.clamp(1, MAX_STEPS);
        self.schedule(kind)
            .with_max_times(steps as usize)
            .build()
            .nth(steps as usize - 1)
            .unwrap_or(self.backoff_cap)
    }

    /// The exponential schedule for one failure kind.
    fn schedule(&self, kind: FailureKind) -> ExponentialBuilder {
        let (base, cap) = match kind {
            // A quota signal always waits at least the rate-limit base.
            FailureKind::RateLimited => (
                self.rate_limit_base,
                self.backoff_cap.max(self.rate_limit_base),
            ),
            _ => (self.backoff_base, self.backoff_cap),
        };
        ExponentialBuilder::new()
            .with_min_delay(base)
            .with_max_delay(cap)
            .with_factor(2.0)
    }
}
