//! Sliding-window request throttle shared by all workers.
//!
//! Every admitted request leaves a timestamp in the window. A caller is
//! admitted once fewer than `limit` timestamps are younger than `period`;
//! otherwise it sleeps until the oldest one ages out. Admission is decided
//! under a single async mutex held across that sleep, so waiters are served
//! in FIFO order and two workers can never both take the last slot.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::telemetry::metrics;

/// Caps the aggregate request rate at `limit` requests per rolling `period`.
#[derive(Debug)]
pub struct RequestThrottle {
    limit: usize,
    period: Duration,
    window: Mutex<VecDeque<Instant>>,
}

impl RequestThrottle {
    /// `limit` is clamped to at least one request per window.
    pub fn new(limit: u32, period: Duration) -> Self {
        let limit = limit.max(1) as usize;
        Self {
            limit,
            period,
            window: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait until one more request fits in the window, then reserve it.
    ///
    /// Dropping the returned future before it resolves reserves nothing.
    pub async fn acquire(&self) {
        let started = Instant::now();
        let mut window = self.window.lock().await;
        loop {
            let now = Instant::now();
            while let Some(&oldest) = window.front() {
                if now.saturating_duration_since(oldest) >= self.period {
                    window.pop_front();
                } else {
                    break;
                }
            }

            if window.len() < self.limit {
                window.push_back(now);
                let waited = now.saturating_duration_since(started);
                if !waited.is_zero() {
                    debug!(waited_ms = waited.as_millis() as u64, "throttle admitted");
                }
                metrics::throttle_wait_ms().record(waited.as_secs_f64() * 1000.0, &[]);
                return;
            }

            // Full: the next slot opens when the oldest request leaves the window.
            let Some(&oldest) = window.front() else {
                continue;
            };
            tokio::time::sleep_until(oldest + self.period).await;
        }
    }

    /// Number of requests counted in the current window.
    pub async fn recent_requests(&self) -> usize {
        let window = self.window.lock().await;
        let now = Instant::now();
        window
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < self.period)
            .count()
    }
}
