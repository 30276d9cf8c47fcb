//! Egress rate limiting for hinted-handoff replay.
//!
//! Each node processor's worker holds one limiter. After every successful
//! send it records the bytes written and sleeps for the computed delay,
//! holding the long-run average egress at the configured bytes/sec even
//! across restarts of the inner drain loop.

use std::time::{Duration, Instant};

/// Smooths replay egress to an average bytes/sec bound.
#[derive(Debug)]
pub struct RateLimiter {
    /// Bytes per second. 0 disables the limit.
    limit: u64,
    /// Bytes sent since `start`.
    sent: u64,
    start: Instant,
}

impl RateLimiter {
    /// Create a limiter capped at `limit` bytes/sec. 0 means unlimited.
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            sent: 0,
            start: Instant::now(),
        }
    }

    /// Record `bytes` sent.
    pub fn update(&mut self, bytes: usize) {
        self.sent = self.sent.saturating_add(bytes as u64);
    }

    /// How long to sleep so the average since creation stays at or below the
    /// limit: the time the sent volume should have taken, minus the time it
    /// actually took.
    pub fn delay(&self) -> Duration {
        if self.limit == 0 {
            return Duration::ZERO;
        }
        let expected = Duration::from_secs_f64(self.sent as f64 / self.limit as f64);
        expected.saturating_sub(self.start.elapsed())
    }
}
