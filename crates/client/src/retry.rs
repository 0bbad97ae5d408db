//! Reconnection backoff: when to retry and when to give up.

use std::time::Duration;

/// Facts about the reconnection attempt about to be made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    /// Failed attempts since the drop (0 for the first retry).
    pub previous_retry_count: u32,
    /// Wall-clock time spent reconnecting so far.
    pub elapsed: Duration,
}

impl RetryContext {
    pub fn new(previous_retry_count: u32, elapsed: Duration) -> Self {
        Self {
            previous_retry_count,
            elapsed,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis().min(u64::MAX as u128) as u64
    }
}

/// Decides how long to wait before the next reconnection attempt.
pub trait ReconnectPolicy: Send + Sync {
    /// `None` stops retrying.
    fn next_delay(&self, context: &RetryContext) -> Option<Duration>;
}

/// Exponential backoff capped per attempt, inside a bounded retry window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    window_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, window_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            window_ms,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Delay in milliseconds, or `None` once the window is spent.
    pub fn next_delay_ms(&self, context: &RetryContext) -> Option<u64> {
        if context.elapsed_ms() >= self.window_ms {
            return None;
        }
        let shift = context.previous_retry_count.min(32);
        let multiplier = 1_u64 << shift;
        Some(
            self.base_delay_ms
                .saturating_mul(multiplier)
                .min(self.max_delay_ms),
        )
    }
}

impl Default for BackoffPolicy {
    /// 1s, 2s, 4s, 8s, 16s, then 30s per attempt, for up to 60s.
    fn default() -> Self {
        Self::new(1_000, 30_000, 60_000)
    }
}

impl ReconnectPolicy for BackoffPolicy {
    fn next_delay(&self, context: &RetryContext) -> Option<Duration> {
        self.next_delay_ms(context).map(Duration::from_millis)
    }
}
