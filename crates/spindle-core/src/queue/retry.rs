//! Retry policy: decides backoff delays.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::ports::add_std;

/// 2s, 3s, 5s, 10s, 30s, 1m, 5m
pub const DEFAULT_BACKOFF_MS: [u64; 7] = [2_000, 3_000, 5_000, 10_000, 30_000, 60_000, 300_000];

/// Retry policy for failed tasks.
///
/// The delay for a task is looked up in a fixed table by its retry count,
/// clamping at the last entry. Retries are unbounded; a task keeps being
/// retried at the last interval until it succeeds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    intervals: Vec<Duration>,

    /// Fraction of the gap to the next table entry added as random extra.
    /// `0.0` keeps the schedule deterministic.
    jitter_ratio: f64,
}

impl RetryPolicy {
    /// An empty table falls back to the default one.
    pub fn new(intervals: Vec<Duration>, jitter_ratio: f64) -> Self {
        let intervals = if intervals.is_empty() {
            Self::default_intervals()
        } else {
            intervals
        };
        let jitter_ratio = if jitter_ratio.is_finite() {
            jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            intervals,
            jitter_ratio,
        }
    }

    pub fn default_intervals() -> Vec<Duration> {
        DEFAULT_BACKOFF_MS
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    pub fn intervals(&self) -> &[Duration] {
        &self.intervals
    }

    pub fn jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    /// Delay before the next attempt of a task that has already failed
    /// `retry_count` times (counted before this failure).
    ///
    /// With jitter, the extra is drawn from `[0, ratio * (next - current)]`, so
    /// a delay never passes the following table entry. The last entry has no
    /// successor and is never jittered.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let last = self.intervals.len() - 1;
        let idx = usize::try_from(retry_count).map_or(last, |n| n.min(last));
        let base = self.intervals[idx];

        if self.jitter_ratio <= 0.0 || idx == last {
            return base;
        }
        let spread = self.intervals[idx + 1].saturating_sub(base);
        let factor = self.jitter_ratio * rand::thread_rng().gen_range(0.0..=1.0);
        base + spread.mul_f64(factor)
    }

    pub fn next_retry_time(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        add_std(now, self.delay(retry_count))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::default_intervals(), 0.0)
    }
}
