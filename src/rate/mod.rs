mod limiter;

pub use limiter::TokenBucket;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default length of the sliding window
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Sliding-window throughput estimator over cumulative byte counts
#[derive(Debug, Clone)]
pub struct RateTracker {
    window: Duration,
    total: u64,
    /// (sample time, cumulative bytes at that time), oldest first
    samples: VecDeque<(Instant, u64)>,
}

impl RateTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            total: 0,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, now: Instant, bytes: u64) {
        self.total += bytes;
        self.samples.push_back((now, self.total));
        self.prune(now);
    }

    /// Bytes per second over the current window
    pub fn rate(&self) -> f64 {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&self, now: Instant) -> f64 {
        let mut live = self
            .samples
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= self.window);

        let Some(&(oldest_at, oldest_total)) = live.next() else {
            return 0.0;
        };
        let (latest_at, latest_total) = live.last().copied().unwrap_or((oldest_at, oldest_total));

        let elapsed = latest_at.saturating_duration_since(oldest_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (latest_total - oldest_total) as f64 / elapsed
    }

    /// Bytes recorded since creation
    #[cfg(test)]
    pub fn total(&self) -> u64 {
        self.total
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.saturating_duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new(RATE_WINDOW)
    }
}
