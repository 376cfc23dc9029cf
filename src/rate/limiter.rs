use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    capacity: f64,
    fill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.fill_rate).min(self.capacity);
    }
}

/// Token-bucket byte rate cap for one direction of one connection.
///
/// The bucket holds one second's worth of tokens. A rate of 0 disables the
/// cap and `acquire` never waits.
pub struct TokenBucket {
    inner: Option<Mutex<Bucket>>,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: u64) -> Self {
        if bytes_per_sec == 0 {
            return Self::unlimited();
        }

        let rate = bytes_per_sec as f64;
        Self {
            inner: Some(Mutex::new(Bucket {
                tokens: rate,
                capacity: rate,
                fill_rate: rate,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self { inner: None }
    }

    /// How long the caller must wait before `bytes` may pass. Tokens are
    /// debited immediately, so the balance may go negative and later
    /// callers queue up behind earlier ones.
    pub fn reserve_at(&self, now: Instant, bytes: usize) -> Duration {
        let Some(inner) = &self.inner else {
            return Duration::ZERO;
        };

        let mut bucket = inner.lock();
        bucket.refill(now);
        bucket.tokens -= bytes as f64;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / bucket.fill_rate)
        }
    }

    /// Wait until `bytes` fit under the cap
    pub async fn acquire(&self, bytes: usize) {
        let wait = self.reserve_at(Instant::now(), bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_waits() {
        let bucket = TokenBucket::new(0);
        assert_eq!(bucket.reserve_at(Instant::now(), usize::MAX), Duration::ZERO);
    }

    #[test]
    fn test_waits_once_burst_is_spent() {
        let now = Instant::now();
        let bucket = TokenBucket::new(1000);

        assert_eq!(bucket.reserve_at(now, 1000), Duration::ZERO);
        let wait = bucket.reserve_at(now, 500);
        assert_eq!(wait, Duration::from_millis(500));

        // half a second later the debt is paid off
        let later = now + Duration::from_millis(500);
        assert_eq!(bucket.reserve_at(later, 0), Duration::ZERO);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let now = Instant::now();
        let bucket = TokenBucket::new(100);

        let much_later = now + Duration::from_secs(60);
        assert_eq!(bucket.reserve_at(much_later, 100), Duration::ZERO);
        assert!(bucket.reserve_at(much_later, 1) > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_sleeps_for_the_debt() {
        let bucket = TokenBucket::new(1000);
        let start = tokio::time::Instant::now();
        bucket.acquire(1000).await;
        bucket.acquire(2000).await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
