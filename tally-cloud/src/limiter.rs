use tokio::time::Instant;

/// A token bucket limiting the rate of provider lookups.
///
/// The bucket holds up to `burst` tokens and refills continuously at `max_requests` tokens per
/// second. Every lookup takes one token. The limiter never waits: if the bucket is empty, the
/// lookup is rejected.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a full bucket.
    ///
    /// A `burst` of zero is treated as one, so at least a single lookup can go through.
    pub fn new(max_requests: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            rate: f64::from(max_requests),
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Takes a token if one is available at `now`.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Returns the number of whole tokens available at `now`.
    pub fn available(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens as u32
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_burst() {
        let mut limiter = RateLimiter::new(10, 15);
        let now = Instant::now();

        for _ in 0..15 {
            assert!(limiter.try_acquire(now));
        }
        assert!(!limiter.try_acquire(now));
    }

    #[test]
    fn test_refill() {
        let mut limiter = RateLimiter::new(10, 5);
        let start = Instant::now();

        for _ in 0..5 {
            assert!(limiter.try_acquire(start));
        }
        assert!(!limiter.try_acquire(start));

        // 10 tokens per second, so one token every 100ms.
        let later = start + Duration::from_millis(250);
        assert_eq!(limiter.available(later), 2);
        assert!(limiter.try_acquire(later));
        assert!(limiter.try_acquire(later));
        assert!(!limiter.try_acquire(later));
    }

    #[test]
    fn test_refill_capped_at_burst() {
        let mut limiter = RateLimiter::new(100, 3);
        let start = Instant::now();
        assert!(limiter.try_acquire(start));

        let later = start + Duration::from_secs(60);
        assert_eq!(limiter.available(later), 3);
    }

    #[test]
    fn test_zero_rate_never_refills() {
        let mut limiter = RateLimiter::new(0, 1);
        let start = Instant::now();

        assert!(limiter.try_acquire(start));
        assert!(!limiter.try_acquire(start + Duration::from_secs(3600)));
    }
}
