// =============================================================================
// REST Rate Limiter — shared token bucket acquired before every request
// =============================================================================
//
// Bybit caps public endpoints around 10 req/s per IP. Every REST consumer in
// the process shares one bucket and must `acquire()` before sending; when
// the bucket is empty the caller sleeps until the next refill instead of
// burning a 10016.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Default sustained request rate (tokens per second).
const DEFAULT_RATE: f64 = 5.0;
/// Default burst capacity.
const DEFAULT_BURST: f64 = 10.0;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared across all REST clients via `Arc`.
pub struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping as long as required. Never fails; only
    /// paces.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    // Time until one full token is available.
                    let deficit = 1.0 - bucket.tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate_per_sec))
                }
            };

            match wait {
                None => return,
                Some(d) => {
                    debug!(wait_ms = d.as_millis() as u64, "rate limiter pacing");
                    tokio::time::sleep(d).await;
                }
            }
        }
    }

    /// Try to take one token without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            bucket.last_refill = now;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_BURST)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate_per_sec", &self.rate_per_sec)
            .field("capacity", &self.capacity)
            .field("tokens", &self.bucket.lock().tokens)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_drains_then_blocks() {
        let limiter = RateLimiter::new(1.0, 3.0);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(1000.0, 2.0);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn refill_caps_at_capacity() {
        let limiter = RateLimiter::new(1000.0, 2.0);
        std::thread::sleep(Duration::from_millis(10));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        // Capacity is 2, so a long idle period still yields only 2 tokens.
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn acquire_waits_instead_of_failing() {
        let limiter = RateLimiter::new(50.0, 1.0);
        limiter.acquire().await;
        let start = Instant::now();
        limiter.acquire().await;
        // Second token needs ~20ms of refill.
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
