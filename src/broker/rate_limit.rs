// =============================================================================
// Rate Limiter — token bucket shared by every task in a worker
// =============================================================================
//
// All broker RPCs take a permit before going on the wire. The bucket refills
// continuously at `rate_per_sec` and holds at most one second of burst;
// excess callers await their turn instead of failing.
// =============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token-bucket limiter.
pub struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

/// Immutable snapshot of the limiter (suitable for the status endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub rate_per_sec: f64,
    pub available_tokens: f64,
}

impl RateLimiter {
    /// Create a limiter allowing `rate_per_sec` requests per second with a
    /// burst of the same size. The bucket starts full.
    pub fn new(rate_per_sec: u32) -> Self {
        let rate = f64::from(rate_per_sec.max(1));
        Self {
            rate_per_sec: rate,
            capacity: rate,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a permit is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket);

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                // Time until one whole token has accumulated.
                let deficit = 1.0 - bucket.tokens;
                Duration::from_secs_f64(deficit / self.rate_per_sec)
            };

            debug!(wait_ms = wait.as_millis() as u64, "rate limiter saturated — waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Consume a permit only if one is immediately available.
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
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        RateLimitSnapshot {
            rate_per_sec: self.rate_per_sec,
            available_tokens: bucket.tokens,
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate_per_sec", &self.rate_per_sec)
            .field("available", &self.bucket.lock().tokens)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_up_to_capacity_then_block() {
        let limiter = RateLimiter::new(5);
        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire(), "bucket exhausted after burst");
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        tokio::time::pause();
        let limiter = RateLimiter::new(10);
        while limiter.try_acquire() {}

        // 100 ms at 10/s accrues exactly one token.
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn acquire_waits_for_a_permit() {
        tokio::time::pause();
        let limiter = std::sync::Arc::new(RateLimiter::new(10));
        while limiter.try_acquire() {}

        let l = limiter.clone();
        let waiter = tokio::spawn(async move { l.acquire().await });

        // Let the waiter register its sleep, then advance past refill.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(200)).await;
        waiter.await.expect("acquire completed");
    }
}
