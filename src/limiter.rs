// src/limiter.rs

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Token bucket throttling byte transfers. Clones share one bucket.
#[derive(Clone, Debug)]
pub struct SpeedLimiter {
    bucket: Option<Arc<Mutex<TokenBucket>>>,
}

#[derive(Debug)]
struct TokenBucket {
    /// Burst size in bytes, equal to one second worth of transfer.
    capacity: f64,
    tokens: f64,
    /// Bytes per second.
    rate: f64,
    last_refill: Instant,
}

impl SpeedLimiter {
    /// A rate of 0 disables throttling.
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        if rate_bytes_per_sec == 0 {
            return Self::unlimited();
        }
        let rate = rate_bytes_per_sec as f64;
        Self {
            bucket: Some(Arc::new(Mutex::new(TokenBucket {
                capacity: rate,
                tokens: rate,
                rate,
                last_refill: Instant::now(),
            }))),
        }
    }

    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    /// Waits until `amount` bytes may be transferred.
    ///
    /// Requests larger than the burst size drive the bucket negative; later
    /// callers wait for the debt to be repaid.
    pub async fn take(&self, amount: u64) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        if amount == 0 {
            return;
        }

        let wait = {
            let mut bucket = bucket.lock().await;
            bucket.refill();
            bucket.tokens -= amount as f64;
            if bucket.tokens >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-bucket.tokens / bucket.rate)
        };
        tokio::time::sleep(wait).await;
    }
}

impl TokenBucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_passes_without_waiting() {
        let limiter = SpeedLimiter::new(1000);
        let start = Instant::now();
        limiter.take(1000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn debt_is_repaid_at_the_configured_rate() {
        let limiter = SpeedLimiter::new(1000);
        let start = Instant::now();
        limiter.take(1000).await;
        limiter.take(500).await;
        assert!(start.elapsed() >= Duration::from_millis(500));

        // Larger than one burst still completes.
        limiter.take(3000).await;
        assert!(start.elapsed() >= Duration::from_millis(3500));
    }

    #[tokio::test]
    async fn zero_rate_is_unlimited() {
        let limiter = SpeedLimiter::new(0);
        assert!(limiter.is_unlimited());
        limiter.take(u64::MAX).await;
    }
}
