//! Token-bucket limiter for outbound fetch traffic
//!
//! One limiter is shared by every concurrent fetch in the process. The bucket holds at
//! most one second of budget and refills continuously. Large requests are split into
//! bucket-sized chunks so a single caller never reserves more than a second of budget
//! at a time.

use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    /// Available tokens; negative when callers have reserved future budget
    tokens: f64,
    last_refill: Instant,
}

/// Shared byte-rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    bytes_per_second: u64,
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    /// Create a limiter with a sustained budget of `bytes_per_second` (clamped to at least 1)
    pub fn new(bytes_per_second: u64) -> Self {
        let bytes_per_second = bytes_per_second.max(1);
        Self {
            bytes_per_second,
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: bytes_per_second as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_second
    }

    /// Largest slice of a request granted in one reservation.
    ///
    /// After an idle second the bucket is full, so the first one-second window can see
    /// up to twice the budget: the stored burst plus one second of refill. Once the burst
    /// is spent, a window holds at most the budget plus the request being granted.
    pub fn chunk_size(&self) -> u64 {
        self.bytes_per_second
    }

    /// Wait until `n_bytes` may be transferred without exceeding the budget.
    ///
    /// Returns the instant at which the last chunk was granted.
    pub async fn acquire(&self, n_bytes: u64) -> Instant {
        let mut remaining = n_bytes;
        let mut granted_at = Instant::now();

        while remaining > 0 {
            let chunk = remaining.min(self.chunk_size());
            let wait = self.reserve(chunk).await;
            if !wait.is_zero() {
                debug!("Rate limiter delaying {} bytes by {:?}", chunk, wait);
                tokio::time::sleep(wait).await;
            }
            granted_at = Instant::now();
            remaining -= chunk;
        }

        granted_at
    }

    /// Take `chunk` tokens and return how long the caller must wait before using them.
    /// The lock is never held across the wait.
    async fn reserve(&self, chunk: u64) -> Duration {
        let rate = self.bytes_per_second as f64;
        let mut bucket = self.bucket.lock().await;

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(rate);
        bucket.last_refill = now;

        bucket.tokens -= chunk as f64;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / rate)
        }
    }
}
