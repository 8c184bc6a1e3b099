//! Token-bucket admission control for upstream calls.

use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::clock::deadline_after;
use crate::config::RateLimitConfig;
use crate::metrics::{MetricEvent, SharedMetrics};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("rate limit exceeded for source {source_id}, next token in {retry_after:?}")]
pub struct RateLimitExceeded {
    pub source_id: String,
    pub retry_after: Duration,
}

/// What `acquire` does when the bucket is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Fail immediately.
    Reject,
    /// Wait for a token, giving up after `timeout`.
    Wait { timeout: Duration },
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    source_id: String,
    capacity: f64,
    refill_per_sec: f64,
    mode: AcquireMode,
    bucket: Mutex<Bucket>,
    metrics: SharedMetrics,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("source_id", &self.source_id)
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .field("mode", &self.mode)
            .finish()
    }
}

impl RateLimiter {
    /// A bucket that starts full.
    pub fn new(source_id: impl Into<String>, config: &RateLimitConfig, metrics: SharedMetrics) -> Self {
        let capacity = f64::from(config.capacity);
        let mode = if config.blocking {
            AcquireMode::Wait {
                timeout: config.acquire_timeout(),
            }
        } else {
            AcquireMode::Reject
        };
        Self {
            source_id: source_id.into(),
            capacity,
            refill_per_sec: config.refill_per_sec,
            mode,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            metrics,
        }
    }

    /// Tokens currently available, after refill.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Take a token or report how long until one is available.
    fn take(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }
        if self.refill_per_sec <= 0.0 {
            return Err(Duration::MAX);
        }
        let missing = 1.0 - bucket.tokens;
        Err(Duration::try_from_secs_f64(missing / self.refill_per_sec).unwrap_or(Duration::MAX))
    }

    fn exceeded(&self, retry_after: Duration) -> RateLimitExceeded {
        self.metrics.record(MetricEvent::RateLimited {
            source: self.source_id.clone(),
        });
        debug!(source = %self.source_id, ?retry_after, "Rate limited");
        RateLimitExceeded {
            source_id: self.source_id.clone(),
            retry_after,
        }
    }

    /// Take a token without waiting.
    pub fn try_acquire(&self) -> Result<(), RateLimitExceeded> {
        self.take().map_err(|wait| self.exceeded(wait))
    }

    /// Take a token according to the configured [`AcquireMode`].
    pub async fn acquire(&self) -> Result<(), RateLimitExceeded> {
        let timeout = match self.mode {
            AcquireMode::Reject => return self.try_acquire(),
            AcquireMode::Wait { timeout } => timeout,
        };

        let deadline = deadline_after(timeout);
        loop {
            let wait = match self.take() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            let now = Instant::now();
            if wait > deadline.saturating_duration_since(now) {
                return Err(self.exceeded(wait));
            }
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::metrics::testing::RecordingMetrics;

    fn limiter(blocking: bool, acquire_timeout_ms: u64) -> (RateLimiter, Arc<RecordingMetrics>) {
        let metrics = Arc::new(RecordingMetrics::default());
        let config = RateLimitConfig {
            capacity: 5,
            refill_per_sec: 1.0,
            blocking,
            acquire_timeout_ms,
        };
        (RateLimiter::new("upstream", &config, metrics.clone()), metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_reject() {
        let (l, metrics) = limiter(false, 0);
        for _ in 0..5 {
            l.try_acquire().unwrap();
        }
        let err = l.try_acquire().unwrap_err();
        assert_eq!(err.source_id, "upstream");
        assert_eq!(err.retry_after, Duration::from_secs(1));
        assert_eq!(metrics.count(|e| matches!(e, MetricEvent::RateLimited { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refills_over_time_up_to_capacity() {
        let (l, _) = limiter(false, 0);
        for _ in 0..5 {
            l.try_acquire().unwrap();
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!((l.available() - 2.0).abs() < 1e-9);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!((l.available() - 5.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_waits_for_refill() {
        let (l, _) = limiter(true, 2_000);
        for _ in 0..5 {
            l.acquire().await.unwrap();
        }
        let start = Instant::now();
        l.acquire().await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_millis(1_100), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_times_out() {
        let (l, _) = limiter(true, 500);
        for _ in 0..5 {
            l.acquire().await.unwrap();
        }
        let start = Instant::now();
        assert!(l.acquire().await.is_err());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_refill_rate_saturates_wait() {
        let config = RateLimitConfig {
            capacity: 1,
            refill_per_sec: 1e-300,
            blocking: true,
            acquire_timeout_ms: u64::MAX,
        };
        let l = RateLimiter::new("upstream", &config, Arc::new(RecordingMetrics::default()));
        l.try_acquire().unwrap();
        assert_eq!(l.try_acquire().unwrap_err().retry_after, Duration::MAX);
        assert_eq!(l.acquire().await.unwrap_err().retry_after, Duration::MAX);
    }
}
