//! Bounded retries with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::RetryConfig;
use crate::source::{ErrorClass, UpstreamError};

/// Errors the retry loop can classify.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for UpstreamError {
    fn class(&self) -> ErrorClass {
        UpstreamError::class(self)
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// A permanent error; the operation was not retried further.
    Permanent { attempts: u32, error: E },
    /// Every attempt failed with a transient error.
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. } | RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            multiplier: config.multiplier,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exp = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let secs = self.initial_backoff.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::try_from_secs_f64((base.as_secs_f64() + offset).max(0.0)).unwrap_or(base)
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// `op` receives the 1-based attempt number. `on_retry` is called with the
    /// failed attempt number and its error before each backoff sleep.
    pub async fn run<T, E, F, Fut, R>(&self, mut op: F, mut on_retry: R) -> Result<T, RetryError<E>>
    where
        E: Classify,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(u32, &E),
    {
        let mut attempt = 1;
        loop {
            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if error.class() == ErrorClass::Permanent {
                return Err(RetryError::Permanent { attempts: attempt, error });
            }
            if attempt >= self.max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            on_retry(attempt, &error);
            let delay = self.jittered(self.backoff_for(attempt));
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::from(&RetryConfig {
            max_attempts,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
            attempt_timeout_ms: 1_000,
        })
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = policy(10);
        assert_eq!(p.backoff_for(1), Duration::from_millis(100));
        assert_eq!(p.backoff_for(2), Duration::from_millis(200));
        assert_eq!(p.backoff_for(4), Duration::from_millis(800));
        assert_eq!(p.backoff_for(5), Duration::from_millis(1_000));
        assert_eq!(p.backoff_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let p = RetryPolicy {
            jitter: 0.2,
            ..policy(3)
        };
        for _ in 0..100 {
            let d = p.jittered(Duration::from_millis(1_000));
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1_200), "{d:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exhaust_attempts() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let start = tokio::time::Instant::now();

        let result: Result<(), _> = policy(3)
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(UpstreamError::Connection("reset".into())) }
                },
                |attempt, _| retries.push(attempt),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
        assert_eq!(
            result.unwrap_err(),
            RetryError::Exhausted {
                attempts: 3,
                last: UpstreamError::Connection("reset".into())
            }
        );
        // 100ms + 200ms of backoff.
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(5)
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(UpstreamError::NotFound("k".into())) }
                },
                |_, _| {},
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_later_attempt() {
        let result = policy(3)
            .run(
                |attempt| async move {
                    if attempt < 3 {
                        Err(UpstreamError::Timeout(Duration::from_millis(5)))
                    } else {
                        Ok(attempt)
                    }
                },
                |_, _| {},
            )
            .await;
        assert_eq!(result.unwrap(), 3);
    }
}
