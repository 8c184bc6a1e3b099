//! The resilient fetcher: rate limiter, then breaker, then retries.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::clock::deadline_after;
use crate::config::Config;
use crate::metrics::{MetricEvent, SharedMetrics};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::rate_limiter::RateLimiter;
use crate::resilience::retry::{RetryError, RetryPolicy};
use crate::resilience::FetchError;
use crate::source::{Source, UpstreamError};

/// Wraps a [`Source`] with per-source admission and fault tolerance.
///
/// One limiter token and one breaker permit cover a whole logical load,
/// including its retries. Successes and permanent errors count as healthy
/// breaker outcomes; only a load that exhausted its retries on transient
/// errors counts as a failure.
pub struct ResilientFetcher {
    source: Arc<dyn Source>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    metrics: SharedMetrics,
}

impl ResilientFetcher {
    pub fn new(source: Arc<dyn Source>, config: &Config, metrics: SharedMetrics) -> Self {
        let id = source.id().to_string();
        Self {
            limiter: RateLimiter::new(id.clone(), &config.rate_limit, metrics.clone()),
            breaker: CircuitBreaker::new(id, config.breaker.clone(), metrics.clone()),
            retry: RetryPolicy::from(&config.retry),
            attempt_timeout: config.retry.attempt_timeout(),
            source,
            metrics,
        }
    }

    pub fn source_id(&self) -> &str {
        self.source.id()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Load `key` from the upstream source.
    pub async fn load(&self, key: &str) -> Result<Bytes, FetchError> {
        self.limiter.acquire().await?;
        let permit = self.breaker.try_acquire()?;

        let source = self.source.as_ref();
        let attempt_timeout = self.attempt_timeout;
        let result = self
            .retry
            .run(
                |attempt| async move {
                    let deadline = deadline_after(attempt_timeout);
                    debug!(source = source.id(), key, attempt, "Fetching from upstream");
                    match tokio::time::timeout_at(deadline, source.fetch(key, deadline)).await {
                        Ok(result) => result,
                        Err(_) => Err(UpstreamError::Timeout(attempt_timeout)),
                    }
                },
                |attempt, err| {
                    debug!(source = source.id(), key, attempt, error = %err, "Upstream attempt failed, retrying");
                    self.metrics.record(MetricEvent::RetryAttempt {
                        source: source.id().to_string(),
                    });
                },
            )
            .await;

        match result {
            Ok(bytes) => {
                permit.success();
                Ok(bytes)
            }
            Err(err @ RetryError::Permanent { .. }) => {
                permit.success();
                Err(err.into())
            }
            Err(err @ RetryError::Exhausted { .. }) => {
                warn!(source = source.id(), key, attempts = err.attempts(), "Upstream retries exhausted");
                permit.failure();
                Err(err.into())
            }
        }
    }
}
