//! Fault tolerance around upstream loads.
//!
//! - [`circuit_breaker`]: per-source Closed/Open/HalfOpen breaker
//! - [`retry`]: bounded exponential backoff with jitter
//! - [`rate_limiter`]: token bucket admission
//! - [`fetcher`]: composes the three around a [`Source`](crate::source::Source)

pub mod circuit_breaker;
pub mod fetcher;
pub mod rate_limiter;
pub mod retry;

use thiserror::Error;

use crate::source::{ErrorClass, UpstreamError};

pub use circuit_breaker::{CircuitBreaker, CircuitOpenError, CircuitState};
pub use fetcher::ResilientFetcher;
pub use rate_limiter::{RateLimitExceeded, RateLimiter};
pub use retry::{Classify, RetryError, RetryPolicy};

/// Why a resilient load failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: UpstreamError },

    /// A permanent upstream error, surfaced without retrying.
    #[error(transparent)]
    Upstream(UpstreamError),
}

impl From<RetryError<UpstreamError>> for FetchError {
    fn from(err: RetryError<UpstreamError>) -> Self {
        match err {
            RetryError::Permanent { error, .. } => FetchError::Upstream(error),
            RetryError::Exhausted { attempts, last } => FetchError::RetriesExhausted { attempts, last },
        }
    }
}

/// Breaker and limiter rejections are permanent for retry purposes.
impl Classify for FetchError {
    fn class(&self) -> ErrorClass {
        match self {
            FetchError::Upstream(e) => e.class(),
            FetchError::CircuitOpen(_) | FetchError::RateLimited(_) | FetchError::RetriesExhausted { .. } => {
                ErrorClass::Permanent
            }
        }
    }
}
