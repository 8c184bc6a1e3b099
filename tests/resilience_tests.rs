//! Breaker, retry and rate limiter behavior through the public API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use artifact_cache_tier::config::{BreakerConfig, Config, RateLimitConfig, RetryConfig};
use artifact_cache_tier::metrics::{noop, MetricEvent, MetricsSink};
use artifact_cache_tier::resilience::{
    CircuitBreaker, CircuitState, FetchError, RateLimiter, ResilientFetcher, RetryError, RetryPolicy,
};
use artifact_cache_tier::source::{Source, UpstreamError};

#[derive(Default)]
struct Events(Mutex<Vec<MetricEvent>>);

impl MetricsSink for Events {
    fn record(&self, event: MetricEvent) {
        self.0.lock().push(event);
    }
}

fn breaker_config() -> BreakerConfig {
    BreakerConfig {
        failure_ratio: 0.5,
        window_size: 10,
        minimum_calls: 5,
        cooldown_ms: 5_000,
        cooldown_multiplier: 2.0,
        max_cooldown_ms: 60_000,
        half_open_probes: 1,
    }
}

#[tokio::test(start_paused = true)]
async fn test_breaker_full_cycle() {
    let events = Arc::new(Events::default());
    let breaker = CircuitBreaker::new("pipeline", breaker_config(), events.clone());

    for _ in 0..5 {
        breaker.try_acquire().unwrap().failure();
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(breaker.try_acquire().is_err());

    // Failed probe: back to Open with a doubled cooldown.
    tokio::time::advance(Duration::from_secs(5)).await;
    breaker.try_acquire().unwrap().failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(breaker.try_acquire().is_err());

    // Successful probe: Closed.
    tokio::time::advance(Duration::from_secs(5)).await;
    breaker.try_acquire().unwrap().success();
    assert_eq!(breaker.state(), CircuitState::Closed);

    let transitions: Vec<_> = events
        .0
        .lock()
        .iter()
        .filter_map(|e| match e {
            MetricEvent::BreakerTransition { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            CircuitState::Open,
            CircuitState::HalfOpen,
            CircuitState::Open,
            CircuitState::HalfOpen,
            CircuitState::Closed
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_counts_attempts() {
    let policy = RetryPolicy::from(&RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 50,
        max_backoff_ms: 500,
        multiplier: 2.0,
        jitter: 0.2,
        attempt_timeout_ms: 1_000,
    });

    let attempts = AtomicU32::new(0);
    let result: Result<(), _> = policy
        .run(
            |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(UpstreamError::Timeout(Duration::from_millis(10))) }
            },
            |_, _| {},
        )
        .await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));

    attempts.store(0, Ordering::SeqCst);
    let result: Result<(), _> = policy
        .run(
            |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(UpstreamError::Rejected {
                        status: 422,
                        message: "unparseable".into(),
                    })
                }
            },
            |_, _| {},
        )
        .await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(matches!(result, Err(RetryError::Permanent { attempts: 1, .. })));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limiter_five_per_second() {
    let reject = RateLimiter::new(
        "pipeline",
        &RateLimitConfig {
            capacity: 5,
            refill_per_sec: 1.0,
            blocking: false,
            acquire_timeout_ms: 0,
        },
        noop(),
    );
    for _ in 0..5 {
        reject.acquire().await.unwrap();
    }
    assert!(reject.acquire().await.is_err());

    let wait = RateLimiter::new(
        "pipeline",
        &RateLimitConfig {
            capacity: 5,
            refill_per_sec: 1.0,
            blocking: true,
            acquire_timeout_ms: 5_000,
        },
        noop(),
    );
    for _ in 0..5 {
        wait.acquire().await.unwrap();
    }
    let start = Instant::now();
    wait.acquire().await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(1));
}

/// Fails transiently a fixed number of times, then succeeds.
struct Flaky {
    failures_left: AtomicU32,
    calls: AtomicU32,
}

#[async_trait]
impl Source for Flaky {
    fn id(&self) -> &str {
        "flaky"
    }

    async fn fetch(&self, key: &str, deadline: Instant) -> Result<Bytes, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(deadline > Instant::now());
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(UpstreamError::Connection("reset by peer".into()));
        }
        Ok(Bytes::from(key.to_string()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_fetcher_recovers_within_retry_budget() {
    let source = Arc::new(Flaky {
        failures_left: AtomicU32::new(2),
        calls: AtomicU32::new(0),
    });
    let events = Arc::new(Events::default());
    let config = Config {
        breaker: breaker_config(),
        retry: RetryConfig {
            max_attempts: 3,
            jitter: 0.0,
            ..RetryConfig::default()
        },
        ..Config::default()
    };
    let fetcher = ResilientFetcher::new(source.clone(), &config, events.clone());

    assert_eq!(&fetcher.load("doc").await.unwrap()[..], b"doc");
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    assert_eq!(fetcher.breaker().snapshot().failures, 0);

    let retries = events
        .0
        .lock()
        .iter()
        .filter(|e| matches!(e, MetricEvent::RetryAttempt { .. }))
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_fetcher_surfaces_each_failure_kind() {
    let source = Arc::new(Flaky {
        failures_left: AtomicU32::new(u32::MAX),
        calls: AtomicU32::new(0),
    });
    let config = Config {
        breaker: BreakerConfig {
            window_size: 2,
            minimum_calls: 1,
            ..breaker_config()
        },
        retry: RetryConfig {
            max_attempts: 2,
            jitter: 0.0,
            ..RetryConfig::default()
        },
        rate_limit: RateLimitConfig {
            capacity: 2,
            refill_per_sec: 0.01,
            blocking: false,
            acquire_timeout_ms: 0,
        },
        ..Config::default()
    };
    let fetcher = ResilientFetcher::new(source, &config, noop());

    assert!(matches!(fetcher.load("a").await, Err(FetchError::RetriesExhausted { attempts: 2, .. })));
    assert!(matches!(fetcher.load("a").await, Err(FetchError::CircuitOpen(_))));
    assert!(matches!(fetcher.load("a").await, Err(FetchError::RateLimited(_))));
}
