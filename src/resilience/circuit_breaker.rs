//! Per-source circuit breaker.
//!
//! ```text
//!            failure ratio >= threshold
//!   Closed ──────────────────────────────▶ Open
//!     ▲                                     │ cooldown elapsed
//!     │ all probes succeed                  ▼
//!     └──────────────────────────────── HalfOpen ──▶ Open (any probe fails,
//!                                                         cooldown extended)
//! ```
//!
//! Admission hands out a [`BreakerPermit`]. Recording an outcome consumes
//! it; dropping it unrecorded counts as a cancellation, which is neither a
//! success nor a failure.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::clock::instant_after;
use crate::config::BreakerConfig;
use crate::metrics::{MetricEvent, SharedMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn gauge_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit open for source {source_id}, retry in {retry_after:?}")]
pub struct CircuitOpenError {
    pub source_id: String,
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// `true` = failure, newest at the back.
    window: VecDeque<bool>,
    failures: usize,
    open_until: Instant,
    cooldown: Duration,
    probes_in_flight: usize,
    probe_successes: usize,
}

type Transition = (CircuitState, CircuitState);

impl BreakerState {
    fn reset_window(&mut self) {
        self.window.clear();
        self.failures = 0;
    }

    fn push(&mut self, failed: bool, window_size: usize) {
        self.window.push_back(failed);
        self.failures += usize::from(failed);
        while self.window.len() > window_size {
            if self.window.pop_front() == Some(true) {
                self.failures -= 1;
            }
        }
    }

    fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.failures as f64 / self.window.len() as f64
    }
}

/// Snapshot for stats endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub recorded_calls: usize,
    pub failures: usize,
    pub failure_ratio: f64,
}

pub struct CircuitBreaker {
    source_id: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    metrics: SharedMetrics,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("source_id", &self.source_id)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(source_id: impl Into<String>, config: BreakerConfig, metrics: SharedMetrics) -> Self {
        let cooldown = config.cooldown();
        Self {
            source_id: source_id.into(),
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(config.window_size),
                failures: 0,
                open_until: Instant::now(),
                cooldown,
                probes_in_flight: 0,
                probe_successes: 0,
            }),
            config,
            metrics,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Current state as last recorded. An Open breaker whose cooldown has
    /// elapsed reports Open until the next admission attempt moves it on.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let s = self.state.lock();
        BreakerSnapshot {
            state: s.state,
            recorded_calls: s.window.len(),
            failures: s.failures,
            failure_ratio: s.failure_ratio(),
        }
    }

    /// Ask to send one request upstream.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, CircuitOpenError> {
        let now = Instant::now();
        let mut transition = None;
        let result = {
            let mut s = self.state.lock();
            if s.state == CircuitState::Open && now >= s.open_until {
                s.state = CircuitState::HalfOpen;
                s.probes_in_flight = 0;
                s.probe_successes = 0;
                transition = Some((CircuitState::Open, CircuitState::HalfOpen));
            }

            match s.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => Err(s.open_until.saturating_duration_since(now)),
                CircuitState::HalfOpen => {
                    if s.probes_in_flight + s.probe_successes < self.config.half_open_probes {
                        s.probes_in_flight += 1;
                        Ok(true)
                    } else {
                        Err(Duration::ZERO)
                    }
                }
            }
        };
        self.announce(transition);

        match result {
            Ok(probe) => Ok(BreakerPermit {
                breaker: self,
                probe,
                settled: false,
            }),
            Err(retry_after) => Err(CircuitOpenError {
                source_id: self.source_id.clone(),
                retry_after,
            }),
        }
    }

    fn record(&self, probe: bool, outcome: Outcome) {
        let now = Instant::now();
        let transition = {
            let mut s = self.state.lock();
            match (s.state, probe) {
                (CircuitState::Closed, false) => {
                    s.push(outcome == Outcome::Failure, self.config.window_size);
                    let tripped = s.window.len() >= self.config.minimum_calls
                        && s.failure_ratio() >= self.config.failure_ratio;
                    if tripped {
                        self.open(&mut s, now, false)
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, true) => {
                    s.probes_in_flight = s.probes_in_flight.saturating_sub(1);
                    match outcome {
                        Outcome::Failure => self.open(&mut s, now, true),
                        Outcome::Success => {
                            s.probe_successes += 1;
                            if s.probe_successes >= self.config.half_open_probes {
                                s.state = CircuitState::Closed;
                                s.cooldown = self.config.cooldown();
                                s.reset_window();
                                Some((CircuitState::HalfOpen, CircuitState::Closed))
                            } else {
                                None
                            }
                        }
                    }
                }
                // Outcome of a request admitted under an earlier state.
                _ => None,
            }
        };
        self.announce(transition);
    }

    fn cancel(&self, probe: bool) {
        if !probe {
            return;
        }
        let mut s = self.state.lock();
        if s.state == CircuitState::HalfOpen {
            s.probes_in_flight = s.probes_in_flight.saturating_sub(1);
        }
    }

    fn open(&self, s: &mut BreakerState, now: Instant, from_probe: bool) -> Option<Transition> {
        let from = s.state;
        if from_probe {
            let max = self.config.max_cooldown();
            let extended = s.cooldown.as_secs_f64() * self.config.cooldown_multiplier;
            s.cooldown = Duration::try_from_secs_f64(extended).map_or(max, |d| d.min(max));
        } else {
            s.cooldown = self.config.cooldown();
        }
        s.state = CircuitState::Open;
        s.open_until = instant_after(now, s.cooldown);
        s.probes_in_flight = 0;
        s.probe_successes = 0;
        s.reset_window();
        Some((from, CircuitState::Open))
    }

    fn announce(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };
        if to == CircuitState::Open {
            warn!(source = %self.source_id, %from, %to, "Circuit breaker opened");
        } else {
            info!(source = %self.source_id, %from, %to, "Circuit breaker transition");
        }
        self.metrics.record(MetricEvent::BreakerTransition {
            source: self.source_id.clone(),
            from,
            to,
        });
    }
}

/// Admission to send one request. Record exactly one outcome, or drop it to
/// signal cancellation.
#[must_use = "record an outcome with success() or failure()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this request is a HalfOpen probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record(self.probe, Outcome::Success);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record(self.probe, Outcome::Failure);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.cancel(self.probe);
        }
    }
}
