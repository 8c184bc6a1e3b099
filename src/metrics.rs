//! Metrics sink.
//!
//! The cache and the resilience layer report what happens through the narrow
//! [`MetricsSink`] trait. Exporter wiring is the embedding application's
//! business; [`PrometheusMetrics`] is the one the bundled server uses.

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::cache::entry::Tier;
use crate::resilience::circuit_breaker::CircuitState;

/// Something observable happened.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    /// A tier served a read.
    TierHit(Tier),
    /// A tier was probed and did not have the key.
    TierMiss(Tier),
    /// A tier operation failed and was degraded.
    TierError(Tier),
    /// A full miss started an upstream load.
    LoadStarted,
    /// A caller attached to an already running load.
    LoadCoalesced,
    /// L1 evicted entries under capacity pressure.
    Evicted { count: u64 },
    /// An L1 eviction was written back to L2.
    Demoted,
    /// A background tier write could not be queued.
    WriteQueueDropped,
    /// A breaker changed state.
    BreakerTransition {
        source: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// A retry attempt was scheduled.
    RetryAttempt { source: String },
    /// The rate limiter denied admission.
    RateLimited { source: String },
}

/// Receiver of cache and resilience events.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

/// Shared sink handle.
pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: MetricEvent) {}
}

pub fn noop() -> SharedMetrics {
    Arc::new(NoopMetrics)
}

/// Prometheus-backed sink.
pub struct PrometheusMetrics {
    registry: Registry,
    tier_hits: IntCounterVec,
    tier_misses: IntCounterVec,
    tier_errors: IntCounterVec,
    loads: IntCounter,
    coalesced: IntCounter,
    evictions: IntCounter,
    demotions: IntCounter,
    dropped_writes: IntCounter,
    breaker_transitions: IntCounterVec,
    breaker_state: IntGaugeVec,
    retries: IntCounterVec,
    rate_limited: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("artifact_cache".to_string()), None)?;

        let tier_hits = IntCounterVec::new(Opts::new("tier_hits_total", "Reads served per tier"), &["tier"])?;
        let tier_misses = IntCounterVec::new(Opts::new("tier_misses_total", "Misses per probed tier"), &["tier"])?;
        let tier_errors = IntCounterVec::new(Opts::new("tier_errors_total", "Degraded tier operations"), &["tier"])?;
        let loads = IntCounter::new("loads_total", "Upstream loads started")?;
        let coalesced = IntCounter::new("loads_coalesced_total", "Callers that joined an in-flight load")?;
        let evictions = IntCounter::new("l1_evictions_total", "L1 capacity evictions")?;
        let demotions = IntCounter::new("demotions_total", "L1 evictions written back to L2")?;
        let dropped_writes = IntCounter::new("write_queue_dropped_total", "Background writes dropped on a full queue")?;
        let breaker_transitions = IntCounterVec::new(
            Opts::new("breaker_transitions_total", "Circuit breaker state transitions"),
            &["source", "to"],
        )?;
        let breaker_state = IntGaugeVec::new(
            Opts::new("breaker_state", "Circuit state per source (0=closed, 1=half_open, 2=open)"),
            &["source"],
        )?;
        let retries = IntCounterVec::new(Opts::new("retries_total", "Retry attempts"), &["source"])?;
        let rate_limited = IntCounterVec::new(Opts::new("rate_limited_total", "Rate limiter rejections"), &["source"])?;

        registry.register(Box::new(tier_hits.clone()))?;
        registry.register(Box::new(tier_misses.clone()))?;
        registry.register(Box::new(tier_errors.clone()))?;
        registry.register(Box::new(loads.clone()))?;
        registry.register(Box::new(coalesced.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(demotions.clone()))?;
        registry.register(Box::new(dropped_writes.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(rate_limited.clone()))?;

        Ok(Self {
            registry,
            tier_hits,
            tier_misses,
            tier_errors,
            loads,
            coalesced,
            evictions,
            demotions,
            dropped_writes,
            breaker_transitions,
            breaker_state,
            retries,
            rate_limited,
        })
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record(&self, event: MetricEvent) {
        match event {
            MetricEvent::TierHit(tier) => self.tier_hits.with_label_values(&[tier.as_str()]).inc(),
            MetricEvent::TierMiss(tier) => self.tier_misses.with_label_values(&[tier.as_str()]).inc(),
            MetricEvent::TierError(tier) => self.tier_errors.with_label_values(&[tier.as_str()]).inc(),
            MetricEvent::LoadStarted => self.loads.inc(),
            MetricEvent::LoadCoalesced => self.coalesced.inc(),
            MetricEvent::Evicted { count } => self.evictions.inc_by(count),
            MetricEvent::Demoted => self.demotions.inc(),
            MetricEvent::WriteQueueDropped => self.dropped_writes.inc(),
            MetricEvent::BreakerTransition { source, to, .. } => {
                self.breaker_transitions.with_label_values(&[source.as_str(), to.as_str()]).inc();
                self.breaker_state.with_label_values(&[source.as_str()]).set(to.gauge_value());
            }
            MetricEvent::RetryAttempt { source } => self.retries.with_label_values(&[source.as_str()]).inc(),
            MetricEvent::RateLimited { source } => self.rate_limited.with_label_values(&[source.as_str()]).inc(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_render_contains_counters() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record(MetricEvent::TierHit(Tier::Memory));
        metrics.record(MetricEvent::TierHit(Tier::Memory));
        metrics.record(MetricEvent::RateLimited { source: "s".into() });
        metrics.record(MetricEvent::BreakerTransition {
            source: "s".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        });

        let text = metrics.render();
        assert!(text.contains("artifact_cache_tier_hits_total{tier=\"l1\"} 2"));
        assert!(text.contains("artifact_cache_rate_limited_total{source=\"s\"} 1"));
        assert!(text.contains("artifact_cache_breaker_state{source=\"s\"} 2"));
    }
}
