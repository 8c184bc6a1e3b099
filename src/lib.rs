//! artifact-cache-tier: tiered cache for extraction pipeline artifacts.
//!
//! Serves artifacts through a hierarchy of storage tiers:
//!   in-process LRU (hot) → local segment files (warm) → shared remote store (cold)
//!
//! Misses are loaded once per key from an upstream [`source::Source`] guarded
//! by a rate limiter, a circuit breaker and bounded retries.

pub mod cache;
pub mod clock;
pub mod config;
pub mod metrics;
pub mod resilience;
pub mod server;
pub mod source;
