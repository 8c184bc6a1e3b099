//! Cache coordinator: orchestrates reads and writes across the tiers.
//!
//! The coordinator is the only component that moves entries between tiers:
//! - Reads probe L1, then L2, then L3, promoting hits into the faster tiers
//! - A full miss runs exactly one load per key, shared by every concurrent caller
//! - Loads and puts write L1 synchronously and L2/L3 through the [`WriteQueue`]
//! - L1 capacity evictions are demoted to L2 while L2 has room

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::distributed::TimeoutTier;
use crate::cache::entry::{CacheEntry, Tier};
use crate::cache::lru::LruTier;
use crate::cache::tier::CacheTier;
use crate::cache::write_queue::{WriteOp, WriteQueue, WriteQueueStats, WriteTargets};
use crate::clock::{system_clock, SharedClock};
use crate::config::{Config, ConfigError};
use crate::metrics::{noop, MetricEvent, SharedMetrics};
use crate::resilience::circuit_breaker::BreakerSnapshot;
use crate::resilience::{FetchError, ResilientFetcher};

/// Errors surfaced to cache callers. Tier failures never appear here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("ttl must be greater than zero")]
    InvalidTtl,

    #[error("deadline exceeded waiting for {key}")]
    DeadlineExceeded { key: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("no upstream fetcher configured")]
    NoFetcher,

    #[error("load task failed: {0}")]
    LoadFailed(String),
}

type SharedLoad = Shared<BoxFuture<'static, Result<CacheEntry, CacheError>>>;

/// Per-tier read counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

impl TierStats {
    /// Hits as a fraction of probes (0.0 - 1.0).
    pub fn hit_ratio(&self) -> f64 {
        let probes = self.hits + self.misses + self.errors;
        if probes == 0 {
            return 0.0;
        }
        self.hits as f64 / probes as f64
    }
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub l1: TierStats,
    pub l2: Option<TierStats>,
    pub l3: Option<TierStats>,
    pub l1_entries: usize,
    pub l1_bytes: usize,
    pub l1_evictions: u64,
    pub loads_started: u64,
    pub loads_coalesced: u64,
    pub load_failures: u64,
    pub demotions: u64,
    pub inflight_loads: usize,
    pub write_queue: WriteQueueStats,
    pub breaker: Option<BreakerSnapshot>,
}

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl TierCounters {
    fn snapshot(&self) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    l1: TierCounters,
    l2: TierCounters,
    l3: TierCounters,
    loads: AtomicU64,
    coalesced: AtomicU64,
    load_failures: AtomicU64,
    demotions: AtomicU64,
}

impl Counters {
    fn tier(&self, tier: Tier) -> &TierCounters {
        match tier {
            Tier::Memory => &self.l1,
            Tier::Disk => &self.l2,
            Tier::Remote | Tier::Upstream => &self.l3,
        }
    }
}

struct Inner {
    l1: LruTier,
    l2: Option<Arc<dyn CacheTier>>,
    l3: Option<Arc<dyn CacheTier>>,
    fetcher: Option<Arc<ResilientFetcher>>,
    inflight: Mutex<HashMap<String, SharedLoad>>,
    writes: WriteQueue,
    counters: Counters,
    clock: SharedClock,
    metrics: SharedMetrics,
    default_ttl: Duration,
    max_ttl: Duration,
    max_key_len: usize,
}

/// Removes the in-flight record when the load task finishes, panics included.
struct InflightGuard<'a> {
    inflight: &'a Mutex<HashMap<String, SharedLoad>>,
    key: &'a str,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.lock().remove(self.key);
    }
}

enum Join {
    Ready(CacheEntry),
    Waiting(SharedLoad),
}

impl Inner {
    fn hit(&self, tier: Tier) {
        self.counters.tier(tier).hits.fetch_add(1, Ordering::Relaxed);
        self.metrics.record(MetricEvent::TierHit(tier));
    }

    fn miss(&self, tier: Tier) {
        self.counters.tier(tier).misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.record(MetricEvent::TierMiss(tier));
    }

    /// Probe a slower tier. Errors degrade to a miss.
    async fn probe(&self, slot: Tier, tier: &Arc<dyn CacheTier>, key: &str) -> Option<CacheEntry> {
        match tier.get(key).await {
            Ok(Some(entry)) if !entry.is_expired(self.clock.now_millis()) => {
                self.hit(slot);
                Some(entry.with_origin(slot))
            }
            Ok(_) => {
                self.miss(slot);
                None
            }
            Err(e) => {
                self.counters.tier(slot).errors.fetch_add(1, Ordering::Relaxed);
                self.metrics.record(MetricEvent::TierError(slot));
                warn!(tier = %slot, key = %key, error = %e, "Tier read failed, treating as miss");
                None
            }
        }
    }

    async fn read_tiers(&self, key: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.l1.lookup(key) {
            self.hit(Tier::Memory);
            return Some(entry);
        }
        self.miss(Tier::Memory);

        // L2/L3 may still hold the value until the queued delete lands.
        if self.writes.delete_pending(key) {
            debug!(key = %key, "Delete pending, skipping slower tiers");
            return None;
        }

        if let Some(l2) = &self.l2 {
            if let Some(entry) = self.probe(Tier::Disk, l2, key).await {
                debug!(key = %key, "Promoting L2 hit into L1");
                self.store_l1(entry.clone());
                return Some(entry);
            }
        }

        if let Some(l3) = &self.l3 {
            if let Some(entry) = self.probe(Tier::Remote, l3, key).await {
                debug!(key = %key, "Promoting L3 hit into L1 and L2");
                if self.store_l1(entry.clone()) {
                    self.schedule_put(Tier::Disk, entry.clone());
                }
                return Some(entry);
            }
        }

        None
    }

    /// Insert into L1 and cascade whatever it evicts. Returns false when the
    /// entry itself did not fit and was demoted instead.
    fn store_l1(&self, entry: CacheEntry) -> bool {
        let key = entry.key.clone();
        let evicted = self.l1.insert(entry);
        if evicted.is_empty() {
            return true;
        }
        let kept = !evicted.iter().any(|e| e.key == key);
        self.metrics.record(MetricEvent::Evicted {
            count: evicted.len() as u64,
        });
        for entry in evicted {
            self.demote(entry);
        }
        kept
    }

    fn demote(&self, entry: CacheEntry) {
        let Some(l2) = &self.l2 else {
            debug!(key = %entry.key, "L1 eviction with no L2 configured");
            return;
        };
        if entry.is_expired(self.clock.now_millis()) {
            return;
        }
        if !l2.has_capacity_for(entry.size_bytes()) {
            warn!(key = %entry.key, size = entry.size_bytes(), "L2 has no room for demoted entry");
            return;
        }
        if self.writes.schedule(WriteOp::Put { tier: Tier::Disk, entry }) {
            self.counters.demotions.fetch_add(1, Ordering::Relaxed);
            self.metrics.record(MetricEvent::Demoted);
        }
    }

    fn configured(&self, tier: Tier) -> bool {
        match tier {
            Tier::Disk => self.l2.is_some(),
            Tier::Remote => self.l3.is_some(),
            Tier::Memory | Tier::Upstream => false,
        }
    }

    fn schedule_put(&self, tier: Tier, entry: CacheEntry) {
        if self.configured(tier) {
            self.writes.schedule(WriteOp::Put { tier, entry });
        }
    }

    fn schedule_delete(&self, tier: Tier, key: &str) {
        if self.configured(tier) {
            self.writes.schedule(WriteOp::Delete {
                tier,
                key: key.to_string(),
            });
        }
    }

    /// L1 now, L2 and L3 in the background.
    fn write_through(&self, entry: CacheEntry) {
        if self.store_l1(entry.clone()) {
            self.schedule_put(Tier::Disk, entry.clone());
        }
        self.schedule_put(Tier::Remote, entry);
    }

    async fn run_load<F, Fut>(self: Arc<Self>, key: String, loader: F) -> Result<CacheEntry, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, FetchError>>,
    {
        let _guard = InflightGuard {
            inflight: &self.inflight,
            key: &key,
        };

        match loader().await {
            Ok(value) => {
                let entry = CacheEntry::new(key.as_str(), value, self.clock.now_millis(), self.default_ttl, Tier::Upstream);
                debug!(key = %key, size = entry.size_bytes(), "Load complete");
                self.write_through(entry.clone());
                Ok(entry)
            }
            Err(e) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Load failed");
                Err(CacheError::Fetch(e))
            }
        }
    }

    fn join_or_start<F, Fut>(self: &Arc<Self>, key: &str, loader: F) -> Join
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes, FetchError>> + Send + 'static,
    {
        let mut inflight = self.inflight.lock();
        if let Some(load) = inflight.get(key) {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            self.metrics.record(MetricEvent::LoadCoalesced);
            debug!(key = %key, "Joining in-flight load");
            return Join::Waiting(load.clone());
        }

        // A load that finished between our tier probe and taking the lock
        // has already populated L1.
        if let Some(entry) = self.l1.lookup(key) {
            return Join::Ready(entry);
        }

        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        self.metrics.record(MetricEvent::LoadStarted);
        debug!(key = %key, "Starting load");

        // The guard in run_load takes this lock, so the task cannot remove
        // the record before it is inserted below.
        let task = tokio::spawn(self.clone().run_load(key.to_string(), loader));
        let load = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(CacheError::LoadFailed(e.to_string())),
            }
        }
        .boxed()
        .shared();
        inflight.insert(key.to_string(), load.clone());
        Join::Waiting(load)
    }
}

/// Tiered read-through cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<Inner>,
}

impl CacheCoordinator {
    pub fn builder(config: Config) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            l2: None,
            l3: None,
            fetcher: None,
            metrics: noop(),
            clock: system_clock(),
        }
    }

    fn validate_key(&self, key: &str) -> Result<(), CacheError> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey("key is empty".to_string()));
        }
        if key.len() > self.inner.max_key_len {
            return Err(CacheError::InvalidKey(format!(
                "key is {} bytes, limit is {}",
                key.len(),
                self.inner.max_key_len
            )));
        }
        Ok(())
    }

    /// Read `key`, running `loader` on a full miss.
    ///
    /// Concurrent callers for the same key share one `loader` invocation and
    /// its outcome; only the caller that starts the load has its loader run.
    pub async fn get<F, Fut>(&self, key: &str, loader: F) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes, FetchError>> + Send + 'static,
    {
        self.get_entry(key, loader, None).await.map(|e| e.value)
    }

    /// Like [`get`](Self::get), but stop waiting at `deadline`.
    ///
    /// Only this caller gives up; a load it started keeps running and still
    /// populates the cache.
    pub async fn get_with_deadline<F, Fut>(&self, key: &str, loader: F, deadline: Instant) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes, FetchError>> + Send + 'static,
    {
        self.get_entry(key, loader, Some(deadline)).await.map(|e| e.value)
    }

    /// Read `key` and report which tier served it.
    ///
    /// The returned entry's `origin_tier` is the tier that answered, or
    /// [`Tier::Upstream`] when the value came from a load.
    pub async fn get_entry<F, Fut>(&self, key: &str, loader: F, deadline: Option<Instant>) -> Result<CacheEntry, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes, FetchError>> + Send + 'static,
    {
        self.validate_key(key)?;
        let lookup = async {
            if let Some(entry) = self.inner.read_tiers(key).await {
                return Ok(entry);
            }
            match self.inner.join_or_start(key, loader) {
                Join::Ready(entry) => Ok(entry),
                Join::Waiting(load) => load.await,
            }
        };

        match deadline {
            None => lookup.await,
            Some(deadline) => tokio::time::timeout_at(deadline, lookup)
                .await
                .unwrap_or_else(|_| Err(CacheError::DeadlineExceeded { key: key.to_string() })),
        }
    }

    /// Read `key`, loading misses through the configured [`ResilientFetcher`].
    pub async fn get_or_fetch(&self, key: &str) -> Result<Bytes, CacheError> {
        self.get_or_fetch_entry(key, None).await.map(|e| e.value)
    }

    pub async fn get_or_fetch_with_deadline(&self, key: &str, deadline: Instant) -> Result<Bytes, CacheError> {
        self.get_or_fetch_entry(key, Some(deadline)).await.map(|e| e.value)
    }

    pub async fn get_or_fetch_entry(&self, key: &str, deadline: Option<Instant>) -> Result<CacheEntry, CacheError> {
        let fetcher = self.inner.fetcher.clone().ok_or(CacheError::NoFetcher)?;
        let owned = key.to_string();
        self.get_entry(key, move || async move { fetcher.load(&owned).await }, deadline)
            .await
    }

    /// Store `value` under `key` for `ttl`, clamped to the configured maximum.
    pub async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.validate_key(key)?;
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl);
        }
        let ttl = ttl.min(self.inner.max_ttl);
        let entry = CacheEntry::new(key, value, self.inner.clock.now_millis(), ttl, Tier::Memory);
        debug!(key = %key, size = entry.size_bytes(), ttl_ms = ttl.as_millis() as u64, "Put");
        self.inner.write_through(entry);
        Ok(())
    }

    /// Remove `key` from L1 now and from L2/L3 in the background.
    ///
    /// Reads that start after this call do not consult L2/L3 for `key` until
    /// the queued deletes are applied. A load for `key` already in flight is
    /// not cancelled and will repopulate the cache when it completes.
    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.validate_key(key)?;
        self.inner.l1.remove(key);
        self.inner.schedule_delete(Tier::Disk, key);
        self.inner.schedule_delete(Tier::Remote, key);
        debug!(key = %key, "Invalidated");
        Ok(())
    }

    /// Wait for every background write scheduled so far to be applied.
    pub async fn flush(&self) {
        self.inner.writes.flush().await;
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    pub fn fetcher(&self) -> Option<&Arc<ResilientFetcher>> {
        self.inner.fetcher.as_ref()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        let c = &inner.counters;
        CacheStats {
            l1: c.l1.snapshot(),
            l2: inner.l2.as_ref().map(|_| c.l2.snapshot()),
            l3: inner.l3.as_ref().map(|_| c.l3.snapshot()),
            l1_entries: inner.l1.len(),
            l1_bytes: inner.l1.bytes_used(),
            l1_evictions: inner.l1.eviction_count(),
            loads_started: c.loads.load(Ordering::Relaxed),
            loads_coalesced: c.coalesced.load(Ordering::Relaxed),
            load_failures: c.load_failures.load(Ordering::Relaxed),
            demotions: c.demotions.load(Ordering::Relaxed),
            inflight_loads: inner.inflight.lock().len(),
            write_queue: inner.writes.stats(),
            breaker: inner.fetcher.as_ref().map(|f| f.breaker().snapshot()),
        }
    }
}

/// Assembles a [`CacheCoordinator`] from a validated [`Config`] and the
/// tiers the caller has opened.
pub struct CoordinatorBuilder {
    config: Config,
    l2: Option<Arc<dyn CacheTier>>,
    l3: Option<Arc<dyn CacheTier>>,
    fetcher: Option<Arc<ResilientFetcher>>,
    metrics: SharedMetrics,
    clock: SharedClock,
}

impl CoordinatorBuilder {
    pub fn disk(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.l2 = Some(tier);
        self
    }

    /// Operations on this tier are bounded by `remote.op_timeout_ms`.
    pub fn remote(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.l3 = Some(tier);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<ResilientFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Build the coordinator and start its write worker. Must be called
    /// from within a tokio runtime.
    pub fn build(self) -> Result<CacheCoordinator, ConfigError> {
        let config = self.config;
        config.validate()?;

        let op_timeout = Duration::from_millis(config.remote.op_timeout_ms);
        let l3 = self
            .l3
            .map(|tier| Arc::new(TimeoutTier::new(tier, op_timeout)) as Arc<dyn CacheTier>);
        let targets = WriteTargets {
            disk: self.l2.clone(),
            remote: l3.clone(),
        };
        let (writes, _worker) =
            WriteQueue::spawn(config.coordinator.write_queue_capacity, targets, self.metrics.clone());

        let l1 = LruTier::new(config.memory.capacity, config.memory.shards, self.clock.clone());
        debug!(
            shards = l1.shard_count(),
            l2 = self.l2.is_some(),
            l3 = l3.is_some(),
            fetcher = self.fetcher.is_some(),
            "Cache coordinator built"
        );

        Ok(CacheCoordinator {
            inner: Arc::new(Inner {
                l1,
                l2: self.l2,
                l3,
                fetcher: self.fetcher,
                inflight: Mutex::new(HashMap::new()),
                writes,
                counters: Counters::default(),
                clock: self.clock,
                metrics: self.metrics,
                default_ttl: config.ttl.default_ttl(),
                max_ttl: config.ttl.max_ttl(),
                max_key_len: config.coordinator.max_key_len,
            }),
        })
    }
}
