//! L3: distributed tier.
//!
//! The coordinator only sees the [`CacheTier`] contract here; the storage is
//! owned by something outside this process. [`SharedMemoryStore`] implements
//! that contract over a map that several coordinators can share, which is how
//! cross-process coherency is exercised in tests and single-host deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::cache::entry::{CacheEntry, Tier};
use crate::cache::tier::{CacheTier, TierError};
use crate::clock::SharedClock;

#[derive(Debug, Default)]
struct Store {
    entries: RwLock<HashMap<String, CacheEntry>>,
    bytes: AtomicU64,
}

/// A remote store stand-in shared by cloning.
#[derive(Debug, Clone)]
pub struct SharedMemoryStore {
    store: Arc<Store>,
    available: Arc<AtomicBool>,
    max_bytes: u64,
    clock: SharedClock,
}

impl SharedMemoryStore {
    pub fn new(max_bytes: u64, clock: SharedClock) -> Self {
        Self {
            store: Arc::new(Store::default()),
            available: Arc::new(AtomicBool::new(true)),
            max_bytes,
            clock,
        }
    }

    /// Simulate the remote going down (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.store.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), TierError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TierError::unavailable(Tier::Remote, "remote store unreachable"))
        }
    }
}

#[async_trait]
impl CacheTier for SharedMemoryStore {
    fn kind(&self) -> Tier {
        Tier::Remote
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        self.check()?;
        let now = self.clock.now_millis();
        let found = self.store.entries.read().get(key).cloned();
        match found {
            Some(entry) if entry.is_expired(now) => {
                let mut entries = self.store.entries.write();
                if entries.get(key).is_some_and(|e| e.is_expired(now)) {
                    if let Some(old) = entries.remove(key) {
                        self.store.bytes.fetch_sub(old.size_bytes() as u64, Ordering::Relaxed);
                    }
                }
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.with_origin(Tier::Remote))),
            None => Ok(None),
        }
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), TierError> {
        self.check()?;
        let size = entry.size_bytes() as u64;
        let mut entries = self.store.entries.write();
        let replaced = entries.get(&entry.key).map_or(0, |e| e.size_bytes() as u64);
        let used = self.store.bytes.load(Ordering::Relaxed) - replaced;
        if used + size > self.max_bytes {
            return Err(TierError::TooLarge {
                tier: Tier::Remote,
                size: size as usize,
            });
        }
        entries.insert(entry.key.clone(), entry);
        self.store.bytes.store(used + size, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        self.check()?;
        if let Some(old) = self.store.entries.write().remove(key) {
            self.store.bytes.fetch_sub(old.size_bytes() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    fn has_capacity_for(&self, bytes: usize) -> bool {
        self.store.bytes.load(Ordering::Relaxed) + bytes as u64 <= self.max_bytes
    }
}

/// Bounds every operation of a remote tier by a timeout.
///
/// A timed out operation is reported as [`TierError::Unavailable`] and
/// degrades like any other remote failure.
pub struct TimeoutTier {
    inner: Arc<dyn CacheTier>,
    timeout: Duration,
}

impl TimeoutTier {
    pub fn new(inner: Arc<dyn CacheTier>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        op: impl std::future::Future<Output = Result<T, TierError>>,
    ) -> Result<T, TierError> {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(TierError::unavailable(
                self.inner.kind(),
                format!("operation timed out after {:?}", self.timeout),
            )),
        }
    }
}

#[async_trait]
impl CacheTier for TimeoutTier {
    fn kind(&self) -> Tier {
        self.inner.kind()
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        self.bounded(self.inner.get(key)).await
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), TierError> {
        self.bounded(self.inner.put(entry)).await
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        self.bounded(self.inner.delete(key)).await
    }

    fn has_capacity_for(&self, bytes: usize) -> bool {
        self.inner.has_capacity_for(bytes)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (SharedMemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (SharedMemoryStore::new(1024, clock.clone()), clock)
    }

    fn entry(key: &str, ttl_ms: u64) -> CacheEntry {
        CacheEntry::new(key, Bytes::from_static(b"payload"), 0, Duration::from_millis(ttl_ms), Tier::Upstream)
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let (a, _) = store();
        let b = a.clone();
        a.put(entry("k", 1_000)).await.unwrap();
        let got = b.get("k").await.unwrap().unwrap();
        assert_eq!(got.origin_tier, Tier::Remote);
        b.delete("k").await.unwrap();
        assert!(a.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let (s, _) = store();
        s.set_available(false);
        assert!(matches!(s.get("k").await, Err(TierError::Unavailable { tier: Tier::Remote, .. })));
        assert!(s.put(entry("k", 1_000)).await.is_err());
        s.set_available(true);
        assert!(s.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_purged() {
        let (s, clock) = store();
        s.put(entry("k", 10)).await.unwrap();
        clock.advance(Duration::from_millis(11));
        assert!(s.get("k").await.unwrap().is_none());
        assert!(s.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let clock = Arc::new(ManualClock::new(0));
        let s = SharedMemoryStore::new(10, clock);
        // "k" + "payload" = 8 bytes.
        s.put(entry("k", 1_000)).await.unwrap();
        s.put(entry("k", 1_000)).await.unwrap();
        assert!(s.put(entry("j", 1_000)).await.is_err());
        assert!(!s.has_capacity_for(3));
    }

    struct Stalled;

    #[async_trait]
    impl CacheTier for Stalled {
        fn kind(&self) -> Tier {
            Tier::Remote
        }

        async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, TierError> {
            std::future::pending().await
        }

        async fn put(&self, _entry: CacheEntry) -> Result<(), TierError> {
            std::future::pending().await
        }

        async fn delete(&self, _key: &str) -> Result<(), TierError> {
            std::future::pending().await
        }

        fn has_capacity_for(&self, _bytes: usize) -> bool {
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_tier_reports_unavailable() {
        let tier = TimeoutTier::new(Arc::new(Stalled), Duration::from_millis(250));
        assert!(matches!(tier.get("k").await, Err(TierError::Unavailable { tier: Tier::Remote, .. })));
        assert!(tier.put(entry("k", 1_000)).await.is_err());
        assert!(tier.delete("k").await.is_err());
    }

    #[tokio::test]
    async fn test_timeout_tier_passes_through() {
        let (s, _) = store();
        let tier = TimeoutTier::new(Arc::new(s.clone()), Duration::from_secs(1));
        tier.put(entry("k", 1_000)).await.unwrap();
        assert_eq!(s.len(), 1);
        assert!(tier.get("k").await.unwrap().is_some());
    }
}
