//! L1: sharded in-process LRU.
//!
//! Each shard owns a key→slot map and a recency-ordered doubly linked list
//! threaded through a slab of nodes, so get/put/delete are O(1). Shards are
//! locked independently; a key always hashes to the same shard.
//!
//! The tier never decides where evicted entries go. `insert` hands them back
//! to the caller, and the coordinator demotes them.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::entry::{CacheEntry, Tier};
use crate::cache::tier::{CacheTier, TierError};
use crate::clock::{SharedClock, UnixMillis};

/// How the L1 bound is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LruCapacity {
    /// At most this many entries.
    Entries(usize),
    /// At most this many key + value bytes.
    Bytes(usize),
}

impl LruCapacity {
    fn units(&self) -> usize {
        match self {
            LruCapacity::Entries(n) | LruCapacity::Bytes(n) => *n,
        }
    }

    fn cost(&self, entry: &CacheEntry) -> usize {
        match self {
            LruCapacity::Entries(_) => 1,
            LruCapacity::Bytes(_) => entry.size_bytes(),
        }
    }
}

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node {
    entry: Option<CacheEntry>,
    prev: usize,
    next: usize,
}

#[derive(Debug)]
struct Shard {
    map: HashMap<String, usize>,
    nodes: Vec<Node>,
    free: Vec<usize>,
    /// Most recently used.
    head: usize,
    /// Least recently used.
    tail: usize,
    used: usize,
    bytes: usize,
    capacity: usize,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            used: 0,
            bytes: 0,
            capacity,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn alloc(&mut self, entry: CacheEntry) -> usize {
        let node = Node {
            entry: Some(entry),
            prev: NIL,
            next: NIL,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize, unit: &LruCapacity) -> Option<CacheEntry> {
        self.unlink(idx);
        let entry = self.nodes[idx].entry.take()?;
        self.free.push(idx);
        self.map.remove(&entry.key);
        self.used = self.used.saturating_sub(unit.cost(&entry));
        self.bytes = self.bytes.saturating_sub(entry.size_bytes());
        Some(entry)
    }

    fn get(&mut self, key: &str, now: UnixMillis, unit: &LruCapacity) -> Option<CacheEntry> {
        let idx = *self.map.get(key)?;
        let expired = self.nodes[idx].entry.as_ref().map_or(true, |e| e.is_expired(now));
        if expired {
            self.release(idx, unit);
            return None;
        }
        self.unlink(idx);
        self.push_front(idx);
        self.nodes[idx].entry.clone()
    }

    fn insert(&mut self, entry: CacheEntry, now: UnixMillis, unit: &LruCapacity) -> Vec<CacheEntry> {
        let mut evicted = Vec::new();

        // A new value supersedes the old one; the old one is not an eviction.
        if let Some(&idx) = self.map.get(&entry.key) {
            self.release(idx, unit);
        }

        let cost = unit.cost(&entry);
        if cost > self.capacity {
            evicted.push(entry);
            return evicted;
        }

        while self.used + cost > self.capacity && self.tail != NIL {
            if let Some(old) = self.release(self.tail, unit) {
                if !old.is_expired(now) {
                    evicted.push(old);
                }
            }
        }

        self.used += cost;
        self.bytes += entry.size_bytes();
        let key = entry.key.clone();
        let idx = self.alloc(entry);
        self.map.insert(key, idx);
        self.push_front(idx);
        evicted
    }
}

/// Sharded LRU tier.
#[derive(Debug)]
pub struct LruTier {
    shards: Vec<Mutex<Shard>>,
    unit: LruCapacity,
    clock: SharedClock,
    evictions: AtomicU64,
}

impl LruTier {
    /// Create an LRU with `capacity` split across `shard_count` shards.
    ///
    /// Capacity is divided evenly with the remainder going to the first
    /// shards; callers validate that `shard_count <= capacity`.
    pub fn new(capacity: LruCapacity, shard_count: usize, clock: SharedClock) -> Self {
        let shard_count = shard_count.max(1);
        let total = capacity.units();
        let base = total / shard_count;
        let remainder = total % shard_count;
        let shards = (0..shard_count)
            .map(|i| Mutex::new(Shard::new(base + usize::from(i < remainder))))
            .collect();

        Self {
            shards,
            unit: capacity,
            clock,
            evictions: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Look up a live entry, marking it most recently used.
    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now_millis();
        self.shard(key)
            .lock()
            .get(key, now, &self.unit)
            .map(|e| e.with_origin(Tier::Memory))
    }

    /// Insert an entry, returning the live entries evicted to make room.
    ///
    /// An entry too large for its shard is not stored and comes back as the
    /// sole eviction.
    pub fn insert(&self, entry: CacheEntry) -> Vec<CacheEntry> {
        let now = self.clock.now_millis();
        let evicted = self.shard(&entry.key).lock().insert(entry, now, &self.unit);
        if !evicted.is_empty() {
            self.evictions.fetch_add(evicted.len() as u64, Ordering::Relaxed);
            debug!(count = evicted.len(), "L1 evicted entries");
        }
        evicted
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        let mut shard = self.shard(key).lock();
        let idx = *shard.map.get(key)?;
        shard.release(idx, &self.unit)
    }

    /// Whether the key is present, without touching recency or expiry.
    pub fn contains(&self, key: &str) -> bool {
        self.shard(key).lock().map.contains_key(key)
    }

    /// Number of resident entries (including not-yet-purged expired ones).
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key + value bytes held.
    pub fn bytes_used(&self) -> usize {
        self.shards.iter().map(|s| s.lock().bytes).sum()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Total capacity-pressure evictions since construction.
    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CacheTier for LruTier {
    fn kind(&self) -> Tier {
        Tier::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        Ok(self.lookup(key))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), TierError> {
        let key = entry.key.clone();
        let size = entry.size_bytes();
        let evicted = self.insert(entry);
        if evicted.iter().any(|e| e.key == key) {
            return Err(TierError::TooLarge {
                tier: Tier::Memory,
                size,
            });
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        self.remove(key);
        Ok(())
    }

    fn has_capacity_for(&self, bytes: usize) -> bool {
        let smallest = self.shards.iter().map(|s| s.lock().capacity).min().unwrap_or(0);
        match self.unit {
            LruCapacity::Entries(_) => smallest >= 1,
            LruCapacity::Bytes(_) => bytes <= smallest,
        }
    }
}
