//! Cache entry and tier definitions.
//!
//! An entry is the unit of movement between tiers. Values are opaque bytes;
//! the cache never looks inside them.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::clock::UnixMillis;

/// Identifies which storage tier an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// L1: in-process LRU (hot).
    Memory,
    /// L2: local append-only segment files (warm).
    Disk,
    /// L3: distributed store shared across processes (cold).
    Remote,
    /// Freshly fetched from the upstream source.
    Upstream,
}

impl Tier {
    /// Metric label for this tier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Memory => "l1",
            Tier::Disk => "l2",
            Tier::Remote => "l3",
            Tier::Upstream => "upstream",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Memory => write!(f, "L1/memory"),
            Tier::Disk => write!(f, "L2/disk"),
            Tier::Remote => write!(f, "L3/remote"),
            Tier::Upstream => write!(f, "upstream"),
        }
    }
}

/// A cached artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Unique key per logical artifact.
    pub key: String,

    /// Opaque payload.
    pub value: Bytes,

    /// When the entry was first produced.
    pub created_at: UnixMillis,

    /// Absolute expiry; the entry is absent once `now > expires_at`.
    pub expires_at: UnixMillis,

    /// Tier the entry was read from (or `Upstream` if freshly loaded).
    pub origin_tier: Tier,
}

impl CacheEntry {
    /// Create an entry that expires `ttl` after `now`.
    pub fn new(key: impl Into<String>, value: Bytes, now: UnixMillis, ttl: Duration, origin: Tier) -> Self {
        Self {
            key: key.into(),
            value,
            created_at: now,
            expires_at: now.saturating_add(ttl.as_millis() as u64),
            origin_tier: origin,
        }
    }

    /// Payload size plus key size, the unit the byte-bounded tiers account in.
    pub fn size_bytes(&self) -> usize {
        self.key.len() + self.value.len()
    }

    pub fn is_expired(&self, now: UnixMillis) -> bool {
        now > self.expires_at
    }

    /// Same entry, re-labelled with the tier it is now being served from.
    pub fn with_origin(mut self, tier: Tier) -> Self {
        self.origin_tier = tier;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiry_boundary() {
        let entry = CacheEntry::new("k", Bytes::from_static(b"v"), 1_000, Duration::from_millis(500), Tier::Upstream);
        assert_eq!(entry.expires_at, 1_500);
        // Expiry is strict: an entry is still valid at exactly `expires_at`.
        assert!(!entry.is_expired(1_500));
        assert!(entry.is_expired(1_501));
    }

    #[test]
    fn test_size_counts_key_and_value() {
        let entry = CacheEntry::new("abc", Bytes::from(vec![0u8; 10]), 0, Duration::from_secs(1), Tier::Memory);
        assert_eq!(entry.size_bytes(), 13);
    }
}
