//! Uniform contract shared by every cache tier.

use async_trait::async_trait;
use thiserror::Error;

use crate::cache::entry::{CacheEntry, Tier};

#[derive(Error, Debug, Clone)]
pub enum TierError {
    /// The tier could not serve the operation (I/O failure, remote down, timeout).
    #[error("{tier} unavailable: {reason}")]
    Unavailable { tier: Tier, reason: String },

    /// The entry can never be stored in this tier.
    #[error("entry of {size} bytes exceeds {tier} capacity")]
    TooLarge { tier: Tier, size: usize },
}

impl TierError {
    pub fn unavailable(tier: Tier, reason: impl std::fmt::Display) -> Self {
        TierError::Unavailable {
            tier,
            reason: reason.to_string(),
        }
    }
}

/// A single layer of the cache hierarchy.
///
/// `get` must never return an entry whose `expires_at` has passed; expired
/// entries are treated as absent and may be purged lazily.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Which tier this is.
    fn kind(&self) -> Tier;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError>;

    async fn put(&self, entry: CacheEntry) -> Result<(), TierError>;

    async fn delete(&self, key: &str) -> Result<(), TierError>;

    /// Whether an entry of `bytes` could be stored without exceeding capacity.
    ///
    /// Used by the eviction cascade to decide whether a demotion is worth
    /// enqueueing. Must not perform I/O.
    fn has_capacity_for(&self, bytes: usize) -> bool;
}
