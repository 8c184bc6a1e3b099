//! Tiered artifact cache.
//!
//! This module contains the tiers and the coordinator that moves entries
//! between them:
//! - [`entry`]: CacheEntry and Tier definitions
//! - [`tier`]: the CacheTier contract every tier implements
//! - [`lru`]: L1 sharded in-process LRU
//! - [`persistent`]: L2 append-only segment files
//! - [`distributed`]: L3 remote tier contract and timeout wrapper
//! - [`compressor`]: zstd compression for L2 values
//! - [`write_queue`]: bounded background writer for L2/L3
//! - [`coordinator`]: read-through orchestration with single-flight loads

pub mod compressor;
pub mod coordinator;
pub mod distributed;
pub mod entry;
pub mod lru;
pub mod persistent;
pub mod tier;
pub mod write_queue;

pub use coordinator::{CacheCoordinator, CacheError, CacheStats, CoordinatorBuilder};
pub use entry::{CacheEntry, Tier};
pub use tier::{CacheTier, TierError};
