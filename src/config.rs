//! Runtime configuration for artifact-cache-tier.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Every knob the cache and the resilience layer read lives here, and
//! [`Config::validate`] rejects combinations that cannot work before anything
//! is built from them.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::lru::LruCapacity;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "artifact-cache-tier", about = "Tiered artifact cache with a resilient upstream fetcher")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration.
    pub server: ServerConfig,

    /// Upstream source configuration.
    pub source: SourceConfig,

    /// L1 in-process tier.
    pub memory: MemoryConfig,

    /// L2 on-disk tier.
    pub disk: DiskConfig,

    /// L3 distributed tier.
    pub remote: RemoteConfig,

    /// TTL defaults.
    pub ttl: TtlConfig,

    /// Coordinator plumbing.
    pub coordinator: CoordinatorConfig,

    /// Circuit breaker thresholds.
    pub breaker: BreakerConfig,

    /// Retry and backoff.
    pub retry: RetryConfig,

    /// Token bucket admission.
    pub rate_limit: RateLimitConfig,

    /// Disk value compression.
    pub compression: CompressionConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Per-request deadline for artifact reads in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

/// Where the binary's directory source reads artifacts from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Identity used for per-source breaker and limiter state.
    pub id: String,

    /// Directory of artifact files.
    pub root: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            id: "artifacts".to_string(),
            root: PathBuf::from("./artifacts"),
        }
    }
}

/// L1 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Capacity in entries or bytes.
    pub capacity: LruCapacity,

    /// Number of independently locked shards.
    pub shards: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: LruCapacity::Bytes(256 * 1024 * 1024), // 256 MB
            shards: 16,
        }
    }
}

/// L2 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Whether L2 is used at all.
    pub enabled: bool,

    /// Segment directory.
    pub path: PathBuf,

    /// Maximum live record bytes.
    pub max_bytes: u64,

    /// Roll the active segment after this many bytes.
    pub max_segment_bytes: u64,

    /// fsync after every append.
    pub sync_writes: bool,

    /// How often the compactor checks the garbage ratio.
    pub compaction_interval_ms: u64,

    /// Compact once dead bytes exceed this fraction of the total.
    pub compaction_garbage_ratio: f64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/tmp/artifact-cache"),
            max_bytes: 4 * 1024 * 1024 * 1024, // 4 GB
            max_segment_bytes: 64 * 1024 * 1024,
            sync_writes: false,
            compaction_interval_ms: 60_000,
            compaction_garbage_ratio: 0.5,
        }
    }
}

/// L3 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Whether L3 is used at all.
    pub enabled: bool,

    /// Capacity of the in-process shared store used when no external store is wired in.
    pub max_bytes: u64,

    /// Upper bound on any single remote operation.
    pub op_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_bytes: 1024 * 1024 * 1024,
            op_timeout_ms: 250,
        }
    }
}

/// TTL defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// TTL applied to freshly fetched artifacts.
    pub default_ttl_ms: u64,

    /// Upper bound on any caller-supplied TTL.
    pub max_ttl_ms: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 60 * 60 * 1000,        // 1 hour
            max_ttl_ms: 7 * 24 * 60 * 60 * 1000, // 1 week
        }
    }
}

impl TtlConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_millis(self.max_ttl_ms)
    }
}

/// Coordinator plumbing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Bounded capacity of the L2/L3 background write queue.
    pub write_queue_capacity: usize,

    /// Longest accepted key in bytes.
    pub max_key_len: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            write_queue_capacity: 1024,
            max_key_len: 1024,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Trip when failures / recorded calls reaches this ratio.
    pub failure_ratio: f64,

    /// Number of most recent outcomes kept.
    pub window_size: usize,

    /// Do not trip before this many outcomes are recorded.
    pub minimum_calls: usize,

    /// Initial Open duration.
    pub cooldown_ms: u64,

    /// Each consecutive failed probe multiplies the cooldown by this.
    pub cooldown_multiplier: f64,

    /// Cooldown ceiling.
    pub max_cooldown_ms: u64,

    /// Probes allowed through in HalfOpen.
    pub half_open_probes: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            window_size: 20,
            minimum_calls: 10,
            cooldown_ms: 30_000,
            cooldown_multiplier: 2.0,
            max_cooldown_ms: 5 * 60 * 1000,
            half_open_probes: 3,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }
}

/// Retry and backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_backoff_ms: u64,

    /// Backoff ceiling.
    pub max_backoff_ms: u64,

    /// Growth factor between retries.
    pub multiplier: f64,

    /// Random spread applied to each delay, as a fraction of it (0.0 - 1.0).
    pub jitter: f64,

    /// Deadline handed to the source for each attempt.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            jitter: 0.2,
            attempt_timeout_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Token bucket admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket size (burst).
    pub capacity: u32,

    /// Tokens added per second.
    pub refill_per_sec: f64,

    /// Wait for a token instead of failing immediately.
    pub blocking: bool,

    /// Longest wait for a token when blocking.
    pub acquire_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_per_sec: 10.0,
            blocking: true,
            acquire_timeout_ms: 2_000,
        }
    }
}

impl RateLimitConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Compression settings for disk records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Apply zstd compression when writing to disk.
    pub enabled: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Values smaller than this are stored raw.
    pub min_size_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            zstd_level: 3,
            min_size_bytes: 1024,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot be built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let memory_units = match self.memory.capacity {
            LruCapacity::Entries(n) | LruCapacity::Bytes(n) => n,
        };
        if memory_units == 0 {
            return Err(invalid("memory.capacity", "must be greater than zero"));
        }
        if self.memory.shards == 0 {
            return Err(invalid("memory.shards", "must be at least 1"));
        }
        if self.memory.shards > memory_units {
            return Err(invalid("memory.shards", "cannot exceed memory.capacity"));
        }

        if self.disk.enabled {
            if self.disk.max_bytes == 0 {
                return Err(invalid("disk.max_bytes", "must be greater than zero"));
            }
            if self.disk.max_segment_bytes == 0 {
                return Err(invalid("disk.max_segment_bytes", "must be greater than zero"));
            }
            if !(0.0..=1.0).contains(&self.disk.compaction_garbage_ratio) {
                return Err(invalid("disk.compaction_garbage_ratio", "must be within 0.0..=1.0"));
            }
            if self.disk.compaction_interval_ms == 0 {
                return Err(invalid("disk.compaction_interval_ms", "must be greater than zero"));
            }
        }

        if self.remote.enabled && self.remote.op_timeout_ms == 0 {
            return Err(invalid("remote.op_timeout_ms", "must be greater than zero"));
        }

        if self.ttl.default_ttl_ms == 0 {
            return Err(invalid("ttl.default_ttl_ms", "must be greater than zero"));
        }
        if self.ttl.default_ttl_ms > self.ttl.max_ttl_ms {
            return Err(invalid("ttl.default_ttl_ms", "cannot exceed ttl.max_ttl_ms"));
        }

        if self.coordinator.write_queue_capacity == 0 {
            return Err(invalid("coordinator.write_queue_capacity", "must be greater than zero"));
        }
        if self.coordinator.max_key_len == 0 {
            return Err(invalid("coordinator.max_key_len", "must be greater than zero"));
        }

        let b = &self.breaker;
        if !(b.failure_ratio > 0.0 && b.failure_ratio <= 1.0) {
            return Err(invalid("breaker.failure_ratio", "must be within (0.0, 1.0]"));
        }
        if b.window_size == 0 {
            return Err(invalid("breaker.window_size", "must be greater than zero"));
        }
        if b.minimum_calls == 0 || b.minimum_calls > b.window_size {
            return Err(invalid("breaker.minimum_calls", "must be within 1..=breaker.window_size"));
        }
        if b.half_open_probes == 0 {
            return Err(invalid("breaker.half_open_probes", "must be at least 1"));
        }
        if b.cooldown_ms == 0 || b.cooldown_ms > b.max_cooldown_ms {
            return Err(invalid("breaker.cooldown_ms", "must be non-zero and at most breaker.max_cooldown_ms"));
        }
        if b.cooldown_multiplier < 1.0 {
            return Err(invalid("breaker.cooldown_multiplier", "must be at least 1.0"));
        }

        let r = &self.retry;
        if r.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if r.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "must be at least 1.0"));
        }
        if r.initial_backoff_ms > r.max_backoff_ms {
            return Err(invalid("retry.initial_backoff_ms", "cannot exceed retry.max_backoff_ms"));
        }
        if !(0.0..=1.0).contains(&r.jitter) {
            return Err(invalid("retry.jitter", "must be within 0.0..=1.0"));
        }
        if r.attempt_timeout_ms == 0 {
            return Err(invalid("retry.attempt_timeout_ms", "must be greater than zero"));
        }

        let l = &self.rate_limit;
        if l.capacity == 0 {
            return Err(invalid("rate_limit.capacity", "must be greater than zero"));
        }
        if !(l.refill_per_sec > 0.0) {
            return Err(invalid("rate_limit.refill_per_sec", "must be greater than zero"));
        }

        if !(1..=22).contains(&self.compression.zstd_level) {
            return Err(invalid("compression.zstd_level", "must be within 1..=22"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.breaker.window_size, 20);
        assert_eq!(cfg.retry.max_attempts, 3);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut cfg = Config::default();
        cfg.memory.capacity = LruCapacity::Entries(0);
        assert_eq!(
            cfg.validate().unwrap_err(),
            ConfigError::Invalid {
                field: "memory.capacity",
                reason: "must be greater than zero".into()
            }
        );
    }

    #[test]
    fn test_more_shards_than_capacity_rejected() {
        let mut cfg = Config::default();
        cfg.memory.capacity = LruCapacity::Entries(3);
        cfg.memory.shards = 4;
        assert!(cfg.validate().is_err());
        cfg.memory.shards = 1;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_breaker_minimum_calls_bounded_by_window() {
        let mut cfg = Config::default();
        cfg.breaker.minimum_calls = cfg.breaker.window_size + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_disabled_disk_skips_disk_checks() {
        let mut cfg = Config::default();
        cfg.disk.enabled = false;
        cfg.disk.max_bytes = 0;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{ "memory": { "capacity": { "entries": 500 }, "shards": 4 }, "retry": { "max_attempts": 5 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.memory.capacity, LruCapacity::Entries(500));
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.initial_backoff_ms, 100);
        assert_eq!(cfg.rate_limit.capacity, 20);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/artifact-cache.json")).unwrap();
        assert_eq!(cfg.server.listen, "0.0.0.0:8080");
    }
}
