//! Disk tier durability across restarts.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use artifact_cache_tier::cache::coordinator::CacheCoordinator;
use artifact_cache_tier::cache::entry::{CacheEntry, Tier};
use artifact_cache_tier::cache::persistent::PersistentTier;
use artifact_cache_tier::cache::tier::CacheTier;
use artifact_cache_tier::clock::{system_clock, Clock, SharedClock};
use artifact_cache_tier::config::{CompressionConfig, Config, DiskConfig};
use artifact_cache_tier::resilience::FetchError;
use artifact_cache_tier::source::UpstreamError;

fn disk_config(tmp: &TempDir) -> DiskConfig {
    DiskConfig {
        path: tmp.path().to_path_buf(),
        max_segment_bytes: 2 * 1024,
        ..DiskConfig::default()
    }
}

fn open(tmp: &TempDir, clock: SharedClock) -> PersistentTier {
    PersistentTier::open(disk_config(tmp), CompressionConfig::default(), clock).unwrap()
}

fn value_for(i: usize) -> Bytes {
    // Mix of small raw values and larger compressible ones.
    if i % 3 == 0 {
        Bytes::from(format!("artifact-{i}-").repeat(200))
    } else {
        Bytes::from(format!("artifact-{i}"))
    }
}

#[test]
fn test_hundred_keys_survive_restart() {
    let tmp = TempDir::new().unwrap();
    let clock = system_clock();
    let now = clock.now_millis();

    {
        let tier = open(&tmp, clock.clone());
        for i in 0..100 {
            let entry = CacheEntry::new(format!("key-{i}"), value_for(i), now, Duration::from_secs(600), Tier::Upstream);
            tier.write(&entry).unwrap();
        }
        assert!(tier.stats().segment_count > 1);
    }

    let tier = open(&tmp, clock);
    assert_eq!(tier.stats().key_count, 100);
    for i in 0..100 {
        let entry = tier.read(&format!("key-{i}")).unwrap().unwrap();
        assert_eq!(entry.value, value_for(i), "key-{i}");
        assert_eq!(entry.created_at, now);
        assert_eq!(entry.origin_tier, Tier::Disk);
    }
}

#[test]
fn test_compaction_then_restart_keeps_live_set() {
    let tmp = TempDir::new().unwrap();
    let clock = system_clock();
    let now = clock.now_millis();

    {
        let tier = open(&tmp, clock.clone());
        for round in 0..3 {
            for i in 0..20 {
                let value = Bytes::from(format!("v{round}-{i}"));
                tier.write(&CacheEntry::new(format!("k{i}"), value, now, Duration::from_secs(600), Tier::Upstream))
                    .unwrap();
            }
        }
        for i in 0..5 {
            tier.remove(&format!("k{i}")).unwrap();
        }
        assert!(tier.garbage_ratio() > 0.5);
        tier.compact().unwrap();
        assert_eq!(tier.stats().dead_bytes, 0);
    }

    let tier = open(&tmp, clock);
    assert_eq!(tier.stats().key_count, 15);
    assert!(tier.read("k0").unwrap().is_none());
    assert_eq!(&tier.read("k19").unwrap().unwrap().value[..], b"v2-19");
}

#[tokio::test]
async fn test_restarted_coordinator_serves_from_disk() {
    let tmp = TempDir::new().unwrap();

    {
        let disk: Arc<dyn CacheTier> = Arc::new(open(&tmp, system_clock()));
        let cache = CacheCoordinator::builder(Config::default()).disk(disk).build().unwrap();
        cache.put("report/7", Bytes::from_static(b"{\"pages\":3}"), Duration::from_secs(600)).await.unwrap();
        cache.flush().await;
    }

    let disk: Arc<dyn CacheTier> = Arc::new(open(&tmp, system_clock()));
    let cache = CacheCoordinator::builder(Config::default()).disk(disk).build().unwrap();
    let entry = cache
        .get_entry(
            "report/7",
            || async { Err::<Bytes, _>(FetchError::Upstream(UpstreamError::NotFound("report/7".into()))) },
            None,
        )
        .await
        .unwrap();
    assert_eq!(entry.origin_tier, Tier::Disk);
    assert_eq!(&entry.value[..], b"{\"pages\":3}");
}
