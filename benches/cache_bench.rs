//! Benchmarks for the cache tiers.

use std::time::Duration;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

use artifact_cache_tier::cache::compressor::Compressor;
use artifact_cache_tier::cache::entry::{CacheEntry, Tier};
use artifact_cache_tier::cache::lru::{LruCapacity, LruTier};
use artifact_cache_tier::cache::persistent::PersistentTier;
use artifact_cache_tier::clock::{system_clock, Clock};
use artifact_cache_tier::config::{CompressionConfig, DiskConfig};

fn entry(i: usize, value: &Bytes, now: u64) -> CacheEntry {
    CacheEntry::new(format!("artifact/{i}"), value.clone(), now, Duration::from_secs(600), Tier::Upstream)
}

fn bench_lru(c: &mut Criterion) {
    let clock = system_clock();
    let now = clock.now_millis();
    let value = Bytes::from(vec![7u8; 512]);
    let lru = LruTier::new(LruCapacity::Entries(10_000), 16, clock);
    for i in 0..10_000 {
        lru.insert(entry(i, &value, now));
    }

    c.bench_function("lru_lookup_10k", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 7919) % 10_000;
            black_box(lru.lookup(&format!("artifact/{i}")));
        })
    });

    c.bench_function("lru_insert_with_eviction", |b| {
        let mut i = 10_000;
        b.iter(|| {
            i += 1;
            black_box(lru.insert(entry(i, &value, now)));
        })
    });
}

fn bench_compression(c: &mut Criterion) {
    let compressor = Compressor::new(CompressionConfig::default());
    let data: Vec<u8> = b"{\"page\":1,\"text\":\"lorem ipsum\"}".repeat(8 * 1024);

    c.bench_function("zstd_encode_256kb_json", |b| {
        b.iter(|| black_box(compressor.encode(black_box(&data))))
    });
}

fn bench_segment_append(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let clock = system_clock();
    let now = clock.now_millis();
    let disk = PersistentTier::open(
        DiskConfig {
            path: tmp.path().to_path_buf(),
            ..DiskConfig::default()
        },
        CompressionConfig::default(),
        clock,
    )
    .unwrap();
    let value = Bytes::from(vec![3u8; 4 * 1024]);

    c.bench_function("segment_append_4kb", |b| {
        let mut i = 0;
        b.iter(|| {
            i += 1;
            disk.write(&entry(i % 1_000, &value, now)).unwrap();
        })
    });

    c.bench_function("segment_read_4kb", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % 1_000;
            black_box(disk.read(&format!("artifact/{i}")).unwrap());
        })
    });
}

criterion_group!(benches, bench_lru, bench_compression, bench_segment_append);
criterion_main!(benches);
