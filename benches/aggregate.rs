// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use criterion::{criterion_group, criterion_main, Criterion};
use rand::RngCore;
use stripe_cache::config::{SizeSpec, SpanConfig, VolumeConfig, VolumeSpanConfig};
use stripe_cache::volume::MIN_STRIPE_SIZE;
use stripe_cache::{Cache, CacheKey, CacheScheme, EngineConfig, StorageConfig, WriteOptions};

fn single_volume_storage(span_path: std::path::PathBuf, ram_cache: bool) -> StorageConfig {
    StorageConfig {
        spans: vec![SpanConfig { id: "span0".to_string(), path: span_path, size: Some(MIN_STRIPE_SIZE), hash_seed: None }],
        volumes: vec![VolumeConfig {
            id: 1,
            size: SizeSpec::Percent(100.0),
            scheme: CacheScheme::Http,
            ram_cache,
            spans: vec![VolumeSpanConfig { use_span: "span0".to_string(), size: SizeSpec::Percent(100.0) }],
        }],
    }
}

fn write_then_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragment read");

    let sizes = [512, 4_096, 64_000, 256_000, 1_024 * 1_024];

    for ram_cache in [false, true] {
        let folder = tempfile::tempdir().expect("tempdir");
        let storage = single_volume_storage(folder.path().join("span0.bin"), ram_cache);
        let cache = Cache::open(&storage, EngineConfig::new()).expect("open cache");

        let mut rng = rand::thread_rng();
        let mut keys = Vec::with_capacity(sizes.len());

        for (idx, size) in sizes.into_iter().enumerate() {
            let key = CacheKey::rand(idx as u8, (size % 256) as u8);
            let mut data = vec![0_u8; size];
            rng.fill_bytes(&mut data);
            cache
                .open_write(CacheScheme::Http, key, Vec::new(), data, WriteOptions::default())
                .expect("write");
            keys.push(key);
        }

        let label = if ram_cache { "ram-cached" } else { "disk-only" };

        for (size, key) in sizes.iter().zip(&keys) {
            group.bench_function(format!("{size} bytes ({label})"), |b| {
                b.iter(|| {
                    let _ = cache.open_read(CacheScheme::Http, key).expect("read").data;
                })
            });
        }
    }
}

fn aggregation_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation writer");

    let folder = tempfile::tempdir().expect("tempdir");
    let storage = single_volume_storage(folder.path().join("span0.bin"), false);
    let cache = Cache::open(&storage, EngineConfig::new()).expect("open cache");

    let payload = vec![0x5A_u8; 16_000];
    let counter = std::sync::atomic::AtomicU32::new(0);

    group.bench_function("sequential small writes", |b| {
        b.iter(|| {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let key = CacheKey::rand((n & 0xFF) as u8, ((n >> 8) & 0xFF) as u8);
            cache
                .open_write(CacheScheme::Http, key, Vec::new(), payload.clone(), WriteOptions::default())
                .expect("write");
        })
    });
}

criterion_group!(benches, write_then_read, aggregation_throughput);
criterion_main!(benches);
