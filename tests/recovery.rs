// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use rand::RngCore;
use stripe_cache::config::{SizeSpec, SpanConfig, VolumeConfig, VolumeSpanConfig};
use stripe_cache::volume::MIN_STRIPE_SIZE;
use stripe_cache::{Cache, CacheKey, CacheScheme, EngineConfig, StorageConfig, WriteOptions};

fn single_volume_storage(span_path: std::path::PathBuf) -> StorageConfig {
    StorageConfig {
        spans: vec![SpanConfig {
            id: "span0".to_string(),
            path: span_path,
            size: Some(MIN_STRIPE_SIZE),
            hash_seed: None,
        }],
        volumes: vec![VolumeConfig {
            id: 1,
            size: SizeSpec::Percent(100.0),
            scheme: CacheScheme::Http,
            ram_cache: false,
            spans: vec![VolumeSpanConfig { use_span: "span0".to_string(), size: SizeSpec::Percent(100.0) }],
        }],
    }
}

/// Simulates a restart by simply dropping the [`Cache`] (there is no
/// explicit shutdown call to make — every write already lands on disk
/// synchronously before `open_write` returns) and reopening the same
/// span file from scratch. The directory rebuilt by the scan forward
/// from the stripe header's recorded write position must reproduce
/// every object written in the previous lifetime.
#[test]
fn objects_written_before_a_restart_are_readable_after_reopen() -> stripe_cache::Result<()> {
    let dir = tempfile::tempdir()?;
    let span_path = dir.path().join("span0.bin");
    let storage = single_volume_storage(span_path.clone());

    let mut rng = rand::thread_rng();
    let mut keys = Vec::with_capacity(100);
    let mut payloads = Vec::with_capacity(100);

    {
        let cache = Cache::open(&storage, EngineConfig::new())?;
        for i in 0..100_u32 {
            let key = CacheKey::rand((i & 0xFF) as u8, ((i >> 8) & 0xFF) as u8);
            let mut payload = vec![0_u8; 256 + (i as usize % 512)];
            rng.fill_bytes(&mut payload);
            cache.open_write(CacheScheme::Http, key, Vec::new(), payload.clone(), WriteOptions::default())?;
            keys.push(key);
            payloads.push(payload);
        }
        // `cache` is dropped here with no explicit close: every write
        // already reached disk synchronously, so this models the
        // crash-restart boundary directly.
    }

    let reopened = Cache::open(&storage, EngineConfig::new())?;
    for (key, payload) in keys.iter().zip(&payloads) {
        let result = reopened.open_read(CacheScheme::Http, key)?;
        assert_eq!(&result.data, payload);
    }
    Ok(())
}

#[test]
fn reopen_of_an_empty_stripe_finds_nothing() -> stripe_cache::Result<()> {
    let dir = tempfile::tempdir()?;
    let span_path = dir.path().join("span0.bin");
    let storage = single_volume_storage(span_path);

    {
        let _cache = Cache::open(&storage, EngineConfig::new())?;
    }
    let reopened = Cache::open(&storage, EngineConfig::new())?;
    let key = CacheKey::from_bytes([0x42; 16]);
    assert!(!reopened.lookup(CacheScheme::Http, &key)?);
    Ok(())
}
