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
            ram_cache: true,
            spans: vec![VolumeSpanConfig { use_span: "span0".to_string(), size: SizeSpec::Percent(100.0) }],
        }],
    }
}

/// P10: writing the same bytes again over an existing key must leave
/// the directory pointing at a document whose content equals those
/// bytes, across a spread of random sizes.
#[test]
fn overwrite_with_identical_bytes_is_idempotent() -> stripe_cache::Result<()> {
    let dir = tempfile::tempdir()?;
    let storage = single_volume_storage(dir.path().join("span0.bin"));
    let cache = Cache::open(&storage, EngineConfig::new())?;

    let mut rng = rand::thread_rng();
    for trial in 0..20_u32 {
        let key = CacheKey::rand((trial & 0xFF) as u8, ((trial >> 8) & 0xFF) as u8);
        let size = 1 + (rng.next_u32() % 8192) as usize;
        let mut payload = vec![0_u8; size];
        rng.fill_bytes(&mut payload);

        cache.open_write(CacheScheme::Http, key, Vec::new(), payload.clone(), WriteOptions::default())?;
        cache.open_write(CacheScheme::Http, key, Vec::new(), payload.clone(), WriteOptions::default())?;

        let result = cache.open_read(CacheScheme::Http, &key)?;
        assert_eq!(result.data, payload, "trial {trial} lost data across a same-content overwrite");
    }
    Ok(())
}

/// P9: removing a key twice leaves the same observable state as
/// removing it once — the second call must not error or resurrect
/// anything.
#[test]
fn remove_is_idempotent_across_random_keys() -> stripe_cache::Result<()> {
    let dir = tempfile::tempdir()?;
    let storage = single_volume_storage(dir.path().join("span0.bin"));
    let cache = Cache::open(&storage, EngineConfig::new())?;

    let mut rng = rand::thread_rng();
    for trial in 0..20_u32 {
        let key = CacheKey::rand((trial & 0xFF) as u8, ((trial >> 8) & 0xFF) as u8);
        let mut payload = vec![0_u8; 128];
        rng.fill_bytes(&mut payload);
        cache.open_write(CacheScheme::Http, key, Vec::new(), payload, WriteOptions::default())?;

        let first = cache.remove(CacheScheme::Http, &key)?;
        let second = cache.remove(CacheScheme::Http, &key)?;
        assert!(first, "trial {trial}: the object existed and should have been removed");
        assert!(!second, "trial {trial}: a second remove must be a no-op, not find anything new");
        assert!(!cache.lookup(CacheScheme::Http, &key)?);
    }
    Ok(())
}

/// Every object written round-trips through an independent random key
/// and payload, regardless of size class, with no cross-contamination
/// between entries sharing the same stripe.
#[test]
fn random_keys_and_sizes_round_trip_without_cross_contamination() -> stripe_cache::Result<()> {
    let dir = tempfile::tempdir()?;
    let storage = single_volume_storage(dir.path().join("span0.bin"));
    let cache = Cache::open(&storage, EngineConfig::new())?;

    let mut rng = rand::thread_rng();
    let mut entries = Vec::new();
    for trial in 0..40_u32 {
        let key = CacheKey::rand((trial & 0xFF) as u8, ((trial >> 8) & 0xFF) as u8);
        let size = 1 + (rng.next_u32() % (256 * 1024)) as usize;
        let mut payload = vec![0_u8; size];
        rng.fill_bytes(&mut payload);
        cache.open_write(CacheScheme::Http, key, Vec::new(), payload.clone(), WriteOptions::default())?;
        entries.push((key, payload));
    }

    for (key, payload) in &entries {
        let result = cache.open_read(CacheScheme::Http, key)?;
        assert_eq!(&result.data, payload);
    }
    Ok(())
}
