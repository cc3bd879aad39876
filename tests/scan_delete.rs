// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use stripe_cache::config::{SizeSpec, SpanConfig, VolumeConfig, VolumeSpanConfig};
use stripe_cache::volume::MIN_STRIPE_SIZE;
use stripe_cache::{Cache, CacheKey, CacheScheme, EngineConfig, ScanAction, StorageConfig, WriteOptions};

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

#[test]
fn scan_callback_deletes_even_indexed_objects() -> stripe_cache::Result<()> {
    let dir = tempfile::tempdir()?;
    let storage = single_volume_storage(dir.path().join("span0.bin"));
    let cache = Cache::open(&storage, EngineConfig::new())?;

    let mut keys = Vec::with_capacity(20);
    for i in 0..20_u32 {
        let key = CacheKey::rand((i & 0xFF) as u8, ((i >> 8) & 0xFF) as u8);
        // header byte 0 marks even-indexed objects, so the scan
        // callback can tell them apart from the document alone.
        let header = vec![u8::from(i % 2 == 0)];
        cache.open_write(CacheScheme::Http, key, header, format!("object-{i}").into_bytes(), WriteOptions::default())?;
        keys.push(key);
    }

    let stats = cache.scan(CacheScheme::Http, |doc| {
        if doc.header.first().copied() == Some(1) {
            ScanAction::Delete
        } else {
            ScanAction::Continue
        }
    })?;
    assert_eq!(stats.visited, 20);
    assert_eq!(stats.deleted, 10);

    for (i, key) in keys.iter().enumerate() {
        let expect_present = i % 2 != 0;
        assert_eq!(cache.lookup(CacheScheme::Http, key)?, expect_present);
    }
    Ok(())
}
