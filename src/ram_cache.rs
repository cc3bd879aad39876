// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::key::CacheKey;
use quick_cache::{sync::Cache, Equivalent, Weighter};

/// Composite key: a fragment's content key plus the on-disk offset it
/// was read from (`aux`). `aux` doubles as a staleness check — once a
/// fragment moves (evacuation, rewrite) the old `(key, aux)` pair no
/// longer resolves and the stale entry is simply never hit again; it
/// ages out of the cache on its own.
#[derive(Eq, std::hash::Hash, PartialEq)]
struct Entry(CacheKey, u64);

impl Equivalent<Entry> for (&CacheKey, u64) {
    fn equivalent(&self, entry: &Entry) -> bool {
        self.0 == &entry.0 && self.1 == entry.1
    }
}

#[derive(Clone)]
struct FragmentWeighter;

impl Weighter<Entry, Vec<u8>> for FragmentWeighter {
    fn weight(&self, _: &Entry, data: &Vec<u8>) -> u64 {
        data.len() as u64
    }
}

/// Result of a [`RamCache::get`] lookup, mirroring the on-disk
/// compressed/uncompressed distinction a document's header carries.
#[derive(Debug, Clone)]
pub enum RamCacheLookup {
    /// hit, payload stored as-is
    HitUncompressed(Vec<u8>),
    /// hit, payload stored compressed
    HitCompressed(Vec<u8>),
    /// no entry for this `(key, aux)` pair
    Miss,
}

/// In-memory fragment cache sitting in front of disk reads.
/// Implementations are expected to be internally synchronized: the
/// engine treats this as an opaque concurrent map and never wraps it
/// in its own lock.
pub trait RamCache: Send + Sync {
    /// Builds a cache with roughly `bytes_budget` bytes of capacity.
    fn init(bytes_budget: u64) -> Self
    where
        Self: Sized;

    /// Looks up the fragment stored under `(key, aux)`.
    fn get(&self, key: &CacheKey, aux: u64) -> RamCacheLookup;

    /// Inserts or replaces the fragment stored under `(key, aux)`.
    fn put(&self, key: CacheKey, data: Vec<u8>, compressed: bool, aux: u64);

    /// Relabels an entry after its disk offset changes (post-evacuation),
    /// so a fragment already resident in RAM isn't evicted and re-read
    /// just because it moved.
    fn fixup(&self, key: &CacheKey, old_aux: u64, new_aux: u64);
}

/// Reference `RamCache` backed by `quick_cache`, the same crate (and
/// weight-by-byte-length policy) the key-value-separated blob cache
/// this engine was built from uses for its own hot-value cache.
pub struct QuickRamCache {
    data: Cache<Entry, Vec<u8>, FragmentWeighter>,
    compressed: std::sync::atomic::AtomicU64,
}

impl std::fmt::Debug for QuickRamCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QuickRamCache<weight: {} bytes>", self.data.weight())
    }
}

impl RamCache for QuickRamCache {
    fn init(bytes_budget: u64) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        let data = Cache::with(
            10_000,
            bytes_budget,
            FragmentWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Self {
            data,
            compressed: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn get(&self, key: &CacheKey, aux: u64) -> RamCacheLookup {
        match self.data.get(&(key, aux)) {
            Some(data) => RamCacheLookup::HitUncompressed(data),
            None => RamCacheLookup::Miss,
        }
    }

    fn put(&self, key: CacheKey, data: Vec<u8>, compressed: bool, aux: u64) {
        if compressed {
            self.compressed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        self.data.insert(Entry(key, aux), data);
    }

    fn fixup(&self, key: &CacheKey, old_aux: u64, new_aux: u64) {
        if let Some(data) = self.data.remove(&(key, old_aux)) {
            self.data.insert(Entry(*key, new_aux), data.1);
        }
    }
}

impl QuickRamCache {
    /// Number of entries currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total weighted size of cached entries, in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.weight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn put_then_get_hits() {
        let cache = QuickRamCache::init(1024 * 1024);
        let key = CacheKey::from_bytes([1; 16]);
        cache.put(key, b"hello".to_vec(), false, 100);

        match cache.get(&key, 100) {
            RamCacheLookup::HitUncompressed(data) => assert_eq!(data, b"hello"),
            _ => panic!("expected hit"),
        }
    }

    #[test]
    fn stale_aux_misses() {
        let cache = QuickRamCache::init(1024 * 1024);
        let key = CacheKey::from_bytes([2; 16]);
        cache.put(key, b"hello".to_vec(), false, 100);

        assert!(matches!(cache.get(&key, 200), RamCacheLookup::Miss));
    }

    #[test]
    fn fixup_relabels_entry_to_new_offset() {
        let cache = QuickRamCache::init(1024 * 1024);
        let key = CacheKey::from_bytes([3; 16]);
        cache.put(key, b"hello".to_vec(), false, 100);

        cache.fixup(&key, 100, 200);
        assert!(matches!(cache.get(&key, 100), RamCacheLookup::Miss));
        assert!(matches!(cache.get(&key, 200), RamCacheLookup::HitUncompressed(_)));
    }
}
