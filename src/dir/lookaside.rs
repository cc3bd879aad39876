// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::DirEntry;
use crate::key::CacheKey;
use std::collections::HashMap;

const LOOKASIDE_BUCKETS: usize = 256;

/// Per-stripe table of in-flight multi-fragment evacuations, keyed by
/// `earliest_key`. While an evacuation is in progress the rewritten
/// directory entry lives here rather than in the main directory, so a
/// concurrent `probe` sees the relocated fragment immediately instead
/// of racing the evacuator's `dir_overwrite`.
#[derive(Debug, Default)]
pub struct Lookaside {
    entries: HashMap<CacheKey, DirEntry>,
}

impl Lookaside {
    /// An empty lookaside table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_capacity(LOOKASIDE_BUCKETS),
        }
    }

    /// The rewritten entry for `earliest_key`, if an evacuation of it
    /// is in progress.
    #[must_use]
    pub fn get(&self, earliest_key: &CacheKey) -> Option<&DirEntry> {
        self.entries.get(earliest_key)
    }

    /// Registers (or updates) the rewritten entry for an in-flight evacuation.
    pub fn insert(&mut self, earliest_key: CacheKey, new_dir: DirEntry) {
        self.entries.insert(earliest_key, new_dir);
    }

    /// Moves the entry out of lookaside; the caller is expected to
    /// `Directory::overwrite` the main directory with it immediately
    /// (see `evacuate::fixup`).
    pub fn take(&mut self, earliest_key: &CacheKey) -> Option<DirEntry> {
        self.entries.remove(earliest_key)
    }

    /// Drops every lookaside entry for which `still_valid` returns
    /// false. Run once per aggregation cycle.
    pub fn cleanup(&mut self, mut still_valid: impl FnMut(&DirEntry) -> bool) {
        self.entries.retain(|_, dir| still_valid(dir));
    }

    /// Number of in-flight evacuations currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no evacuation is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn insert_then_get_then_take() {
        let mut lookaside = Lookaside::new();
        let key = CacheKey::from_bytes([3; 16]);
        let mut entry = DirEntry::empty();
        entry.set_offset(99);
        lookaside.insert(key, entry);

        assert_eq!(lookaside.get(&key).map(DirEntry::offset), Some(99));
        assert_eq!(lookaside.take(&key).map(|e| e.offset()), Some(99));
        assert!(lookaside.get(&key).is_none());
    }

    #[test]
    fn cleanup_drops_invalid_entries() {
        let mut lookaside = Lookaside::new();
        let key = CacheKey::from_bytes([4; 16]);
        lookaside.insert(key, DirEntry::empty());
        assert_eq!(lookaside.len(), 1);

        lookaside.cleanup(|_| false);
        assert!(lookaside.is_empty());
    }
}
