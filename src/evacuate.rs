// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{dir::DirEntry, key::CacheKey};
use std::collections::HashMap;

/// Size of one preservation-table bucket's offset range.
pub const EVACUATION_BUCKET_SIZE: u64 = 16 * 1024 * 1024;

/// Default size of the evacuation lookahead window ahead of the write
/// head, in bytes, scanned by `aggWrite` step 4.
pub const EVACUATION_SIZE: u64 = 4 * 1024 * 1024;

/// Why a fragment is being preserved. Reader-acquired blocks are
/// reference-counted (released on `close_read`); forced blocks are
/// not and are released once the rewrite completes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EvacuationReason {
    /// an active reader is still holding this fragment live
    ReaderAcquired,
    /// preservation was forced regardless of reader activity (e.g. hit
    /// evacuation ahead of the write head)
    Forced,
}

/// One fragment pending (or mid-flight) rewrite ahead of the write
/// head.
#[derive(Debug, Clone)]
pub struct EvacuationBlock {
    /// the fragment's current on-disk location
    pub dir: DirEntry,
    /// the rewritten location, filled in once the evacuator's write completes
    pub new_dir: Option<DirEntry>,
    /// (key, earliest_key) pairs collected while resolving chain collisions
    pub keys: Vec<(CacheKey, CacheKey)>,
    /// why this block is being preserved
    pub reason: EvacuationReason,
    /// count of active readers holding this block live (only
    /// meaningful for [`EvacuationReason::ReaderAcquired`])
    pub readers: u32,
    /// the read for this fragment has already been scheduled
    pub done: bool,
    /// set once this block's rewrite has been copied into an agg batch
    pub write_scheduled: bool,
}

impl EvacuationBlock {
    /// A fresh block tracking `dir` for the given `reason`.
    #[must_use]
    pub fn new(dir: DirEntry, reason: EvacuationReason) -> Self {
        Self {
            dir,
            new_dir: None,
            keys: Vec::new(),
            reason,
            readers: if reason == EvacuationReason::ReaderAcquired { 1 } else { 0 },
            done: false,
            write_scheduled: false,
        }
    }
}

/// Per-stripe table of evacuation blocks, hash-bucketed by
/// `offset / EVACUATION_BUCKET_SIZE` so the aggregation writer can
/// cheaply find blocks that intersect its upcoming write window.
#[derive(Debug, Default)]
pub struct PreservationTable {
    buckets: HashMap<u64, Vec<EvacuationBlock>>,
}

impl PreservationTable {
    /// An empty preservation table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }

    fn bucket_key(offset: u64) -> u64 {
        offset / EVACUATION_BUCKET_SIZE
    }

    /// Registers a reader's interest in preserving the fragment at
    /// `dir`. A repeat acquire on an existing block increments its
    /// reader count instead of creating a duplicate.
    pub fn acquire(&mut self, dir: DirEntry) {
        let bucket = self.buckets.entry(Self::bucket_key(dir.offset())).or_default();
        if let Some(existing) = bucket
            .iter_mut()
            .find(|b| b.dir.offset() == dir.offset() && b.reason == EvacuationReason::ReaderAcquired)
        {
            existing.readers += 1;
        } else {
            bucket.push(EvacuationBlock::new(dir, EvacuationReason::ReaderAcquired));
        }
    }

    /// Releases a reader's interest; the block is dropped once its
    /// reader count returns to zero and no rewrite is pending.
    pub fn release_reader(&mut self, offset: u64) {
        let bucket_key = Self::bucket_key(offset);
        if let Some(bucket) = self.buckets.get_mut(&bucket_key) {
            bucket.retain_mut(|b| {
                if b.dir.offset() == offset && b.reason == EvacuationReason::ReaderAcquired {
                    b.readers = b.readers.saturating_sub(1);
                    b.readers > 0 || b.write_scheduled
                } else {
                    true
                }
            });
        }
    }

    /// Forces preservation of the fragment at `dir` (periodic scan over
    /// pinned documents, or chaining successor fragments of a
    /// multi-fragment rewrite). Not reference-counted.
    pub fn force_evacuate_head(&mut self, dir: DirEntry) {
        let bucket = self.buckets.entry(Self::bucket_key(dir.offset())).or_default();
        if !bucket.iter().any(|b| b.dir.offset() == dir.offset()) {
            bucket.push(EvacuationBlock::new(dir, EvacuationReason::Forced));
        }
    }

    /// The next not-yet-scheduled block whose offset intersects
    /// `[window_start, window_end)`, marking it `done` so it isn't
    /// scheduled twice.
    pub fn next_in_window(&mut self, window_start: u64, window_end: u64) -> Option<EvacuationBlock> {
        for bucket in self.buckets.values_mut() {
            for block in bucket.iter_mut() {
                let offset = block.dir.offset();
                if !block.done && offset >= window_start && offset < window_end {
                    block.done = true;
                    return Some(block.clone());
                }
            }
        }
        None
    }

    /// Records that a block's rewrite has been copied into an
    /// aggregation batch.
    pub fn mark_write_scheduled(&mut self, offset: u64, new_dir: DirEntry) {
        for bucket in self.buckets.values_mut() {
            if let Some(block) = bucket.iter_mut().find(|b| b.dir.offset() == offset) {
                block.new_dir = Some(new_dir);
                block.write_scheduled = true;
            }
        }
    }

    /// Drops completed, overtaken blocks: `done` and whose offset has
    /// fallen behind the current write position.
    pub fn periodic_scan(&mut self, write_pos: u64) {
        for bucket in self.buckets.values_mut() {
            bucket.retain(|b| !(b.done && b.write_scheduled && b.dir.offset() < write_pos));
        }
        self.buckets.retain(|_, b| !b.is_empty());
    }

    /// Total number of tracked evacuation blocks across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Whether no evacuation block is currently tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn dir_at(offset: u64) -> DirEntry {
        let mut d = DirEntry::empty();
        d.set_offset(offset);
        d
    }

    #[test]
    fn acquire_increments_existing_reader_count() {
        let mut table = PreservationTable::new();
        table.acquire(dir_at(100));
        table.acquire(dir_at(100));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn release_reader_drops_block_at_zero_refs() {
        let mut table = PreservationTable::new();
        table.acquire(dir_at(100));
        table.release_reader(100);
        assert!(table.is_empty());
    }

    #[test]
    fn force_evacuate_is_not_duplicated() {
        let mut table = PreservationTable::new();
        table.force_evacuate_head(dir_at(200));
        table.force_evacuate_head(dir_at(200));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn next_in_window_only_returns_intersecting_undone_blocks() {
        let mut table = PreservationTable::new();
        table.force_evacuate_head(dir_at(10));
        table.force_evacuate_head(dir_at(1000));

        let found = table.next_in_window(0, 100).expect("one intersects");
        assert_eq!(found.dir.offset(), 10);
        assert!(table.next_in_window(0, 100).is_none());
    }

    #[test]
    fn periodic_scan_drops_completed_overtaken_blocks() {
        let mut table = PreservationTable::new();
        table.force_evacuate_head(dir_at(10));
        let block = table.next_in_window(0, 100).expect("found");
        table.mark_write_scheduled(10, dir_at(99999));
        let _ = block;

        table.periodic_scan(20);
        assert!(table.is_empty());
    }
}
