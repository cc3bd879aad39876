// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{segment::DIR_DEPTH, DirEntry, Segment};
use crate::key::CacheKey;

/// A hit from [`Directory::probe`]: the matched entry and its location,
/// which the caller threads back in as `last_collision` to resume the
/// walk past it on a retry.
#[derive(Debug, Clone, Copy)]
pub struct ProbeHit {
    /// The matched directory entry.
    pub entry: DirEntry,
    /// Segment the match was found in.
    pub segment: usize,
    /// Index of the matched entry within its bucket chain.
    pub index: usize,
}

/// Persistent `key -> (offset, size, phase, flags)` mapping: one
/// [`Segment`] per `key[word 0] % segments`, and within a segment one
/// bucket per `key[word 1] % buckets`.
///
/// `validity` is supplied by the caller (the stripe knows the current
/// write position/phase; the directory itself has no notion of
/// "durable yet").
#[derive(Debug, Clone)]
pub struct Directory {
    segments: Vec<Segment>,
    buckets_per_segment: usize,
}

impl Directory {
    /// Builds a directory sized so each segment holds at most
    /// `MAX_ENTRIES_PER_SEGMENT` entries, the smallest number of
    /// segments covering `total_entries`.
    #[must_use]
    pub fn new(total_buckets: usize) -> Self {
        let max_buckets_per_segment = (1 << 16) / DIR_DEPTH;
        let segments = total_buckets.div_ceil(max_buckets_per_segment).max(1);
        let buckets_per_segment = total_buckets.div_ceil(segments);

        Self {
            segments: (0..segments)
                .map(|_| Segment::new(buckets_per_segment))
                .collect(),
            buckets_per_segment,
        }
    }

    /// The directory's segments, for serialization.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Mutable access to the directory's segments, for deserialization.
    pub fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    fn segment_index(&self, key: &CacheKey) -> usize {
        key.slice32(0) as usize % self.segments.len()
    }

    fn bucket_index(&self, key: &CacheKey) -> usize {
        key.slice32(1) as usize % self.buckets_per_segment
    }

    /// Walks the chain for `key`'s bucket, returning the first entry
    /// whose tag matches, optionally resuming past `last_collision`.
    /// `is_valid` lets the caller (who knows the stripe's current
    /// write position/phase) decide whether a tag-matching entry is
    /// still durable; invalid matches are deleted in place and the
    /// walk continues, exactly as a stale, not-yet-synced entry would
    /// be dropped on an accidental tag collision.
    pub fn probe(
        &mut self,
        key: &CacheKey,
        last_collision: Option<ProbeHit>,
        mut is_valid: impl FnMut(&DirEntry) -> bool,
    ) -> Option<ProbeHit> {
        let segment_idx = self.segment_index(key);
        let bucket = self.bucket_index(key);
        let tag = crate::key::dir_tag(key.slice32(2));

        let resume_after = last_collision.map(|h| h.index);
        let mut found = None;
        let mut passed_resume_point = resume_after.is_none();
        let mut to_delete = None;

        {
            let segment = &self.segments[segment_idx];
            segment.walk_chain(bucket, |idx| {
                if Some(idx) == resume_after {
                    passed_resume_point = true;
                    return true;
                }
                if !passed_resume_point {
                    return true;
                }
                let entry = *segment.entry(idx);
                if entry.tag() == tag {
                    if is_valid(&entry) {
                        found = Some(ProbeHit {
                            entry,
                            segment: segment_idx,
                            index: idx,
                        });
                        return false;
                    }
                    to_delete = Some(idx);
                    return false;
                }
                true
            });
        }

        if let Some(idx) = to_delete {
            self.delete_at(segment_idx, idx);
            return self.probe(key, last_collision, is_valid);
        }

        found
    }

    /// Inserts a fresh entry for `key`, preferring a same-bucket chain
    /// slot and falling back to the segment freelist. Appended at the
    /// tail so resumable `probe` walks don't skip it.
    pub fn insert(&mut self, key: &CacheKey, mut dir: DirEntry) {
        let segment_idx = self.segment_index(key);
        let bucket = self.bucket_index(key);
        let tag = crate::key::dir_tag(key.slice32(2));
        dir.set_tag(tag);

        let segment = &mut self.segments[segment_idx];
        let head = segment.bucket_head_index(bucket);

        if segment.entry(head).is_empty() {
            *segment.entry_mut(head) = dir;
            segment.entry_mut(head).set_next(0);
            return;
        }

        // Ensure at least one free slot exists before walking to the tail.
        if segment.freelist_len() == 0 {
            self.clean_and_purge_segment(segment_idx);
        }

        let segment = &mut self.segments[segment_idx];
        let mut tail = head;
        loop {
            let next = segment.entry(tail).next();
            if next == 0 {
                break;
            }
            tail = next as usize;
        }

        let Some(slot) = segment.alloc_free() else {
            log::warn!("directory insert found no free slot after cleaning, dropping entry");
            return;
        };
        *segment.entry_mut(slot) = dir;
        segment.entry_mut(slot).set_next(0);
        segment.entry_mut(tail).set_next(slot as u16);
    }

    /// Rewrites the entry matching `old` in place (preserving `next`);
    /// falls back to [`Directory::insert`] when no match is found and
    /// `must_overwrite` is false.
    pub fn overwrite(&mut self, key: &CacheKey, new_dir: DirEntry, old: &DirEntry, must_overwrite: bool) {
        let segment_idx = self.segment_index(key);
        let bucket = self.bucket_index(key);
        let tag = crate::key::dir_tag(key.slice32(2));

        let mut target = None;
        {
            let segment = &self.segments[segment_idx];
            segment.walk_chain(bucket, |idx| {
                let entry = segment.entry(idx);
                if entry.tag() == tag && entry.offset() == old.offset() {
                    target = Some(idx);
                    return false;
                }
                true
            });
        }

        match target {
            Some(idx) => {
                let segment = &mut self.segments[segment_idx];
                let next = segment.entry(idx).next();
                let mut dir = new_dir;
                dir.set_tag(tag);
                dir.set_next(next);
                *segment.entry_mut(idx) = dir;
            }
            None => {
                if !must_overwrite {
                    self.insert(key, new_dir);
                } else {
                    log::warn!("overwrite target missing and must_overwrite set, entry dropped");
                }
            }
        }
    }

    /// Removes the entry matching `key`/`dir` (by tag and offset).
    /// Splices non-head slots onto the freelist; a removed head either
    /// promotes its successor or is zeroed.
    pub fn delete(&mut self, key: &CacheKey, dir: &DirEntry) -> bool {
        let segment_idx = self.segment_index(key);
        let bucket = self.bucket_index(key);
        let tag = crate::key::dir_tag(key.slice32(2));

        let mut prev = None;
        let mut target = None;
        {
            let segment = &self.segments[segment_idx];
            let head = segment.bucket_head_index(bucket);
            let mut cursor = head;
            let mut hops = 0;
            loop {
                let entry = segment.entry(cursor);
                if entry.is_empty() {
                    break;
                }
                if entry.tag() == tag && entry.offset() == dir.offset() {
                    target = Some(cursor);
                    break;
                }
                let next = entry.next();
                if next == 0 {
                    break;
                }
                prev = Some(cursor);
                cursor = next as usize;
                hops += 1;
                if hops > super::segment::MAX_CHAIN_WALK {
                    break;
                }
            }
        }

        let Some(idx) = target else {
            return false;
        };
        self.delete_with_prev(segment_idx, bucket, prev, idx);
        true
    }

    fn delete_at(&mut self, segment_idx: usize, idx: usize) {
        let segment = &self.segments[segment_idx];
        let bucket = idx / DIR_DEPTH;
        let head = segment.bucket_head_index(bucket);
        let mut prev = None;
        if idx != head {
            let mut cursor = head;
            loop {
                let next = segment.entry(cursor).next() as usize;
                if next == idx {
                    prev = Some(cursor);
                    break;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
        }
        self.delete_with_prev(segment_idx, bucket, prev, idx);
    }

    fn delete_with_prev(
        &mut self,
        segment_idx: usize,
        bucket: usize,
        prev: Option<usize>,
        idx: usize,
    ) {
        let segment = &mut self.segments[segment_idx];
        let head = segment.bucket_head_index(bucket);
        let next = segment.entry(idx).next();

        if idx == head {
            if next == 0 {
                *segment.entry_mut(head) = DirEntry::empty();
            } else {
                let successor = *segment.entry(next as usize);
                *segment.entry_mut(head) = successor;
                segment.free(next as usize);
            }
        } else {
            if let Some(prev_idx) = prev {
                segment.entry_mut(prev_idx).set_next(next);
            }
            segment.free(idx);
        }
    }

    /// Zeroes every entry whose offset lies in `[start, end)`.
    pub fn clear_range(&mut self, start: u64, end: u64) {
        for segment_idx in 0..self.segments.len() {
            let buckets = self.segments[segment_idx].buckets();
            for bucket in 0..buckets {
                let mut to_clear = vec![];
                {
                    let segment = &self.segments[segment_idx];
                    segment.walk_chain(bucket, |idx| {
                        let offset = segment.entry(idx).offset();
                        if offset >= start && offset < end {
                            to_clear.push(idx);
                        }
                        true
                    });
                }
                for idx in to_clear {
                    self.delete_at(segment_idx, idx);
                }
            }
        }
    }

    /// On insert pressure, clean stale-offset entries from a segment
    /// (caller-driven via `is_valid` is not available here, so this
    /// performs the coarse LRU-like purge: one in ten `head` entries is
    /// cleared to guarantee forward progress) and re-threads the
    /// freelist.
    fn clean_and_purge_segment(&mut self, segment_idx: usize) {
        let segment = &mut self.segments[segment_idx];
        let mut purged = 0;
        let mut counter = 0_u32;
        for entry in segment.entries_mut() {
            if entry.head() && !entry.is_empty() {
                counter += 1;
                if counter % 10 == 0 {
                    *entry = DirEntry::empty();
                    purged += 1;
                }
            }
        }
        log::warn!("directory segment {segment_idx} freelist exhausted, purged {purged} stale head entries");

        // Re-thread the freelist over every slot left empty, draining
        // whatever remains linked first so entries aren't pushed twice.
        while segment.alloc_free().is_some() {}
        let buckets = segment.buckets();
        let is_empty: Vec<bool> = segment.entries().iter().map(DirEntry::is_empty).collect();
        for bucket in 0..buckets {
            for slot in 1..DIR_DEPTH {
                let idx = bucket * DIR_DEPTH + slot;
                if is_empty[idx] {
                    segment.free(idx);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn key_for(segment: u32, bucket: u32, tag: u32) -> CacheKey {
        let mut bytes = [0_u8; 16];
        bytes[0..4].copy_from_slice(&segment.to_be_bytes());
        bytes[4..8].copy_from_slice(&bucket.to_be_bytes());
        bytes[8..12].copy_from_slice(&tag.to_be_bytes());
        CacheKey::from_bytes(bytes)
    }

    #[test]
    fn insert_then_probe_hits() {
        let mut dir = Directory::new(16);
        let key = key_for(0, 0, 5);
        let mut entry = DirEntry::empty();
        entry.set_offset(100);
        dir.insert(&key, entry);

        let hit = dir.probe(&key, None, |_| true).expect("should hit");
        assert_eq!(hit.entry.offset(), 100);
    }

    #[test]
    fn probe_miss_on_empty_directory() {
        let mut dir = Directory::new(16);
        let key = key_for(0, 0, 5);
        assert!(dir.probe(&key, None, |_| true).is_none());
    }

    #[test]
    fn delete_removes_entry() {
        let mut dir = Directory::new(16);
        let key = key_for(1, 2, 9);
        let mut entry = DirEntry::empty();
        entry.set_offset(55);
        dir.insert(&key, entry);

        let hit = dir.probe(&key, None, |_| true).expect("hit before delete");
        assert!(dir.delete(&key, &hit.entry));
        assert!(dir.probe(&key, None, |_| true).is_none());
    }

    #[test]
    fn overwrite_in_place_preserves_chain() {
        let mut dir = Directory::new(16);
        let key = key_for(0, 0, 3);
        let mut old = DirEntry::empty();
        old.set_offset(10);
        dir.insert(&key, old);

        let mut new_entry = DirEntry::empty();
        new_entry.set_offset(20);
        dir.overwrite(&key, new_entry, &old, true);

        let hit = dir.probe(&key, None, |_| true).expect("hit");
        assert_eq!(hit.entry.offset(), 20);
    }

    #[test]
    fn overwrite_falls_back_to_insert_when_not_found_and_not_required() {
        let mut dir = Directory::new(16);
        let key = key_for(0, 0, 4);
        let missing = DirEntry::empty();
        let mut new_entry = DirEntry::empty();
        new_entry.set_offset(77);
        dir.overwrite(&key, new_entry, &missing, false);

        let hit = dir.probe(&key, None, |_| true).expect("hit via fallback insert");
        assert_eq!(hit.entry.offset(), 77);
    }

    #[test]
    fn clear_range_zeroes_matching_offsets() {
        let mut dir = Directory::new(16);
        let key = key_for(2, 2, 1);
        let mut entry = DirEntry::empty();
        entry.set_offset(1000);
        dir.insert(&key, entry);

        dir.clear_range(500, 1500);
        assert!(dir.probe(&key, None, |_| true).is_none());
    }

    #[test]
    fn probe_deletes_stale_tag_match_and_continues() {
        let mut dir = Directory::new(16);
        let key = key_for(0, 0, 42);
        let mut entry = DirEntry::empty();
        entry.set_offset(10);
        dir.insert(&key, entry);

        // entry is considered invalid (stale), probe should delete and miss
        assert!(dir.probe(&key, None, |_| false).is_none());
        assert!(dir.probe(&key, None, |_| true).is_none());
    }

    #[test]
    fn collision_retry_resumes_past_last_collision() {
        let mut dir = Directory::new(16);
        let key = key_for(0, 0, 7);
        let mut e1 = DirEntry::empty();
        e1.set_offset(1);
        dir.insert(&key, e1);
        let mut e2 = DirEntry::empty();
        e2.set_offset(2);
        dir.insert(&key, e2);

        let first = dir.probe(&key, None, |_| true).expect("first hit");
        let second = dir
            .probe(&key, Some(first), |_| true)
            .expect("second hit");
        assert_ne!(first.entry.offset(), second.entry.offset());
    }
}
