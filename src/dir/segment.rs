// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::DirEntry;

/// Entries per bucket; entry 0 of a bucket is the chain head, 1..3 are
/// chain/free slots.
pub const DIR_DEPTH: usize = 4;

/// Hard cap on entries in one segment (`MAX_ENTRIES_PER_SEGMENT`).
pub const MAX_ENTRIES_PER_SEGMENT: usize = 1 << 16;

/// Upper bound on a chain walk before we assume a loop and bail.
pub const MAX_CHAIN_WALK: usize = 100;

/// One directory segment: a flat array of `buckets * DIR_DEPTH` entries
/// plus a freelist threading every currently-unused slot.
///
/// Index `0` is reserved to mean "no entry" in `next`/freelist links
/// (mirrors the source's use of index `0` as a null successor), so
/// entry storage is `buckets * DIR_DEPTH` slots addressed `0..`, but a
/// link value of `0` unambiguously means "end of chain" only because
/// bucket head slots are never placed on the freelist — they're
/// addressed directly by bucket index, never reached via `next`.
#[derive(Debug, Clone)]
pub struct Segment {
    buckets: usize,
    entries: Vec<DirEntry>,
    freelist: u16,
}

impl Segment {
    /// Builds an empty segment of `buckets` buckets, with every
    /// non-head slot threaded onto the freelist.
    #[must_use]
    pub fn new(buckets: usize) -> Self {
        assert!(buckets * DIR_DEPTH <= MAX_ENTRIES_PER_SEGMENT);
        let mut entries = vec![DirEntry::empty(); buckets * DIR_DEPTH];

        // Thread every non-head slot (index % DIR_DEPTH != 0) onto the freelist.
        let mut freelist: u16 = 0;
        for bucket in (0..buckets).rev() {
            for slot in (1..DIR_DEPTH).rev() {
                let idx = (bucket * DIR_DEPTH + slot) as u16;
                entries[idx as usize].set_next(freelist);
                freelist = idx;
            }
        }

        Self {
            buckets,
            entries,
            freelist,
        }
    }

    /// Number of buckets in this segment.
    #[must_use]
    pub fn buckets(&self) -> usize {
        self.buckets
    }

    /// Slot index of `bucket`'s chain head.
    #[must_use]
    pub fn bucket_head_index(&self, bucket: usize) -> usize {
        bucket * DIR_DEPTH
    }

    /// The entry at `idx`.
    #[must_use]
    pub fn entry(&self, idx: usize) -> &DirEntry {
        &self.entries[idx]
    }

    /// Mutable access to the entry at `idx`.
    pub fn entry_mut(&mut self, idx: usize) -> &mut DirEntry {
        &mut self.entries[idx]
    }

    /// Every entry slot in this segment, for serialization.
    #[must_use]
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    /// Mutable access to every entry slot, for deserialization.
    pub fn entries_mut(&mut self) -> &mut [DirEntry] {
        &mut self.entries
    }

    /// Walks the chain starting at `bucket`'s head, calling `f` on each
    /// non-empty entry's index. Stops after [`MAX_CHAIN_WALK`] hops as a
    /// production safeguard against a corrupted loop.
    pub fn walk_chain(&self, bucket: usize, mut f: impl FnMut(usize) -> bool) {
        let mut idx = self.bucket_head_index(bucket);
        let mut hops = 0;

        #[cfg(debug_assertions)]
        let mut tortoise = idx;
        #[cfg(debug_assertions)]
        let mut tortoise_step = false;

        loop {
            if self.entries[idx].is_empty() {
                return;
            }
            if !f(idx) {
                return;
            }

            let next = self.entries[idx].next();
            if next == 0 {
                return;
            }
            idx = next as usize;

            hops += 1;
            if hops > MAX_CHAIN_WALK {
                log::warn!("directory chain exceeded {MAX_CHAIN_WALK} hops, aborting walk");
                return;
            }

            #[cfg(debug_assertions)]
            {
                if tortoise_step {
                    tortoise = self.entries[tortoise].next() as usize;
                    if tortoise == idx {
                        log::warn!("directory chain loop detected in segment, will be rebuilt");
                        return;
                    }
                }
                tortoise_step = !tortoise_step;
            }
        }
    }

    /// Pops a slot off this segment's freelist, or `None` if exhausted.
    pub fn alloc_free(&mut self) -> Option<usize> {
        if self.freelist == 0 {
            return None;
        }
        let idx = self.freelist as usize;
        self.freelist = self.entries[idx].next();
        self.entries[idx].set_next(0);
        Some(idx)
    }

    /// Returns a cleared slot to this segment's freelist.
    pub fn free(&mut self, idx: usize) {
        self.entries[idx] = DirEntry::empty();
        self.entries[idx].set_next(self.freelist);
        self.freelist = idx as u16;
    }

    /// Number of free slots currently on this segment's freelist.
    #[must_use]
    pub fn freelist_len(&self) -> usize {
        let mut count = 0;
        let mut idx = self.freelist;
        let mut hops = 0;
        while idx != 0 {
            count += 1;
            idx = self.entries[idx as usize].next();
            hops += 1;
            if hops > self.entries.len() {
                break;
            }
        }
        count
    }

    /// Count of non-empty slots, for directory-fullness stats.
    #[must_use]
    pub fn used_entries(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_empty()).count()
    }
}
