// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    aggregate::{in_aggregation_window, in_phase_committed, out_of_phase_safe, vol_offset, AggregationBuffer, PendingWrite},
    aio::AioDispatcher,
    coding::{Decode, Encode},
    dir::{CACHE_BLOCK_SIZE, DirEntry, Directory, Lookaside},
    doc::Doc,
    evacuate::{PreservationTable, EVACUATION_SIZE},
    header::{footer_len, header_len, StripeHeaderFooter, STORE_BLOCK_SIZE},
    key::CacheKey,
    open_dir::{OpenDir, VcId},
    ram_cache::RamCache,
    CacheError, Error, Result,
};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Plain engine counters, mirroring the per-stripe/per-disk statistics
/// the original engine keeps; no external metrics sink, just state the
/// stripe already needs for backlog/capacity decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct StripeStats {
    /// Bytes of fragment data currently occupying the stripe.
    pub bytes_used: u64,
    /// Directory entries currently in use.
    pub direntries_used: u64,
    /// Total directory entries this stripe's directory was sized for.
    pub direntries_total: u64,
    /// Successful fragment reads.
    pub read_success: u64,
    /// Failed fragment reads.
    pub read_failure: u64,
    /// Successful fragment writes.
    pub write_success: u64,
    /// Failed fragment writes.
    pub write_failure: u64,
}

impl StripeStats {
    /// Mean bytes per occupied directory entry, `0` if none are used.
    #[must_use]
    pub fn avg_fragment_size(&self) -> u64 {
        if self.direntries_used == 0 {
            0
        } else {
            self.bytes_used / self.direntries_used
        }
    }
}

struct StripeInner {
    header: StripeHeaderFooter,
    directory: Directory,
    lookaside: Lookaside,
    agg: AggregationBuffer,
    preservation: PreservationTable,
    open_dir: OpenDir,
    stats: StripeStats,
}

/// One self-contained circular region of a span: directory index,
/// dual header/footer copies, aggregation buffer, preservation table
/// and open-directory table, all guarded by a single mutex (the
/// concurrency model's "stripe lock").
pub struct Stripe {
    path: PathBuf,
    file: File,
    /// byte offset of this stripe's region within the span file
    skip: u64,
    /// byte length of the header+directory+footer region, one copy
    dirlen: u64,
    /// byte offset where the circular data area begins
    data_start: u64,
    /// byte length of the circular data area
    data_len: u64,
    inner: Mutex<StripeInner>,
    ram_cache: Box<dyn RamCache>,
    aio: std::sync::Arc<dyn AioDispatcher>,
    next_vc_id: AtomicU64,
}

impl Stripe {
    fn layout(total_buckets: usize) -> (usize, u64) {
        let directory = Directory::new(total_buckets);
        let segments = directory.segments().len();
        let header_len = header_len(segments);
        let body_len = (total_buckets as u64) * 4 * crate::dir::SIZEOF_DIR as u64;
        let dirlen = header_len + body_len + footer_len();
        (segments, dirlen)
    }

    /// Formats a fresh stripe: zeroes both header/footer copies and the
    /// directory, and truncates the backing file to the full stripe
    /// length (`2*dirlen + data_len`).
    pub fn create(
        path: impl AsRef<Path>,
        skip: u64,
        total_len: u64,
        total_buckets: usize,
        ram_cache_bytes: u64,
        aio: std::sync::Arc<dyn AioDispatcher>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let (_segments, dirlen) = Self::layout(total_buckets);
        let data_start = skip + 2 * dirlen;
        let data_len = total_len.saturating_sub(2 * dirlen);
        file.set_len(skip + 2 * dirlen + data_len)?;

        let header = StripeHeaderFooter::new(
            unix_now(),
            STORE_BLOCK_SIZE as u32,
            Directory::new(total_buckets).segments().len(),
        );
        let directory = Directory::new(total_buckets);

        let stripe = Self {
            path,
            file,
            skip,
            dirlen,
            data_start,
            data_len,
            inner: Mutex::new(StripeInner {
                header,
                directory,
                lookaside: Lookaside::new(),
                agg: AggregationBuffer::new(),
                preservation: PreservationTable::new(),
                open_dir: OpenDir::new(),
                stats: StripeStats {
                    direntries_total: (total_buckets * 4) as u64,
                    ..StripeStats::default()
                },
            }),
            ram_cache: Box::new(crate::ram_cache::QuickRamCache::init(ram_cache_bytes)),
            aio,
            next_vc_id: AtomicU64::new(1),
        };

        stripe.sync_both_copies()?;
        Ok(stripe)
    }

    /// Opens an existing stripe, recovering its directory per the
    /// five-step procedure: pick the valid header/footer copy, read its
    /// directory, scan forward from `last_write_pos` for documents
    /// committed after the last sync, then clear any directory entries
    /// whose offsets fall in that uncertain window.
    pub fn open(
        path: impl AsRef<Path>,
        skip: u64,
        total_len: u64,
        total_buckets: usize,
        ram_cache_bytes: u64,
        aio: std::sync::Arc<dyn AioDispatcher>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let (segments, dirlen) = Self::layout(total_buckets);
        let data_start = skip + 2 * dirlen;
        let data_len = total_len.saturating_sub(2 * dirlen);

        let header_a = Self::read_header(&file, skip)?;
        let footer_a = Self::read_header(&file, skip + dirlen - footer_len())?;
        let header_b = Self::read_header(&file, skip + dirlen)?;
        let footer_b = Self::read_header(&file, skip + 2 * dirlen - footer_len())?;

        let chosen = StripeHeaderFooter::recover((&header_a, &footer_a), (&header_b, &footer_b))
            .ok_or(Error::Cache(CacheError::DirBad))?
            .clone();

        let copy_a_chosen = chosen.sync_serial == header_a.sync_serial && header_a.magic == crate::header::STRIPE_MAGIC;
        let dir_offset = skip + if copy_a_chosen { header_len(segments) } else { dirlen + header_len(segments) };
        let body_len = (total_buckets as u64) * 4 * crate::dir::SIZEOF_DIR as u64;

        let mut dir_bytes = vec![0_u8; body_len as usize];
        aio.read_at(&file, dir_offset, &mut dir_bytes)?;
        let directory = Self::decode_directory(&dir_bytes, total_buckets)?;

        let mut stripe = Self {
            path,
            file,
            skip,
            dirlen,
            data_start,
            data_len,
            inner: Mutex::new(StripeInner {
                header: chosen,
                directory,
                lookaside: Lookaside::new(),
                agg: AggregationBuffer::new(),
                preservation: PreservationTable::new(),
                open_dir: OpenDir::new(),
                stats: StripeStats {
                    direntries_total: (total_buckets * 4) as u64,
                    ..StripeStats::default()
                },
            }),
            ram_cache: Box::new(crate::ram_cache::QuickRamCache::init(ram_cache_bytes)),
            aio,
            next_vc_id: AtomicU64::new(1),
        };

        stripe.recover_data_scan()?;
        Ok(stripe)
    }

    fn read_header(file: &File, offset: u64) -> Result<StripeHeaderFooter> {
        let mut buf = vec![0_u8; STORE_BLOCK_SIZE as usize];
        crate::aio::SyncFileAio.read_at(file, offset, &mut buf)?;
        Ok(StripeHeaderFooter::decode_from(&mut buf.as_slice())?)
    }

    fn decode_directory(bytes: &[u8], total_buckets: usize) -> Result<Directory> {
        let mut directory = Directory::new(total_buckets);
        let mut cursor = bytes;
        for segment in directory.segments_mut() {
            for entry in segment.entries_mut() {
                *entry = DirEntry::decode_from(&mut cursor)?;
            }
        }
        Ok(directory)
    }

    /// Step 4/5 of recovery: scan forward in 8 MiB chunks from
    /// `last_write_pos` for documents whose `sync_serial` matches the
    /// committed generation, tracking the highest serial observed, then
    /// clears directory entries in the resulting uncertain window.
    /// Replays every fragment written since the last durable directory
    /// sync: each fragment still carries its own `sync_serial`/
    /// `write_serial` in its header, so the scan can walk forward
    /// block-by-block and re-derive the directory entries that a crash
    /// never got to persist, the same way `recover_data_scan`'s
    /// real-world counterpart rebuilds the in-RAM directory from the
    /// on-disk write log rather than trusting the last synced copy.
    fn recover_data_scan(&mut self) -> Result<()> {
        const SCAN_CHUNK: u64 = 8 * 1024 * 1024;
        let (write_pos, sync_serial, data_len, phase) = {
            let inner = self.inner.get_mut().expect("stripe mutex poisoned");
            (
                inner.header.last_write_pos,
                inner.header.sync_serial,
                self.data_len,
                inner.header.phase,
            )
        };

        let mut cursor = write_pos;
        let mut last_write_serial = sync_serial;
        let mut recover_pos = write_pos;
        let mut recovered = Vec::new();

        while cursor < data_len {
            let chunk_len = SCAN_CHUNK.min(data_len - cursor);
            let mut buf = vec![0_u8; chunk_len as usize];
            if self
                .aio
                .read_at(&self.file, self.data_start + cursor, &mut buf)
                .is_err()
            {
                break;
            }

            let Ok(doc) = Doc::decode_from(&mut buf.as_slice()) else {
                break;
            };
            if doc.magic != crate::doc::DOC_MAGIC || doc.sync_serial < sync_serial {
                break;
            }
            last_write_serial = last_write_serial.max(doc.write_serial);
            recovered.push((doc.key, cursor / CACHE_BLOCK_SIZE, doc.len, doc.first_key, doc.pinned != 0));
            recover_pos = cursor + u64::from(doc.len);
            cursor = recover_pos;
        }

        let inner = self.inner.get_mut().expect("stripe mutex poisoned");
        inner.header.write_serial = last_write_serial;
        inner.header.write_pos = recover_pos;
        inner.header.last_write_pos = recover_pos;
        let start_block = write_pos / CACHE_BLOCK_SIZE;
        let end_block = recover_pos / CACHE_BLOCK_SIZE;
        inner.directory.clear_range(start_block, end_block);

        for (key, block, len, first_key, pinned) in recovered {
            let mut dir = DirEntry::empty();
            dir.set_offset(block);
            dir.set_approx_size(u64::from(len));
            dir.set_head(true);
            dir.set_phase(phase);
            dir.set_pinned(pinned);
            // no writer can be mid-flight at recovery time (the
            // open-directory table starts empty on every `open`), but
            // the same suppression check as `agg_write` is applied
            // here too so the two insert paths stay in lockstep.
            let suppressed = inner
                .open_dir
                .get(&first_key)
                .is_some_and(|entry| entry.dont_update_directory);
            if !suppressed {
                inner.directory.insert(&key, dir);
                inner.stats.direntries_used += 1;
                inner.stats.bytes_used += u64::from(len);
            }
        }
        Ok(())
    }

    fn sync_both_copies(&self) -> Result<()> {
        let segments = self.inner.lock().expect("stripe mutex poisoned").directory.segments().len();
        let header_bytes = {
            let inner = self.inner.lock().expect("stripe mutex poisoned");
            inner.header.encode_into_vec()?
        };
        let dir_bytes = {
            let inner = self.inner.lock().expect("stripe mutex poisoned");
            let mut out = Vec::new();
            for segment in inner.directory.segments() {
                for entry in segment.entries() {
                    entry.encode_into(&mut out)?;
                }
            }
            out
        };

        let header_region_len = header_len(segments);
        for copy in 0..2_u64 {
            let base = self.skip + copy * self.dirlen;
            self.aio.write_at(&self.file, base, &header_bytes)?;
            self.aio
                .write_at(&self.file, base + header_region_len, &dir_bytes)?;
            self.aio
                .write_at(&self.file, base + self.dirlen - footer_len(), &header_bytes)?;
        }
        Ok(())
    }

    /// This stripe's backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A snapshot of this stripe's counters.
    #[must_use]
    pub fn stats(&self) -> StripeStats {
        self.inner.lock().expect("stripe mutex poisoned").stats
    }

    /// Mints a fresh id to identify a new virtual connection against
    /// this stripe.
    pub fn allocate_vc_id(&self) -> VcId {
        self.next_vc_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Looks up `key`'s directory entry, preferring an in-flight
    /// evacuation's rewritten location over whatever the main directory
    /// holds, and validating phase/window for whatever is found.
    pub fn probe(&self, key: &CacheKey) -> Option<DirEntry> {
        self.probe_hit(key, None).map(|hit| hit.entry)
    }

    /// Like [`Stripe::probe`] but exposes the raw hit (segment/index)
    /// so a caller can resume past it with `last_collision` on a
    /// `first_key` mismatch — the chain-collision retry from the
    /// open-read state machine.
    pub fn probe_hit(&self, key: &CacheKey, last_collision: Option<crate::dir::ProbeHit>) -> Option<crate::dir::ProbeHit> {
        let mut inner = self.inner.lock().expect("stripe mutex poisoned");
        if last_collision.is_none() {
            if let Some(dir) = inner.lookaside.get(key) {
                return Some(crate::dir::ProbeHit {
                    entry: *dir,
                    segment: usize::MAX,
                    index: usize::MAX,
                });
            }
        }

        let header = inner.header.clone();
        let buffer_pos = inner.agg.buffer_pos();
        inner.directory.probe(key, last_collision, |entry| {
            in_phase_committed(entry, &header, buffer_pos, CACHE_BLOCK_SIZE)
                || out_of_phase_safe(entry, &header, CACHE_BLOCK_SIZE)
        })
    }

    /// The RAM cache fronting this stripe's disk reads. Callers key
    /// lookups by the fragment's own content key (not `first_key`),
    /// matching the on-disk offset carried in the directory entry as
    /// `aux` so a relocated fragment never serves stale bytes.
    #[must_use]
    pub fn ram_cache(&self) -> &dyn RamCache {
        self.ram_cache.as_ref()
    }

    /// Reads the fragment at `dir` from the in-flight aggregation
    /// buffer if it hasn't reached disk yet, otherwise from disk. Does
    /// not consult the RAM cache — callers that know the fragment's
    /// content key should check [`Stripe::ram_cache`] first.
    pub fn read_fragment(&self, dir: DirEntry) -> Result<Doc> {
        let offset = vol_offset(&dir, CACHE_BLOCK_SIZE);

        let doc = {
            let mut inner = self.inner.lock().expect("stripe mutex poisoned");
            let header = inner.header.clone();
            let buffer_pos = inner.agg.buffer_pos();
            if in_aggregation_window(offset, &header, buffer_pos) {
                let start = (offset - header.write_pos) as usize;
                let len = dir.approx_size() as usize;
                let end = (start + len).min(inner.agg.filled().len());
                Doc::decode_from(&mut &inner.agg.filled()[start..end])?
            } else {
                drop(inner);
                let len = dir.approx_size() as usize;
                let mut buf = vec![0_u8; len];
                match self.aio.read_at(&self.file, self.data_start + offset, &mut buf) {
                    Ok(()) => {
                        let doc = Doc::decode_from(&mut buf.as_slice())?;
                        self.inner.lock().expect("stripe mutex poisoned").stats.read_success += 1;
                        doc
                    }
                    Err(e) => {
                        self.inner.lock().expect("stripe mutex poisoned").stats.read_failure += 1;
                        return Err(e);
                    }
                }
            }
        };

        if doc.magic != crate::doc::DOC_MAGIC {
            return Err(Error::Cache(CacheError::BadMetaData));
        }
        Ok(doc)
    }

    /// Registers interest in preserving `dir` across the write head
    /// (multi-fragment read in progress).
    pub fn acquire_reader(&self, dir: DirEntry) {
        self.inner.lock().expect("stripe mutex poisoned").preservation.acquire(dir);
    }

    /// Releases a previously [`Stripe::acquire_reader`]-registered
    /// interest in the fragment at `offset_blocks`.
    pub fn release_reader(&self, offset_blocks: u64) {
        self.inner
            .lock()
            .expect("stripe mutex poisoned")
            .preservation
            .release_reader(offset_blocks * CACHE_BLOCK_SIZE);
    }

    /// Enqueues a fragment write. Non-evacuator writers are subject to
    /// the aggregation backlog limit.
    pub fn add_writer(
        &self,
        key: CacheKey,
        doc: Doc,
        sync: bool,
        evacuator: bool,
        backlog_threshold: u64,
    ) -> Result<()> {
        {
            let inner = self.inner.lock().expect("stripe mutex poisoned");
            if !evacuator && inner.agg.bytes_pending_aggregation() > backlog_threshold {
                return Err(Error::Cache(CacheError::WriteFail));
            }
        }

        let write_serial = {
            let mut inner = self.inner.lock().expect("stripe mutex poisoned");
            let serial = inner.header.write_serial;
            inner.agg.push_writer(PendingWrite {
                key,
                doc,
                sync,
                write_serial: serial,
                evacuator,
            });
            serial
        };
        let _ = write_serial;
        self.agg_write()
    }

    /// Walks the directory for every committed `head ∧ pinned` entry
    /// whose offset falls in `[window_start, window_end)` and forces it
    /// into the preservation table, so `evac_range` rewrites it ahead of
    /// being overwritten by the advancing write head — the periodic
    /// scan over pinned documents `aggWrite` runs every cycle.
    fn scan_pinned_window(&self, window_start: u64, window_end: u64) {
        let mut inner = self.inner.lock().expect("stripe mutex poisoned");
        let header = inner.header.clone();
        let buffer_pos = inner.agg.buffer_pos();
        let mut hits = Vec::new();
        for segment in inner.directory.segments() {
            for entry in segment.entries() {
                if entry.is_empty() || !entry.head() || !entry.pinned() {
                    continue;
                }
                let offset = vol_offset(entry, CACHE_BLOCK_SIZE);
                if offset < window_start || offset >= window_end {
                    continue;
                }
                if in_phase_committed(entry, &header, buffer_pos, CACHE_BLOCK_SIZE)
                    || out_of_phase_safe(entry, &header, CACHE_BLOCK_SIZE)
                {
                    hits.push(*entry);
                }
            }
        }
        for entry in hits {
            inner.preservation.force_evacuate_head(entry);
        }
    }

    /// Schedules the next not-yet-scheduled preserved fragment whose
    /// offset falls in the upcoming write window for rewrite: reads it
    /// from disk and pushes it onto the pending-writers queue ahead of
    /// regular writers, exactly as a regular evacuator write.
    fn evac_range(&self) -> Result<()> {
        let (window_start, window_end) = {
            let inner = self.inner.lock().expect("stripe mutex poisoned");
            (
                inner.header.write_pos,
                inner.header.write_pos + inner.agg.buffer_pos() + EVACUATION_SIZE,
            )
        };

        self.scan_pinned_window(window_start, window_end);

        let block = {
            let mut inner = self.inner.lock().expect("stripe mutex poisoned");
            inner.preservation.next_in_window(window_start, window_end)
        };
        let Some(block) = block else {
            return Ok(());
        };

        let doc = self.read_fragment(block.dir)?;
        let mut inner = self.inner.lock().expect("stripe mutex poisoned");
        inner.agg.push_writer(PendingWrite {
            key: doc.key,
            doc,
            sync: false,
            write_serial: inner.header.write_serial,
            evacuator: true,
        });
        Ok(())
    }

    /// The aggregation writer's main control loop: drains the pending
    /// FIFO into the batch buffer, schedules evacuation reads for the
    /// upcoming write window, and submits one sequential write for the
    /// whole batch once it's worth flushing.
    pub fn agg_write(&self) -> Result<()> {
        loop {
            let window_remaining = {
                let inner = self.inner.lock().expect("stripe mutex poisoned");
                self.data_len.saturating_sub(inner.header.write_pos)
            };

            self.evac_range()?;

            let drained = {
                let mut inner = self.inner.lock().expect("stripe mutex poisoned");
                inner.agg.drain(window_remaining)?
            };

            if drained.is_empty() {
                let should_wrap = {
                    let inner = self.inner.lock().expect("stripe mutex poisoned");
                    inner.agg.buffer_pos() == 0 && inner.agg.has_pending() && window_remaining == 0
                };
                if should_wrap {
                    self.agg_wrap()?;
                    continue;
                }
                break;
            }

            for write in &drained {
                let block_offset = (self.inner.lock().expect("stripe mutex poisoned").header.write_pos
                    + write.relative_offset)
                    / CACHE_BLOCK_SIZE;
                let mut dir = DirEntry::empty();
                dir.set_offset(block_offset);
                dir.set_approx_size(u64::from(write.doc_len));
                dir.set_head(true);
                dir.set_phase(self.inner.lock().expect("stripe mutex poisoned").header.phase);
                dir.set_pinned(write.pinned);

                let mut inner = self.inner.lock().expect("stripe mutex poisoned");
                // a concurrent `remove` may have pinned this writer's
                // open-directory entry to stop its stale write from
                // resurrecting the object it just deleted.
                let suppressed = inner
                    .open_dir
                    .get(&write.first_key)
                    .is_some_and(|entry| entry.dont_update_directory);
                if !suppressed {
                    inner.directory.insert(&write.key, dir);
                    inner.stats.direntries_used += 1;
                    inner.stats.bytes_used += u64::from(write.doc_len);
                }
                inner.stats.write_success += 1;
            }

            let should_flush = {
                let inner = self.inner.lock().expect("stripe mutex poisoned");
                inner.agg.is_high_watermark() || !inner.agg.has_pending()
            };
            if !should_flush {
                continue;
            }

            self.flush_batch()?;

            if !self.inner.lock().expect("stripe mutex poisoned").agg.has_pending() {
                break;
            }
        }
        Ok(())
    }

    fn flush_batch(&self) -> Result<()> {
        let (write_pos, bytes) = {
            let inner = self.inner.lock().expect("stripe mutex poisoned");
            (inner.header.write_pos, inner.agg.filled().to_vec())
        };
        if bytes.is_empty() {
            return Ok(());
        }

        self.aio.write_at(&self.file, self.data_start + write_pos, &bytes)?;

        let mut inner = self.inner.lock().expect("stripe mutex poisoned");
        inner.header.last_write_pos = write_pos;
        inner.header.write_pos += bytes.len() as u64;
        inner.header.write_serial += 1;
        inner.agg.reset();
        Ok(())
    }

    /// Wraps the write cursor back to the start of the data area,
    /// flips the phase, and runs a full preservation scan so entries
    /// from the generation about to be overwritten get a chance to be
    /// rewritten first.
    pub fn agg_wrap(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("stripe mutex poisoned");
        inner.header.write_pos = 0;
        inner.header.phase = !inner.header.phase;
        inner.header.cycle += 1;
        let write_pos = inner.header.write_pos;
        inner.preservation.periodic_scan(write_pos);
        Ok(())
    }

    /// Removes `first_key`'s directory entry, if present.
    pub fn remove(&self, first_key: &CacheKey) -> Result<bool> {
        let mut last_collision: Option<crate::dir::ProbeHit> = None;

        loop {
            let hit = {
                let mut inner = self.inner.lock().expect("stripe mutex poisoned");
                let header = inner.header.clone();
                let buffer_pos = inner.agg.buffer_pos();
                inner.directory.probe(first_key, last_collision, |entry| {
                    in_phase_committed(entry, &header, buffer_pos, CACHE_BLOCK_SIZE)
                        || out_of_phase_safe(entry, &header, CACHE_BLOCK_SIZE)
                })
            };
            let Some(hit) = hit else {
                return Ok(false);
            };

            // a chain-bucket hit only confirms a tag match; a real
            // collision needs the fragment's own stored key checked
            // before deleting the wrong colliding entry.
            if hit.segment != usize::MAX {
                match self.read_fragment(hit.entry) {
                    Ok(doc) if doc.first_key != *first_key => {
                        last_collision = Some(hit);
                        continue;
                    }
                    Err(_) => {
                        last_collision = Some(hit);
                        continue;
                    }
                    Ok(_) => {}
                }
            }

            let mut inner = self.inner.lock().expect("stripe mutex poisoned");
            let removed = inner.directory.delete(first_key, &hit.entry);
            if removed {
                inner.stats.direntries_used = inner.stats.direntries_used.saturating_sub(1);
            }
            return Ok(removed);
        }
    }

    /// Registers `vc` as a writer for `first_key`, failing with
    /// `ECACHE_DOC_BUSY` unless `allow_if_writers` permits joining an
    /// already-open object (bounded by `max_writers`).
    pub fn open_write(&self, first_key: CacheKey, vc: VcId, allow_if_writers: bool, max_writers: usize) -> Result<()> {
        self.inner
            .lock()
            .expect("stripe mutex poisoned")
            .open_dir
            .open_write(first_key, vc, allow_if_writers, max_writers)
            .map_err(|()| Error::Cache(CacheError::DocBusy))
    }

    /// Deregisters `vc` as a writer for `first_key`.
    pub fn close_write(&self, first_key: &CacheKey, vc: VcId) {
        self.inner
            .lock()
            .expect("stripe mutex poisoned")
            .open_dir
            .close_write(first_key, vc);
    }

    /// Whether `first_key` currently has an open writer.
    pub fn has_active_writer(&self, first_key: &CacheKey) -> bool {
        self.inner
            .lock()
            .expect("stripe mutex poisoned")
            .open_dir
            .get(first_key)
            .is_some_and(crate::open_dir::OpenDirEntry::has_writers)
    }

    /// If `first_key` has an active writer, flags its open-directory
    /// entry so that writer's eventual directory insert is suppressed
    /// — used by `remove` to stop a stale entry resurrecting after a
    /// concurrent delete. Returns whether a writer was found to pin.
    pub fn pin_active_writer(&self, first_key: &CacheKey) -> bool {
        let mut inner = self.inner.lock().expect("stripe mutex poisoned");
        match inner.open_dir.get_mut(first_key) {
            Some(entry) if entry.has_writers() => {
                entry.dont_update_directory = true;
                true
            }
            _ => false,
        }
    }

    /// Snapshot of every durable `head=true` directory entry, the
    /// stand-in for the scanner's precomputed volume map: instead of
    /// walking raw 128 KiB blocks looking for entries whose offset
    /// falls in them, this walks the directory directly for the same
    /// set of records (every head entry currently safe to read).
    #[must_use]
    pub fn head_entries(&self) -> Vec<DirEntry> {
        let inner = self.inner.lock().expect("stripe mutex poisoned");
        let header = inner.header.clone();
        let buffer_pos = inner.agg.buffer_pos();
        let mut out = Vec::new();
        for segment in inner.directory.segments() {
            for entry in segment.entries() {
                if entry.is_empty() || !entry.head() {
                    continue;
                }
                if in_phase_committed(entry, &header, buffer_pos, CACHE_BLOCK_SIZE)
                    || out_of_phase_safe(entry, &header, CACHE_BLOCK_SIZE)
                {
                    out.push(*entry);
                }
            }
        }
        out
    }

    /// Queues `reader` to be retried once `first_key`'s active write
    /// completes, rather than failing immediately — the read-while-writer
    /// wait path.
    pub fn add_delayed_reader(&self, first_key: &CacheKey, reader: VcId) {
        self.inner
            .lock()
            .expect("stripe mutex poisoned")
            .open_dir
            .add_delayed_reader(first_key, reader);
    }

    /// Drops `reader` from `first_key`'s delayed-reader queue.
    pub fn remove_delayed_reader(&self, first_key: &CacheKey, reader: VcId) {
        self.inner
            .lock()
            .expect("stripe mutex poisoned")
            .open_dir
            .remove_delayed_reader(first_key, reader);
    }

    /// Whether `first_key`'s in-flight writer has been told to skip
    /// its directory insert (a concurrent `remove` won the race).
    #[must_use]
    pub fn has_dont_update_directory(&self, first_key: &CacheKey) -> bool {
        self.inner
            .lock()
            .expect("stripe mutex poisoned")
            .open_dir
            .get(first_key)
            .is_some_and(|entry| entry.dont_update_directory)
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
