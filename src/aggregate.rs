// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{coding::Encode, dir::DirEntry, doc::Doc, header::StripeHeaderFooter, key::CacheKey, Result};
use std::collections::VecDeque;

/// Page-aligned size of the aggregation write-back buffer.
pub const AGG_BUFFER_SIZE: u64 = 4 * 1024 * 1024;

/// Once `buffer_pos` reaches this, `aggWrite` will flush even without
/// sync pressure.
pub const HIGH_WATERMARK: u64 = 2 * 1024 * 1024;

/// One fragment queued to be copied into the aggregation buffer.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    /// Content key of the fragment being written.
    pub key: CacheKey,
    /// The fragment record itself.
    pub doc: Doc,
    /// this writer is waiting on the directory-sync queue for durability
    pub sync: bool,
    /// Write generation this fragment commits under.
    pub write_serial: u32,
    /// evacuator writes are pushed to the front of the FIFO
    pub evacuator: bool,
}

/// One fragment that was successfully copied into the buffer this
/// batch, with enough information for the caller to build its
/// directory entry once the batch is durable.
#[derive(Debug, Clone)]
pub struct DrainedWrite {
    /// Content key of the fragment that was written.
    pub key: CacheKey,
    /// First key of the object this fragment belongs to, used to check
    /// whether a concurrent `remove` has suppressed this write's
    /// directory insert.
    pub first_key: CacheKey,
    /// On-disk length of the written fragment record.
    pub doc_len: u32,
    /// Offset of the fragment within this batch, relative to the
    /// batch's base write position.
    pub relative_offset: u64,
    /// this writer was waiting on the directory-sync queue for durability
    pub sync: bool,
    /// Write generation this fragment committed under.
    pub write_serial: u32,
    /// this write came from the evacuator rather than a client writer
    pub evacuator: bool,
    /// whether the fragment record carries an active pin
    pub pinned: bool,
}

/// The 4 MiB write-coalescing buffer: a FIFO of pending fragment
/// writes, the in-progress batch buffer, and the running total of
/// bytes still queued (used for backlog/backpressure decisions).
#[derive(Debug)]
pub struct AggregationBuffer {
    buf: Vec<u8>,
    buffer_pos: u64,
    pending: VecDeque<PendingWrite>,
    bytes_pending_aggregation: u64,
}

impl Default for AggregationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregationBuffer {
    /// An empty buffer at the start of the write cycle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: vec![0_u8; AGG_BUFFER_SIZE as usize],
            buffer_pos: 0,
            pending: VecDeque::new(),
            bytes_pending_aggregation: 0,
        }
    }

    /// Bytes currently buffered, awaiting flush to disk.
    #[must_use]
    pub fn buffer_pos(&self) -> u64 {
        self.buffer_pos
    }

    /// Sum of payload bytes across all pending writes not yet flushed.
    #[must_use]
    pub fn bytes_pending_aggregation(&self) -> u64 {
        self.bytes_pending_aggregation
    }

    /// Whether the buffer has filled past [`HIGH_WATERMARK`] and should
    /// be flushed before accepting more writes.
    #[must_use]
    pub fn is_high_watermark(&self) -> bool {
        self.buffer_pos >= HIGH_WATERMARK
    }

    /// Whether any fragment is queued for the next flush.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Enqueues a fragment. Evacuator writes jump the queue so preserved
    /// fragments get copied into the next batch ahead of regular
    /// writers, per the preservation protocol.
    pub fn push_writer(&mut self, write: PendingWrite) {
        self.bytes_pending_aggregation += u64::from(write.doc.len);
        if write.evacuator {
            self.pending.push_front(write);
        } else {
            self.pending.push_back(write);
        }
    }

    /// Drains as many queued fragments as fit both in the 4 MiB buffer
    /// and within `window_remaining` bytes of the current write
    /// position, in FIFO order (evacuators having already jumped the
    /// queue on push). Stops at the first fragment that doesn't fit —
    /// it stays queued for the next batch.
    pub fn drain(&mut self, window_remaining: u64) -> Result<Vec<DrainedWrite>> {
        let mut drained = Vec::new();

        while let Some(next) = self.pending.front() {
            let encoded_len = u64::from(next.doc.len);
            if self.buffer_pos + encoded_len > AGG_BUFFER_SIZE {
                break;
            }
            if self.buffer_pos + encoded_len > window_remaining {
                break;
            }

            let write = self.pending.pop_front().expect("front just peeked");
            let mut bytes = Vec::with_capacity(encoded_len as usize);
            write.doc.encode_into(&mut bytes)?;

            let relative_offset = self.buffer_pos;
            let end = relative_offset as usize + bytes.len();
            self.buf[relative_offset as usize..end].copy_from_slice(&bytes);
            self.buffer_pos = end as u64;
            self.bytes_pending_aggregation -= encoded_len;

            drained.push(DrainedWrite {
                key: write.key,
                first_key: write.doc.first_key,
                doc_len: write.doc.len,
                relative_offset,
                sync: write.sync,
                write_serial: write.write_serial,
                evacuator: write.evacuator,
                pinned: write.doc.pinned != 0,
            });
        }

        Ok(drained)
    }

    /// The filled prefix of the batch buffer, ready to hand to the AIO
    /// dispatcher as one write.
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.buffer_pos as usize]
    }

    /// Resets the cursor after a completed (or aborted) batch write.
    pub fn reset(&mut self) {
        self.buffer_pos = 0;
    }

    /// Drops every still-queued fragment, returning them so the caller
    /// can fail their writers (used when a batch can't make any
    /// progress — "aggregation exceeds stripe size").
    pub fn drain_all_failed(&mut self) -> Vec<PendingWrite> {
        self.bytes_pending_aggregation = 0;
        self.pending.drain(..).collect()
    }
}

/// A directory entry's offset is stored as a block count
/// (`CACHE_BLOCK_SIZE` units); every comparison against header
/// positions (which are byte offsets) must go through this conversion.
#[must_use]
pub fn vol_offset(entry: &DirEntry, cache_block: u64) -> u64 {
    entry.offset() * cache_block
}

/// *In phase, not in aggregation window*: entry is from the current
/// generation and already committed (or about to be, within this
/// batch).
#[must_use]
pub fn in_phase_committed(
    entry: &DirEntry,
    header: &StripeHeaderFooter,
    buffer_pos: u64,
    cache_block: u64,
) -> bool {
    entry.phase() == header.phase && vol_offset(entry, cache_block) <= header.write_pos + buffer_pos
}

/// *Out of phase, safe to read*: entry is from the previous generation
/// and hasn't yet been overtaken by the new write head.
#[must_use]
pub fn out_of_phase_safe(entry: &DirEntry, header: &StripeHeaderFooter, cache_block: u64) -> bool {
    entry.phase() != header.phase && vol_offset(entry, cache_block).saturating_sub(cache_block) >= header.agg_pos
}

/// *In phase, data still only in the aggregation buffer*: the entry's
/// absolute byte offset lies within `[write_pos, write_pos+buffer_pos)`
/// and must be served from the in-memory buffer, not disk.
#[must_use]
pub fn in_aggregation_window(vol_offset: u64, header: &StripeHeaderFooter, buffer_pos: u64) -> bool {
    vol_offset >= header.write_pos && vol_offset < header.write_pos + buffer_pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn sample_write(evacuator: bool) -> PendingWrite {
        let doc = Doc::new(
            CacheKey::from_bytes([1; 16]),
            CacheKey::from_bytes([2; 16]),
            5,
            0,
            0,
            0,
            vec![],
            b"hello".to_vec(),
            true,
        );
        PendingWrite {
            key: doc.key,
            doc,
            sync: false,
            write_serial: 0,
            evacuator,
        }
    }

    #[test]
    fn evacuators_jump_the_queue() {
        let mut agg = AggregationBuffer::new();
        agg.push_writer(sample_write(false));
        agg.push_writer(sample_write(true));
        let drained = agg.drain(AGG_BUFFER_SIZE).expect("drain ok");
        assert_eq!(drained.len(), 2);
        assert!(drained[0].evacuator);
        assert!(!drained[1].evacuator);
    }

    #[test]
    fn drain_stops_when_window_is_full() {
        let mut agg = AggregationBuffer::new();
        let w = sample_write(false);
        let doc_len = u64::from(w.doc.len);
        agg.push_writer(w);
        let drained = agg.drain(doc_len - 1).expect("drain ok");
        assert!(drained.is_empty());
        assert!(agg.has_pending());
    }

    #[test]
    fn bytes_pending_decreases_as_writers_drain() {
        let mut agg = AggregationBuffer::new();
        agg.push_writer(sample_write(false));
        assert!(agg.bytes_pending_aggregation() > 0);
        agg.drain(AGG_BUFFER_SIZE).expect("drain ok");
        assert_eq!(agg.bytes_pending_aggregation(), 0);
    }

    #[test]
    fn reset_clears_cursor_but_not_queue() {
        let mut agg = AggregationBuffer::new();
        agg.push_writer(sample_write(false));
        agg.drain(AGG_BUFFER_SIZE).expect("drain ok");
        assert!(agg.buffer_pos() > 0);
        agg.reset();
        assert_eq!(agg.buffer_pos(), 0);
    }
}
