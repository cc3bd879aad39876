// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod directory;
mod lookaside;
mod segment;

pub use directory::{Directory, ProbeHit};
pub use lookaside::Lookaside;
pub use segment::Segment;

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    key::{dir_tag, DIR_TAG_WIDTH},
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// On-disk size of one directory entry.
pub const SIZEOF_DIR: usize = 10;

/// Block-size multiplier table: entry `big` selects one of four base
/// block sizes, `size` (6 bits) counts how many of that block size the
/// fragment rounds up to.
pub const CACHE_BLOCK_SIZE: u64 = 512;

/// Resolves a directory entry's `big` class to the actual block size
/// fragments in that class are rounded to.
#[must_use]
pub fn dir_block_size(big: u8) -> u64 {
    CACHE_BLOCK_SIZE << (3 * u32::from(big))
}

/// One directory entry: a bit-packed `[u16; 5]`, matching the on-disk
/// layout exactly (two bytes per word, little bit shuffling inside each
/// word) rather than a Rust bitfield struct, since the bit layout must
/// round-trip byte-for-byte with what's on disk.
///
/// Word layout:
/// - `w[0]`, low byte of `w[1]`, `w[4]`: 40-bit block offset
/// - high 2 bits of `w[1]`: `big` (block-size class)
/// - high 6 bits of `w[1]`: `size` (block count within that class)
/// - low 12 bits of `w[2]`: `tag` (key bits not implied by the bucket hash)
/// - bit 12 of `w[2]`: `phase`
/// - bit 13 of `w[2]`: `head` (first fragment of a document)
/// - bit 14 of `w[2]`: `pinned`
/// - bit 15 of `w[2]`: unused
/// - `w[3]`: `next` (in-segment freelist / collision-chain link)
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct DirEntry {
    w: [u16; 5],
}

impl DirEntry {
    /// A zeroed entry (offset 0 is never a valid data position).
    #[must_use]
    pub fn empty() -> Self {
        Self { w: [0; 5] }
    }

    /// Whether this slot holds no entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offset() == 0
    }

    /// Block offset this entry points to, in [`CACHE_BLOCK_SIZE`] units.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.w[0])
            | (u64::from(self.w[1] & 0xFF) << 16)
            | (u64::from(self.w[4]) << 24)
    }

    /// Sets the block offset (low 40 bits of `offset` are kept).
    pub fn set_offset(&mut self, offset: u64) {
        self.w[0] = offset as u16;
        self.w[1] = (((offset >> 16) & 0xFF) as u16) | (self.w[1] & 0xFF00);
        self.w[4] = (offset >> 24) as u16;
    }

    /// Block-size class (`0..4`); see [`dir_block_size`].
    #[must_use]
    pub fn big(&self) -> u8 {
        ((self.w[1] >> 8) & 0x3) as u8
    }

    /// Sets the block-size class.
    pub fn set_big(&mut self, big: u8) {
        self.w[1] = (self.w[1] & 0xFCFF) | ((u16::from(big) & 0x3) << 8);
    }

    /// Block count within this entry's `big` class, minus one.
    #[must_use]
    pub fn size(&self) -> u16 {
        self.w[1] >> 10
    }

    /// Sets the block count within this entry's `big` class.
    pub fn set_size(&mut self, size: u16) {
        self.w[1] = (self.w[1] & ((1 << 10) - 1)) | (size << 10);
    }

    /// Sets `big`/`size` to approximate `bytes` as the smallest block
    /// count in the smallest block-size class that covers it.
    pub fn set_approx_size(&mut self, bytes: u64) {
        for big in 0..4_u8 {
            let block = dir_block_size(big);
            let max_for_class = block * (1 << 6);
            if bytes <= max_for_class || big == 3 {
                self.set_big(big);
                self.set_size((((bytes.max(1) - 1) / block) as u16).min((1 << 6) - 1));
                return;
            }
        }
    }

    /// Approximate fragment size in bytes this entry covers (always
    /// `>=` the actual stored length).
    #[must_use]
    pub fn approx_size(&self) -> u64 {
        (u64::from(self.size()) + 1) * dir_block_size(self.big())
    }

    /// The key bits not implied by the bucket hash.
    #[must_use]
    pub fn tag(&self) -> u32 {
        dir_tag(u32::from(self.w[2]))
    }

    /// Sets the directory tag (low [`DIR_TAG_WIDTH`] bits of `tag`).
    pub fn set_tag(&mut self, tag: u32) {
        self.w[2] = (self.w[2] & !((1 << DIR_TAG_WIDTH) - 1) as u16)
            | (tag & ((1 << DIR_TAG_WIDTH) - 1)) as u16;
    }

    /// Which half of the circular write cycle this entry was written
    /// in; stale entries from the other phase are treated as invalid.
    #[must_use]
    pub fn phase(&self) -> bool {
        self.bit(2, 12)
    }

    /// Sets the write-cycle phase bit.
    pub fn set_phase(&mut self, v: bool) {
        self.set_bit(2, 12, v);
    }

    /// Whether this entry is a document's first fragment.
    #[must_use]
    pub fn head(&self) -> bool {
        self.bit(2, 13)
    }

    /// Sets the head bit.
    pub fn set_head(&mut self, v: bool) {
        self.set_bit(2, 13, v);
    }

    /// Whether this entry is pinned against eviction/evacuation.
    #[must_use]
    pub fn pinned(&self) -> bool {
        self.bit(2, 14)
    }

    /// Sets the pinned bit.
    pub fn set_pinned(&mut self, v: bool) {
        self.set_bit(2, 14, v);
    }

    /// In-segment freelist link, or collision-chain link once occupied.
    #[must_use]
    pub fn next(&self) -> u16 {
        self.w[3]
    }

    /// Sets the freelist/collision-chain link.
    pub fn set_next(&mut self, next: u16) {
        self.w[3] = next;
    }

    fn bit(&self, word: usize, b: u32) -> bool {
        ((u32::from(self.w[word]) >> b) & 1) != 0
    }

    fn set_bit(&mut self, word: usize, b: u32, v: bool) {
        let mask = 1_u16 << b;
        self.w[word] = (self.w[word] & !mask) | (if v { mask } else { 0 });
    }
}

impl Encode for DirEntry {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        for word in self.w {
            writer.write_u16::<BigEndian>(word)?;
        }
        Ok(())
    }
}

impl Decode for DirEntry {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut w = [0_u16; 5];
        for word in &mut w {
            *word = reader.read_u16::<BigEndian>()?;
        }
        Ok(Self { w })
    }
}
