// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Marks a well-formed stripe header/footer block.
pub const STRIPE_MAGIC: u32 = 0xF1D0_F00D;

/// `STORE_BLOCK_SIZE`: the rounding quantum for header/footer regions.
pub const STORE_BLOCK_SIZE: u64 = 8192;

/// Header (and, written identically, footer) of one directory copy
/// (A or B). A copy is only trusted once its header and footer agree
/// on `sync_serial` (see [`StripeHeaderFooter::is_valid_pair`]); between
/// two valid copies recovery picks the one with the greater serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeHeaderFooter {
    /// [`STRIPE_MAGIC`] for a well-formed block.
    pub magic: u32,
    /// Major version of the header/footer wire format.
    pub version_major: u8,
    /// Minor version of the header/footer wire format.
    pub version_minor: u8,
    /// unix seconds
    pub create_time: u64,
    /// Current write-head offset within the stripe's data area.
    pub write_pos: u64,
    /// Write-head offset as of the previous committed copy.
    pub last_write_pos: u64,
    /// Offset of the in-progress aggregation batch.
    pub agg_pos: u64,
    /// Bumped each time the stripe is re-initialized, invalidating
    /// directory entries from an earlier generation.
    pub generation: u32,
    /// Current half of the circular write cycle.
    pub phase: bool,
    /// Number of times the write head has wrapped around the stripe.
    pub cycle: u32,
    /// Commit serial distinguishing this copy from its sibling; the
    /// higher serial wins at recovery.
    pub sync_serial: u32,
    /// Monotonic write counter at the time this copy was committed.
    pub write_serial: u32,
    /// Set between a header write and its matching footer write; a
    /// copy found dirty on recovery is untrusted.
    pub dirty: bool,
    /// Device sector size this stripe was formatted for.
    pub sector_size: u32,
    /// one freelist head index per segment
    pub freelist: Vec<u16>,
}

impl StripeHeaderFooter {
    /// A freshly formatted header/footer for a stripe with `segments`
    /// directory segments.
    #[must_use]
    pub fn new(create_time: u64, sector_size: u32, segments: usize) -> Self {
        Self {
            magic: STRIPE_MAGIC,
            version_major: 1,
            version_minor: 0,
            create_time,
            write_pos: 0,
            last_write_pos: 0,
            agg_pos: 0,
            generation: 0,
            phase: false,
            cycle: 0,
            sync_serial: 0,
            write_serial: 0,
            dirty: false,
            sector_size,
            freelist: vec![0; segments],
        }
    }

    /// A header/footer pair is trustworthy only when both copies agree
    /// on `sync_serial` and both carry the expected magic.
    #[must_use]
    pub fn is_valid_pair(header: &Self, footer: &Self) -> bool {
        header.magic == STRIPE_MAGIC
            && footer.magic == STRIPE_MAGIC
            && header.sync_serial == footer.sync_serial
    }

    /// Picks the recovery copy between two candidate (header, footer)
    /// pairs: the one whose pair is internally consistent wins; if both
    /// are consistent the higher `sync_serial` wins.
    #[must_use]
    pub fn recover<'a>(
        a: (&'a Self, &'a Self),
        b: (&'a Self, &'a Self),
    ) -> Option<&'a Self> {
        // This assumes ordered completion within one submitted write: the
        // header and footer of a copy are written in the same aio batch,
        // so if the footer magic/serial is intact the header is too. A
        // storage layer that reorders writes across unrelated sectors
        // within one async op could violate that and is out of scope.
        let a_valid = Self::is_valid_pair(a.0, a.1);
        let b_valid = Self::is_valid_pair(b.0, b.1);

        match (a_valid, b_valid) {
            (true, true) => {
                if a.0.sync_serial >= b.0.sync_serial {
                    Some(a.0)
                } else {
                    Some(b.0)
                }
            }
            (true, false) => Some(a.0),
            (false, true) => Some(b.0),
            (false, false) => None,
        }
    }
}

impl Encode for StripeHeaderFooter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.magic)?;
        writer.write_u8(self.version_major)?;
        writer.write_u8(self.version_minor)?;
        writer.write_u64::<BigEndian>(self.create_time)?;
        writer.write_u64::<BigEndian>(self.write_pos)?;
        writer.write_u64::<BigEndian>(self.last_write_pos)?;
        writer.write_u64::<BigEndian>(self.agg_pos)?;
        writer.write_u32::<BigEndian>(self.generation)?;
        writer.write_u8(u8::from(self.phase))?;
        writer.write_u32::<BigEndian>(self.cycle)?;
        writer.write_u32::<BigEndian>(self.sync_serial)?;
        writer.write_u32::<BigEndian>(self.write_serial)?;
        writer.write_u8(u8::from(self.dirty))?;
        writer.write_u32::<BigEndian>(self.sector_size)?;
        writer.write_u32::<BigEndian>(self.freelist.len() as u32)?;
        for head in &self.freelist {
            writer.write_u16::<BigEndian>(*head)?;
        }
        Ok(())
    }
}

impl Decode for StripeHeaderFooter {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let magic = reader.read_u32::<BigEndian>()?;
        let version_major = reader.read_u8()?;
        let version_minor = reader.read_u8()?;
        let create_time = reader.read_u64::<BigEndian>()?;
        let write_pos = reader.read_u64::<BigEndian>()?;
        let last_write_pos = reader.read_u64::<BigEndian>()?;
        let agg_pos = reader.read_u64::<BigEndian>()?;
        let generation = reader.read_u32::<BigEndian>()?;
        let phase = reader.read_u8()? != 0;
        let cycle = reader.read_u32::<BigEndian>()?;
        let sync_serial = reader.read_u32::<BigEndian>()?;
        let write_serial = reader.read_u32::<BigEndian>()?;
        let dirty = reader.read_u8()? != 0;
        let sector_size = reader.read_u32::<BigEndian>()?;
        let freelist_len = reader.read_u32::<BigEndian>()?;
        let mut freelist = Vec::with_capacity(freelist_len as usize);
        for _ in 0..freelist_len {
            freelist.push(reader.read_u16::<BigEndian>()?);
        }

        Ok(Self {
            magic,
            version_major,
            version_minor,
            create_time,
            write_pos,
            last_write_pos,
            agg_pos,
            generation,
            phase,
            cycle,
            sync_serial,
            write_serial,
            dirty,
            sector_size,
            freelist,
        })
    }
}

/// `round_up(len, STORE_BLOCK_SIZE)`
#[must_use]
pub fn round_to_store_block(len: u64) -> u64 {
    len.div_ceil(STORE_BLOCK_SIZE) * STORE_BLOCK_SIZE
}

// Fixed fields: magic+vmaj+vmin+create+write_pos+last_write_pos+agg_pos
// +generation+phase+cycle+sync_serial+write_serial+dirty+sector_size+freelist_len
const FIXED_HEADER_LEN: u64 = 4 + 1 + 1 + 8 + 8 + 8 + 8 + 4 + 1 + 4 + 4 + 4 + 1 + 4 + 4;

/// `headerlen = round_up(sizeof(StripeHeaderFooter) + 2*(segments-1), STORE_BLOCK_SIZE)`
#[must_use]
pub fn header_len(segments: usize) -> u64 {
    let variable = 2 * segments.saturating_sub(1) as u64;
    round_to_store_block(FIXED_HEADER_LEN + variable)
}

/// `footer_len = round_up(sizeof(StripeHeaderFooter), STORE_BLOCK_SIZE)`, the
/// footer carries no freelist so it never has the variable tail.
#[must_use]
pub fn footer_len() -> u64 {
    round_to_store_block(FIXED_HEADER_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn encode_decode_roundtrip() -> crate::Result<()> {
        let mut header = StripeHeaderFooter::new(1_700_000_000, 512, 3);
        header.write_pos = 4096;
        header.sync_serial = 7;
        header.freelist = vec![1, 2, 3];
        let bytes = header.encode_into_vec()?;
        let decoded = StripeHeaderFooter::decode_from(&mut bytes.as_slice())?;
        assert_eq!(decoded, header);
        Ok(())
    }

    #[test]
    fn valid_pair_requires_matching_serial() {
        let header = StripeHeaderFooter::new(0, 512, 1);
        let mut footer = header.clone();
        assert!(StripeHeaderFooter::is_valid_pair(&header, &footer));
        footer.sync_serial = 1;
        assert!(!StripeHeaderFooter::is_valid_pair(&header, &footer));
    }

    #[test]
    fn recover_picks_higher_serial_among_valid_copies() {
        let mut a_header = StripeHeaderFooter::new(0, 512, 1);
        a_header.sync_serial = 3;
        let a_footer = a_header.clone();

        let mut b_header = StripeHeaderFooter::new(0, 512, 1);
        b_header.sync_serial = 5;
        let b_footer = b_header.clone();

        let picked = StripeHeaderFooter::recover((&a_header, &a_footer), (&b_header, &b_footer))
            .expect("one copy valid");
        assert_eq!(picked.sync_serial, 5);
    }

    #[test]
    fn recover_falls_back_to_the_only_valid_copy() {
        let a_header = StripeHeaderFooter::new(0, 512, 1);
        let mut a_footer = a_header.clone();
        a_footer.sync_serial = 99; // corrupt: disagrees with header

        let b_header = StripeHeaderFooter::new(0, 512, 1);
        let b_footer = b_header.clone();

        let picked = StripeHeaderFooter::recover((&a_header, &a_footer), (&b_header, &b_footer))
            .expect("b is valid");
        assert_eq!(picked.sync_serial, b_header.sync_serial);
    }

    #[test]
    fn recover_returns_none_when_both_copies_invalid() {
        let a_header = StripeHeaderFooter::new(0, 512, 1);
        let mut a_footer = a_header.clone();
        a_footer.sync_serial = 1;

        let b_header = StripeHeaderFooter::new(0, 512, 1);
        let mut b_footer = b_header.clone();
        b_footer.sync_serial = 2;

        assert!(StripeHeaderFooter::recover((&a_header, &a_footer), (&b_header, &b_footer)).is_none());
    }
}
