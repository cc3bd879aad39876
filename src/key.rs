// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use std::io::{Read, Write};

/// A 128-bit content key identifying a cached object (and, for an
/// alternate, one particular fragment of it).
///
/// Stored and compared as 16 raw bytes; [`CacheKey::slice32`] exposes it
/// as four big-endian `u32` words for directory tag/hash extraction, the
/// same decomposition the directory index probes against.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct CacheKey([u8; 16]);

impl CacheKey {
    /// Builds a key from raw bytes (e.g. the output of a content hash).
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The underlying 16 bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Word `i` (`0..4`) as a big-endian `u32`, mirroring the `slice32`
    /// accessor the directory index uses to pull bucket/tag bits out of
    /// the key without hashing it again.
    #[must_use]
    pub fn slice32(&self, i: usize) -> u32 {
        let start = i * 4;
        u32::from_be_bytes(self.0[start..start + 4].try_into().expect("4 bytes"))
    }

    /// `slice32(0)`, the word most directory buckets hash on.
    #[must_use]
    pub fn word0(&self) -> u32 {
        self.slice32(0)
    }

    /// `first_key` of a document is the requested object key itself —
    /// it's what every alternate's vector fragment is probed under.
    #[must_use]
    pub fn first_key(object_key: &CacheKey) -> Self {
        *object_key
    }

    /// Derives an `earliest_key` for a fresh alternate from a seed
    /// (caller-supplied randomness, e.g. two `u8`s off a thread-local
    /// generator). `first_key` and `earliest_key` must not share a
    /// directory tag (the low 12 bits of word 2) or the directory
    /// can't tell the alternate's first fragment apart from the
    /// object's own vector entry, so the two low bytes are folded
    /// through [`CacheKey::next`] until the tags diverge — the same
    /// loop the writer runs with `rand_CacheKey` before committing to
    /// a key.
    #[must_use]
    pub fn earliest_key(first_key: &CacheKey, seed: (u8, u8)) -> Self {
        let mut bytes = [0_u8; 16];
        bytes[0] = seed.0;
        bytes[1] = seed.1;
        let mut candidate = Self(bytes);
        while dir_tag(candidate.slice32(2)) == dir_tag(first_key.slice32(2)) {
            candidate = candidate.next();
        }
        candidate
    }

    /// Deterministic successor key, used to derive each subsequent
    /// fragment's key from the previous one within one alternate.
    ///
    /// This is the fixed 256-entry permutation table algorithm: each
    /// output byte is looked up in [`NEXT_TABLE`], seeded by the
    /// previous output byte plus the corresponding input byte. It must
    /// match [`CacheKey::prev`] exactly (`prev(next(k)) == k`) since
    /// fragment chain walks run in both directions during recovery and
    /// evacuation.
    #[must_use]
    pub fn next(&self) -> Self {
        let key = &self.0;
        let mut out = [0_u8; 16];
        out[0] = NEXT_TABLE[key[0] as usize];
        for i in 1..16 {
            out[i] = NEXT_TABLE[(out[i - 1].wrapping_add(key[i])) as usize];
        }
        Self(out)
    }

    /// Inverse of [`CacheKey::next`].
    #[must_use]
    pub fn prev(&self) -> Self {
        let key = &self.0;
        let mut out = [0_u8; 16];
        for i in (1..16).rev() {
            out[i] = (256 + PREV_TABLE[key[i] as usize] as u16 - key[i - 1] as u16) as u8;
        }
        out[0] = PREV_TABLE[key[0] as usize];
        Self(out)
    }

    /// A fresh, effectively-random key (used for dummy/internal
    /// documents such as preservation placeholders). Bytes beyond the
    /// first two are left zeroed; callers that need full entropy should
    /// fill `bytes` themselves via [`CacheKey::from_bytes`] and an RNG.
    #[must_use]
    pub fn rand(b0: u8, b1: u8) -> Self {
        let mut bytes = [0_u8; 16];
        bytes[0] = b0;
        bytes[1] = b1;
        Self(bytes)
    }
}

impl Encode for CacheKey {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&self.0)?;
        Ok(())
    }
}

impl Decode for CacheKey {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut bytes = [0_u8; 16];
        reader.read_exact(&mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Width, in bits, of the directory tag carried in a directory entry's
/// third word. Shared with `dir`, which stores exactly this many bits
/// per entry.
pub(crate) const DIR_TAG_WIDTH: u32 = 12;

/// The low `DIR_TAG_WIDTH` bits of a key word, as stored in a directory
/// entry.
pub(crate) fn dir_tag(word: u32) -> u32 {
    word & ((1 << DIR_TAG_WIDTH) - 1)
}

// permutation table
#[rustfmt::skip]
const NEXT_TABLE: [u8; 256] = [
    21,  53,  167, 51,  255, 126, 241, 151, 115, 66,  155, 174, 226, 215, 80,  188, 12,  95,  8,   24,  162, 201, 46,  104, 79,  172,
    39,  68,  56,  144, 142, 217, 101, 62,  14,  108, 120, 90,  61,  47,  132, 199, 110, 166, 83,  125, 57,  65,  19,  130, 148, 116,
    228, 189, 170, 1,   71,  0,   252, 184, 168, 177, 88,  229, 242, 237, 183, 55,  13,  212, 240, 81,  211, 74,  195, 205, 147, 93,
    30,  87,  86,  63,  135, 102, 233, 106, 118, 163, 107, 10,  243, 136, 160, 119, 43,  161, 206, 141, 203, 78,  175, 36,  37,  140,
    224, 197, 185, 196, 248, 84,  122, 73,  152, 157, 18,  225, 219, 145, 45,  2,   171, 249, 173, 32,  143, 137, 69,  41,  35,  89,
    33,  98,  179, 214, 114, 231, 251, 123, 180, 194, 29,  3,   178, 31,  192, 164, 15,  234, 26,  230, 91,  156, 5,   16,  23,  244,
    58,  50,  4,   67,  134, 165, 60,  235, 250, 7,   138, 216, 49,  139, 191, 154, 11,  52,  239, 59,  111, 245, 9,   64,  25,  129,
    247, 232, 190, 246, 109, 22,  112, 210, 221, 181, 92,  169, 48,  100, 193, 77,  103, 133, 70,  220, 207, 223, 176, 204, 76,  186,
    200, 208, 158, 182, 227, 222, 131, 38,  187, 238, 6,   34,  253, 128, 146, 44,  94,  127, 105, 153, 113, 20,  27,  124, 159, 17,
    72,  218, 96,  149, 213, 42,  28,  254, 202, 40,  117, 82,  97,  209, 54,  236, 121, 75,  85,  150, 99,  198,
];

// permutation table
#[rustfmt::skip]
const PREV_TABLE: [u8; 256] = [
    57,  55,  119, 141, 158, 152, 218, 165, 18,  178, 89,  172, 16,  68,  34,  146, 153, 233, 114, 48,  229, 0,   187, 154, 19,  180,
    148, 230, 240, 140, 78,  143, 123, 130, 219, 128, 101, 102, 215, 26,  243, 127, 239, 94,  223, 118, 22,  39,  194, 168, 157, 3,
    173, 1,   248, 67,  28,  46,  156, 175, 162, 38,  33,  81,  179, 47,  9,   159, 27,  126, 200, 56,  234, 111, 73,  251, 206, 197,
    99,  24,  14,  71,  245, 44,  109, 252, 80,  79,  62,  129, 37,  150, 192, 77,  224, 17,  236, 246, 131, 254, 195, 32,  83,  198,
    23,  226, 85,  88,  35,  186, 42,  176, 188, 228, 134, 8,   51,  244, 86,  93,  36,  250, 110, 137, 231, 45,  5,   225, 221, 181,
    49,  214, 40,  199, 160, 82,  91,  125, 166, 169, 103, 97,  30,  124, 29,  117, 222, 76,  50,  237, 253, 7,   112, 227, 171, 10,
    151, 113, 210, 232, 92,  95,  20,  87,  145, 161, 43,  2,   60,  193, 54,  120, 25,  122, 11,  100, 204, 61,  142, 132, 138, 191,
    211, 66,  59,  106, 207, 216, 15,  53,  184, 170, 144, 196, 139, 74,  107, 105, 255, 41,  208, 21,  242, 98,  205, 75,  96,  202,
    209, 247, 189, 72,  69,  238, 133, 13,  167, 31,  235, 116, 201, 190, 213, 203, 104, 115, 12,  212, 52,  63,  149, 135, 183, 84,
    147, 163, 249, 65,  217, 174, 70,  6,   64,  90,  155, 177, 185, 182, 108, 121, 164, 136, 58,  220, 241, 4,
];

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn next_prev_roundtrip() {
        let key = CacheKey::from_bytes([
            1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16,
        ]);
        let next = key.next();
        assert_eq!(next.prev(), key);
    }

    #[test]
    fn next_prev_roundtrip_zero() {
        let key = CacheKey::default();
        assert_eq!(key.next().prev(), key);
    }

    #[test]
    fn first_key_is_object_key() {
        let object_key = CacheKey::from_bytes([9; 16]);
        assert_eq!(CacheKey::first_key(&object_key), object_key);
    }

    #[test]
    fn earliest_key_never_shares_first_keys_dir_tag() {
        let first = CacheKey::from_bytes([9; 16]);
        let earliest = CacheKey::earliest_key(&first, (1, 2));
        assert_ne!(
            dir_tag(earliest.slice32(2)),
            dir_tag(first.slice32(2))
        );
    }

    #[test]
    fn slice32_reads_big_endian_words() {
        let key = CacheKey::from_bytes([
            0x00, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ]);
        assert_eq!(key.slice32(0), 1);
    }

    #[test]
    fn encode_decode_roundtrip() -> crate::Result<()> {
        let key = CacheKey::from_bytes([7; 16]);
        let bytes = key.encode_into_vec()?;
        let decoded = CacheKey::decode_from(&mut bytes.as_slice())?;
        assert_eq!(key, decoded);
        Ok(())
    }
}
