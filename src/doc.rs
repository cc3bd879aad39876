// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    key::CacheKey,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Marks a well-formed fragment header.
pub const DOC_MAGIC: u32 = 0x5F12_9B13;

/// Written over a fragment's magic once it has been logically deleted
/// in place (directory entry removed, bytes left on disk until the
/// write head or evacuation overwrites them).
pub const DOC_CORRUPT: u32 = 0xDEAD_BABE;

/// Checksum value meaning "not computed" (checksums disabled via
/// [`crate::config::EngineConfig::checksums`]).
pub const DOC_NO_CHECKSUM: u32 = 0xA0B0_C0D0;

/// Fixed-size portion of a fragment record, the part everything else
/// (`hdr`, `data`) is appended after. Kept as a plain struct rather than
/// reading the fields lazily, since every fragment header is read in
/// full on every directory-guided disk read anyway.
#[derive(Debug, Clone)]
pub struct Doc {
    /// [`DOC_MAGIC`] for a well-formed fragment, [`DOC_CORRUPT`] once
    /// logically deleted in place.
    pub magic: u32,
    /// length of this fragment, including the fixed header and `hlen`, unrounded
    pub len: u32,
    /// total length of the document this fragment belongs to
    pub total_len: u64,
    /// first key of the object (shared by every alternate/fragment)
    pub first_key: CacheKey,
    /// key of this specific fragment
    pub key: CacheKey,
    /// length of the caller-supplied header bytes that follow this struct
    pub hlen: u32,
    /// Caller-assigned document type tag, opaque to this engine.
    pub doc_type: u8,
    /// Major version of the fragment wire format that wrote this record.
    pub v_major: u8,
    /// Minor version of the fragment wire format that wrote this record.
    pub v_minor: u8,
    /// Aggregation-write generation this fragment was committed under.
    pub sync_serial: u32,
    /// Monotonic write counter distinguishing successive writes to the
    /// same directory slot.
    pub write_serial: u32,
    /// pin-until timestamp (unix seconds), 0 if not pinned
    pub pinned: u32,
    /// Fragment checksum, or [`DOC_NO_CHECKSUM`] when disabled.
    pub checksum: u32,
    /// caller-supplied header bytes (`hlen` long)
    pub header: Vec<u8>,
    /// fragment payload bytes
    pub data: Vec<u8>,
}

/// Size of the fixed portion of a [`Doc`] on disk, not counting `header`/`data`.
pub const DOC_FIXED_LEN: u32 = 4 + 4 + 8 + 16 + 16 + 4 + 1 + 1 + 1 + 1 + 4 + 4 + 4 + 4;

impl Doc {
    /// Builds a fragment record and fills in `len`/`checksum`.
    #[must_use]
    pub fn new(
        first_key: CacheKey,
        key: CacheKey,
        total_len: u64,
        doc_type: u8,
        sync_serial: u32,
        write_serial: u32,
        header: Vec<u8>,
        data: Vec<u8>,
        compute_checksum: bool,
    ) -> Self {
        let hlen = header.len() as u32;
        let len = DOC_FIXED_LEN + hlen + data.len() as u32;

        let mut doc = Self {
            magic: DOC_MAGIC,
            len,
            total_len,
            first_key,
            key,
            hlen,
            doc_type,
            v_major: 1,
            v_minor: 0,
            sync_serial,
            write_serial,
            pinned: 0,
            checksum: DOC_NO_CHECKSUM,
            header,
            data,
        };

        if compute_checksum {
            doc.checksum = doc.calculate_checksum();
        }

        doc
    }

    /// Total length of `header` + `data` as actually stored.
    #[must_use]
    pub fn data_len(&self) -> u32 {
        self.len - DOC_FIXED_LEN - self.hlen
    }

    /// True if this fragment carries the whole document (no further
    /// fragments were needed).
    #[must_use]
    pub fn is_single_fragment(&self) -> bool {
        u64::from(self.data_len()) == self.total_len
    }

    /// Recomputes the checksum over `header` + `data` using `xxh3`,
    /// the same non-cryptographic hash already used elsewhere in this
    /// crate for segment/manifest integrity checks. Diverges
    /// intentionally from the byte-sum the format this is derived from
    /// used; this crate treats that as an implementation detail of the
    /// checksum, not part of its on-disk contract.
    #[must_use]
    pub fn calculate_checksum(&self) -> u32 {
        let mut hasher = xxhash_rust::xxh3::Xxh3::new();
        hasher.update(&self.header);
        hasher.update(&self.data);
        hasher.digest() as u32
    }

    /// Marks the fragment pinned until `pinned_until` (unix seconds).
    pub fn pin(&mut self, pinned_until: u32) {
        self.pinned = pinned_until;
    }

    /// Clears the pin, making this fragment evictable again.
    pub fn unpin(&mut self) {
        self.pinned = 0;
    }

    /// Returns `true` if this fragment's stored checksum (when checksums
    /// are in use) matches its recomputed value.
    #[must_use]
    pub fn checksum_valid(&self) -> bool {
        self.checksum == DOC_NO_CHECKSUM || self.checksum == self.calculate_checksum()
    }
}

impl Encode for Doc {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.magic)?;
        writer.write_u32::<BigEndian>(self.len)?;
        writer.write_u64::<BigEndian>(self.total_len)?;
        self.first_key
            .encode_into(writer)
            .map_err(|_| EncodeError::Io(std::io::Error::other("key encode failed")))?;
        self.key
            .encode_into(writer)
            .map_err(|_| EncodeError::Io(std::io::Error::other("key encode failed")))?;
        writer.write_u32::<BigEndian>(self.hlen)?;
        writer.write_u8(self.doc_type)?;
        writer.write_u8(self.v_major)?;
        writer.write_u8(self.v_minor)?;
        writer.write_u8(0)?; // unused
        writer.write_u32::<BigEndian>(self.sync_serial)?;
        writer.write_u32::<BigEndian>(self.write_serial)?;
        writer.write_u32::<BigEndian>(self.pinned)?;
        writer.write_u32::<BigEndian>(self.checksum)?;
        writer.write_all(&self.header)?;
        writer.write_all(&self.data)?;
        Ok(())
    }
}

impl Decode for Doc {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let magic = reader.read_u32::<BigEndian>()?;
        if magic != DOC_MAGIC {
            return Err(DecodeError::InvalidHeader("doc magic"));
        }
        let len = reader.read_u32::<BigEndian>()?;
        let total_len = reader.read_u64::<BigEndian>()?;
        let first_key = CacheKey::decode_from(reader)?;
        let key = CacheKey::decode_from(reader)?;
        let hlen = reader.read_u32::<BigEndian>()?;
        let doc_type = reader.read_u8()?;
        let v_major = reader.read_u8()?;
        let v_minor = reader.read_u8()?;
        let _unused = reader.read_u8()?;
        let sync_serial = reader.read_u32::<BigEndian>()?;
        let write_serial = reader.read_u32::<BigEndian>()?;
        let pinned = reader.read_u32::<BigEndian>()?;
        let checksum = reader.read_u32::<BigEndian>()?;

        let data_len = len
            .checked_sub(DOC_FIXED_LEN)
            .and_then(|v| v.checked_sub(hlen))
            .ok_or(DecodeError::InvalidHeader("doc len"))?;

        let mut header = vec![0_u8; hlen as usize];
        reader.read_exact(&mut header)?;
        let mut data = vec![0_u8; data_len as usize];
        reader.read_exact(&mut data)?;

        Ok(Self {
            magic,
            len,
            total_len,
            first_key,
            key,
            hlen,
            doc_type,
            v_major,
            v_minor,
            sync_serial,
            write_serial,
            pinned,
            checksum,
            header,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn sample_doc() -> Doc {
        let first_key = CacheKey::from_bytes([1; 16]);
        let key = CacheKey::from_bytes([2; 16]);
        Doc::new(
            first_key,
            key,
            11,
            0,
            7,
            8,
            b"hdr".to_vec(),
            b"hello world".to_vec(),
            true,
        )
    }

    #[test]
    fn single_fragment_when_data_covers_total_len() {
        let doc = sample_doc();
        assert!(doc.is_single_fragment());
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut doc = sample_doc();
        assert!(doc.checksum_valid());
        doc.data[0] ^= 0xFF;
        assert!(!doc.checksum_valid());
    }

    #[test]
    fn checksum_disabled_is_always_valid() {
        let mut doc = sample_doc();
        doc.checksum = DOC_NO_CHECKSUM;
        doc.data[0] ^= 0xFF;
        assert!(doc.checksum_valid());
    }

    #[test]
    fn encode_decode_roundtrip() -> crate::Result<()> {
        let doc = sample_doc();
        let bytes = doc.encode_into_vec()?;
        let decoded = Doc::decode_from(&mut bytes.as_slice())?;
        assert_eq!(decoded.first_key, doc.first_key);
        assert_eq!(decoded.key, doc.key);
        assert_eq!(decoded.header, doc.header);
        assert_eq!(decoded.data, doc.data);
        assert_eq!(decoded.checksum, doc.checksum);
        Ok(())
    }

    #[test]
    fn pin_and_unpin() {
        let mut doc = sample_doc();
        doc.pin(1234);
        assert_eq!(doc.pinned, 1234);
        doc.unpin();
        assert_eq!(doc.pinned, 0);
    }
}
