// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    dir::DirEntry,
    doc::{Doc, DOC_FIXED_LEN},
    key::CacheKey,
    open_dir::VcId,
    stripe::Stripe,
    CacheError, Error, Result,
};

/// Largest a single fragment's payload may be, leaving room for the
/// fixed record header within one 4 MiB aggregation buffer.
pub const MAX_FRAGMENT_SIZE: u64 = 4 * 1024 * 1024 - DOC_FIXED_LEN as u64;

/// Everything `open_write` needs to fragment, enqueue and commit one
/// object. Mirrors the options an `open_write` client call carries
/// (`sync`, `allow_if_writers`, fragment-size tuning).
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// Content key of the object's first (or only) fragment.
    pub first_key: CacheKey,
    /// Caller-supplied header bytes carried by the first fragment.
    pub header: Vec<u8>,
    /// Object payload, fragmented as needed by `target_fragment_size`.
    pub data: Vec<u8>,
    /// Wait for this write to reach the sync queue before returning.
    pub sync: bool,
    /// Allow a second concurrent writer on the same key instead of
    /// failing with `ECACHE_DOC_BUSY`.
    pub allow_if_writers: bool,
    /// Upper bound on concurrent writers when `allow_if_writers` is set.
    pub max_writers: usize,
    /// Maximum bytes of payload per on-disk fragment.
    pub target_fragment_size: u64,
    /// Aggregation-buffer backlog, in bytes, above which this write
    /// blocks rather than growing the buffer further.
    pub backlog_threshold: u64,
    /// Whether to compute and store a checksum for each fragment.
    pub checksums: bool,
    /// Pin-until timestamp (unix seconds) to store on the object's head
    /// fragment; `0` leaves the object unpinned.
    pub pin_until: u32,
}

/// Runs the open-write state machine
/// (`openWriteStartBegin` → `openWriteMain` → `openWriteWriteDone` → …
/// → `openWriteCloseDir`) to completion for one object: joins (or
/// creates) the open-directory entry, cuts `req.data` into fragments at
/// `target_fragment_size`, enqueues each on the stripe's aggregation
/// writer, and on success commits the final vector/head record that
/// `first_key` resolves to.
///
/// On any failure after the open-directory entry was created, the entry
/// is always released before returning — the close path always runs,
/// matching `openWriteCloseDir`'s unconditional cleanup.
pub fn open_write(stripe: &Stripe, vc: VcId, req: WriteRequest) -> Result<DirEntry> {
    stripe.open_write(req.first_key, vc, req.allow_if_writers, req.max_writers)?;
    let result = write_fragments(stripe, &req);
    stripe.close_write(&req.first_key, vc);
    result
}

fn write_fragments(stripe: &Stripe, req: &WriteRequest) -> Result<DirEntry> {
    let target = req.target_fragment_size.clamp(1, MAX_FRAGMENT_SIZE);
    let sizes = cut_fragment_sizes(req.data.len() as u64, target);

    if sizes.len() <= 1 {
        let mut doc = Doc::new(
            req.first_key,
            req.first_key,
            req.data.len() as u64,
            0,
            0,
            0,
            req.header.clone(),
            req.data.clone(),
            req.checksums,
        );
        if req.pin_until != 0 {
            doc.pin(req.pin_until);
        }
        stripe.add_writer(req.first_key, doc, req.sync, false, req.backlog_threshold)?;
    } else {
        let seed = (req.first_key.slice32(0) as u8, req.first_key.slice32(1) as u8);
        let earliest_key = CacheKey::earliest_key(&req.first_key, seed);

        let mut fragment_key = earliest_key;
        let mut offset = 0_usize;
        for &size in &sizes {
            let chunk = req.data[offset..offset + size as usize].to_vec();
            offset += size as usize;

            let doc = Doc::new(
                req.first_key,
                fragment_key,
                req.data.len() as u64,
                0,
                0,
                0,
                Vec::new(),
                chunk,
                req.checksums,
            );
            stripe.add_writer(fragment_key, doc, req.sync, false, req.backlog_threshold)?;
            fragment_key = fragment_key.next();
        }

        // head/vector record: carries the caller's header bytes and
        // points readers at `earliest_key`; this is what `first_key`
        // resolves to.
        let mut head = Doc::new(
            req.first_key,
            earliest_key,
            req.data.len() as u64,
            1,
            0,
            0,
            req.header.clone(),
            Vec::new(),
            req.checksums,
        );
        if req.pin_until != 0 {
            head.pin(req.pin_until);
        }
        stripe.add_writer(req.first_key, head, req.sync, false, req.backlog_threshold)?;
    }

    stripe
        .probe(&req.first_key)
        .ok_or(Error::Cache(CacheError::WriteFail))
}

/// Splits `total_len` bytes into chunks of `target` bytes. The final
/// chunk is whatever remains once no more full `target`-sized chunks
/// fit within 125% of `target`, so the trailing fragment is never
/// smaller than 75% of a full one.
fn cut_fragment_sizes(total_len: u64, target: u64) -> Vec<u64> {
    if total_len == 0 {
        return vec![0];
    }
    if total_len <= target + target / 4 {
        return vec![total_len];
    }

    let mut sizes = Vec::new();
    let mut remaining = total_len;
    while remaining > target + target / 4 {
        sizes.push(target);
        remaining -= target;
    }
    sizes.push(remaining);
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{aio::SyncFileAio, vc::read::open_read};
    use test_log::test;

    fn new_stripe(dir: &tempfile::TempDir) -> Stripe {
        let path = dir.path().join("stripe.bin");
        Stripe::create(path, 0, 16 * 1024 * 1024, 256, 1024 * 1024, std::sync::Arc::new(SyncFileAio))
            .expect("create stripe")
    }

    fn base_request(first_key: CacheKey, header: Vec<u8>, data: Vec<u8>) -> WriteRequest {
        WriteRequest {
            first_key,
            header,
            data,
            sync: false,
            allow_if_writers: false,
            max_writers: 0,
            target_fragment_size: 128 * 1024,
            backlog_threshold: 64 * 1024 * 1024,
            checksums: true,
            pin_until: 0,
        }
    }

    #[test]
    fn single_fragment_object_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stripe = new_stripe(&dir);
        let key = CacheKey::from_bytes([1; 16]);
        let vc = stripe.allocate_vc_id();

        open_write(&stripe, vc, base_request(key, b"hdr".to_vec(), b"hello".to_vec()))?;

        let result = open_read(&stripe, &key, vc, false, std::time::Duration::from_millis(1))?;
        assert_eq!(result.data, b"hello");
        assert_eq!(result.header, b"hdr");
        Ok(())
    }

    #[test]
    fn multi_fragment_object_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stripe = new_stripe(&dir);
        let key = CacheKey::from_bytes([2; 16]);
        let vc = stripe.allocate_vc_id();

        let payload: Vec<u8> = (0..300_000_u32).map(|i| (i % 251) as u8).collect();
        let mut req = base_request(key, b"header-bytes".to_vec(), payload.clone());
        req.target_fragment_size = 64 * 1024;

        open_write(&stripe, vc, req)?;

        let result = open_read(&stripe, &key, vc, false, std::time::Duration::from_millis(1))?;
        assert_eq!(result.data, payload);
        assert_eq!(result.header, b"header-bytes");
        Ok(())
    }

    #[test]
    fn pin_until_marks_the_committed_directory_entry_pinned() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stripe = new_stripe(&dir);
        let key = CacheKey::from_bytes([9; 16]);
        let vc = stripe.allocate_vc_id();

        let mut req = base_request(key, b"hdr".to_vec(), b"hello".to_vec());
        req.pin_until = 1_700_000_000;
        open_write(&stripe, vc, req)?;

        let entry = stripe.probe(&key).expect("just written");
        assert!(entry.pinned());
        Ok(())
    }

    #[test]
    fn second_writer_without_allow_flag_is_busy() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stripe = new_stripe(&dir);
        let key = CacheKey::from_bytes([3; 16]);

        stripe.open_write(key, 1, false, 0)?;
        let vc = stripe.allocate_vc_id();
        let err = open_write(&stripe, vc, base_request(key, vec![], b"x".to_vec())).expect_err("should be busy");
        assert!(matches!(err, Error::Cache(CacheError::DocBusy)));
        stripe.close_write(&key, 1);
        Ok(())
    }

    #[test]
    fn fragment_cut_folds_small_remainder_into_final_chunk() {
        assert_eq!(cut_fragment_sizes(110, 100), vec![110]);
        assert_eq!(cut_fragment_sizes(180, 100), vec![100, 80]);
        assert_eq!(cut_fragment_sizes(250, 100), vec![100, 100, 50]);
    }
}
