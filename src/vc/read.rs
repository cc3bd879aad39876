// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    aggregate::vol_offset,
    coding::{Decode, Encode},
    dir::{DirEntry, ProbeHit, CACHE_BLOCK_SIZE},
    doc::Doc,
    key::CacheKey,
    open_dir::VcId,
    ram_cache::RamCacheLookup,
    stripe::Stripe,
    CacheError, Error, Result,
};
use std::time::{Duration, Instant};

/// Wall-clock budget a `read_while_writer` read spends retrying before
/// giving up and reporting a miss, bounding a stuck or abandoned writer.
const READ_WHILE_WRITER_BUDGET: Duration = Duration::from_secs(5);

/// Outcome of a completed open-read: the fully reassembled payload
/// (every fragment of the requested alternate concatenated in order)
/// plus the caller-supplied header bytes carried by the first fragment.
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// Caller-supplied header bytes carried by the first fragment.
    pub header: Vec<u8>,
    /// Fully reassembled object payload.
    pub data: Vec<u8>,
}

/// Upper bound on fragments walked for one object before assuming a
/// corrupt `key.next()` cycle and bailing.
const MAX_FRAGMENT_CHAIN: u32 = 10_000;

/// Runs the open-read state machine (`openReadStartHead` →
/// `openReadMain` → `openReadClose`) to completion against `stripe` for
/// `key`.
///
/// Collision handling: if a probed entry's document doesn't actually
/// carry `key` as its `first_key`, the probe resumes past that hit
/// (`last_collision`) and tries the next chain slot, bounded by the
/// directory's own chain-walk cap.
///
/// Read-while-writer: if the first probe misses and `read_while_writer`
/// is enabled and a writer is currently open on `key`, this registers
/// `vc` as a delayed reader on the object's open-directory entry and
/// retries every `retry_delay` until the writer's fragments land (or
/// the writer closes and the object becomes readable), up to
/// [`READ_WHILE_WRITER_BUDGET`]. The delayed-reader registration is
/// always dropped before returning, on every exit path.
pub fn open_read(stripe: &Stripe, key: &CacheKey, vc: VcId, read_while_writer: bool, retry_delay: Duration) -> Result<ReadResult> {
    let mut last_collision: Option<ProbeHit> = None;
    let mut registered = false;
    let deadline = Instant::now() + READ_WHILE_WRITER_BUDGET;

    let result = loop {
        let Some(hit) = stripe.probe_hit(key, last_collision) else {
            if read_while_writer && stripe.has_active_writer(key) && Instant::now() < deadline {
                if !registered {
                    stripe.add_delayed_reader(key, vc);
                    registered = true;
                }
                std::thread::sleep(retry_delay);
                continue;
            }
            break Err(Error::Cache(CacheError::NoDoc));
        };

        let doc = match fetch_fragment(stripe, key, hit.entry) {
            Ok(doc) => doc,
            Err(err) => break Err(err),
        };

        if doc.first_key != *key {
            // hash collision on this chain slot: resume past it, unless
            // the hit came from the lookaside table (sentinel index),
            // which isn't part of the directory chain and can't be
            // resumed past.
            if hit.segment == usize::MAX {
                break Err(Error::Cache(CacheError::NoDoc));
            }
            last_collision = Some(hit);
            continue;
        }

        break read_chain(stripe, key, doc);
    };

    if registered {
        stripe.remove_delayed_reader(key, vc);
    }
    result
}

/// Reads one fragment known to hold content key `key`, checking the RAM
/// cache first (keyed by the fragment's own content key and on-disk
/// offset, so a relocated fragment never serves stale bytes) and
/// populating it on a miss.
fn fetch_fragment(stripe: &Stripe, key: &CacheKey, dir: DirEntry) -> Result<Doc> {
    let offset = vol_offset(&dir, CACHE_BLOCK_SIZE);

    if let RamCacheLookup::HitUncompressed(bytes) = stripe.ram_cache().get(key, offset) {
        if let Ok(doc) = Doc::decode_from(&mut bytes.as_slice()) {
            return Ok(doc);
        }
    }

    let doc = stripe.read_fragment(dir)?;
    if let Ok(bytes) = doc.encode_into_vec() {
        stripe.ram_cache().put(*key, bytes, false, offset);
    }
    Ok(doc)
}

/// Walks the fragment chain starting at the already-read head fragment
/// `head`, following `key → key.next()`, concatenating payloads until
/// `total_len` bytes have been collected. Fragments still pending
/// aggregation or mid-evacuation are held live via `acquire_reader`/
/// `release_reader` for the span of this single read.
///
/// `head.key` itself names the chain's first data fragment (the
/// vector/head record's own content key is meaningless beyond
/// self-identification for single-fragment objects, where this loop
/// never runs); every subsequent hop is `fragment.key.next()`.
fn read_chain(stripe: &Stripe, first_key: &CacheKey, head: Doc) -> Result<ReadResult> {
    let header = head.header.clone();
    let total_len = head.total_len;

    let mut data = head.data.clone();
    let mut next_key = head.key;
    let mut guard = 0_u32;

    while (data.len() as u64) < total_len {
        guard += 1;
        if guard > MAX_FRAGMENT_CHAIN {
            return Err(Error::Cache(CacheError::BadMetaData));
        }

        let Some(hit) = stripe.probe_hit(&next_key, None) else {
            return Err(Error::Cache(CacheError::BadMetaData));
        };

        stripe.acquire_reader(hit.entry);
        let fragment = fetch_fragment(stripe, &next_key, hit.entry);
        stripe.release_reader(hit.entry.offset());
        let fragment = fragment?;

        if fragment.first_key != *first_key {
            return Err(Error::Cache(CacheError::BadMetaData));
        }

        data.extend_from_slice(&fragment.data);
        next_key = fragment.key.next();
    }

    data.truncate(total_len as usize);
    Ok(ReadResult { header, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::SyncFileAio;
    use test_log::test;

    fn new_stripe(dir: &tempfile::TempDir) -> Stripe {
        let path = dir.path().join("stripe.bin");
        Stripe::create(path, 0, 8 * 1024 * 1024, 256, 1024 * 1024, std::sync::Arc::new(SyncFileAio))
            .expect("create stripe")
    }

    #[test]
    fn reads_single_fragment_object() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stripe = new_stripe(&dir);
        let key = CacheKey::from_bytes([5; 16]);

        let doc = Doc::new(key, key, 5, 0, 0, 0, b"hdr".to_vec(), b"hello".to_vec(), true);
        stripe.add_writer(key, doc, false, false, 64 * 1024 * 1024)?;

        let vc = stripe.allocate_vc_id();
        let result = open_read(&stripe, &key, vc, false, Duration::from_millis(1))?;
        assert_eq!(result.data, b"hello");
        assert_eq!(result.header, b"hdr");
        Ok(())
    }

    #[test]
    fn second_read_is_served_from_the_ram_cache() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stripe = new_stripe(&dir);
        let key = CacheKey::from_bytes([7; 16]);

        let doc = Doc::new(key, key, 4, 0, 0, 0, vec![], b"data".to_vec(), true);
        stripe.add_writer(key, doc, false, false, 64 * 1024 * 1024)?;

        let vc = stripe.allocate_vc_id();
        let _ = open_read(&stripe, &key, vc, false, Duration::from_millis(1))?;
        let offset = stripe.probe(&key).expect("just written").offset() * crate::dir::CACHE_BLOCK_SIZE;
        assert!(matches!(stripe.ram_cache().get(&key, offset), RamCacheLookup::HitUncompressed(_)));

        let result = open_read(&stripe, &key, vc, false, Duration::from_millis(1))?;
        assert_eq!(result.data, b"data");
        Ok(())
    }

    #[test]
    fn missing_key_returns_no_doc() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stripe = new_stripe(&dir);
        let key = CacheKey::from_bytes([6; 16]);
        let vc = stripe.allocate_vc_id();

        let err = open_read(&stripe, &key, vc, false, Duration::from_millis(1)).expect_err("should miss");
        assert!(matches!(err, Error::Cache(CacheError::NoDoc)));
    }

    /// The actual S4 scenario: a reader arrives while a writer is still
    /// open on the same key (no directory entry yet), registers as a
    /// delayed reader, and observes the object once a second thread
    /// closes the writer out from under it — proving the retry loop and
    /// `add_delayed_reader`/`remove_delayed_reader` wiring actually
    /// serve a concurrent write rather than just failing fast.
    #[test]
    fn delayed_reader_observes_the_object_once_the_writer_closes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stripe = std::sync::Arc::new(new_stripe(&dir));
        let key = CacheKey::from_bytes([8; 16]);

        let writer_vc = stripe.allocate_vc_id();
        stripe.open_write(key, writer_vc, false, 0)?;
        assert!(stripe.has_active_writer(&key));

        let writer_stripe = std::sync::Arc::clone(&stripe);
        let writer_key = key;
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let doc = Doc::new(writer_key, writer_key, 3, 0, 0, 0, vec![], b"abc".to_vec(), true);
            writer_stripe.add_writer(writer_key, doc, false, false, 64 * 1024 * 1024).expect("add_writer");
            writer_stripe.close_write(&writer_key, writer_vc);
        });

        let reader_vc = stripe.allocate_vc_id();
        let result = open_read(&stripe, &key, reader_vc, true, Duration::from_millis(5))?;
        assert_eq!(result.data, b"abc");

        writer.join().expect("writer thread panicked");
        Ok(())
    }
}
