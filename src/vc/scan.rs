// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{doc::Doc, stripe::Stripe, Result};

/// Bounds how many times `scanObject` retries a document whose writer
/// lock is held before giving up on that one record and moving on.
const MAX_WRITER_LOCK_RETRIES: u32 = 5;

/// Callback return codes for one scanned document, mirroring the
/// alternate-vector edit decisions a scan client can make.
#[derive(Debug, Clone)]
pub enum ScanAction {
    /// Leave the record untouched, move to the next one.
    Continue,
    /// Remove this object.
    Delete,
    /// Remove every alternate of this object (equivalent to `Delete`
    /// here, since this engine keeps one record per `first_key` rather
    /// than a full alternate vector).
    DeleteAllAlternates,
    /// Replace the object's content with `Doc`, written back at close.
    Update(Box<Doc>),
}

/// Summary counters for a completed `scanStripe` pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanStats {
    /// Head records visited and handed to the callback.
    pub visited: usize,
    /// Objects removed via [`ScanAction::Delete`] or
    /// [`ScanAction::DeleteAllAlternates`].
    pub deleted: usize,
    /// Objects rewritten via [`ScanAction::Update`].
    pub updated: usize,
    /// Records skipped because an active writer held them through every
    /// retry.
    pub skipped_busy: usize,
}

/// Runs `scanStripe`/`scanObject` over every durable head record in
/// `stripe`, invoking `callback` once per document and applying its
/// [`ScanAction`]. A record whose object has an active writer is
/// retried up to [`MAX_WRITER_LOCK_RETRIES`] times before being
/// skipped for this pass.
pub fn scan_stripe(stripe: &Stripe, mut callback: impl FnMut(&Doc) -> ScanAction) -> Result<ScanStats> {
    let mut stats = ScanStats::default();

    for entry in stripe.head_entries() {
        let doc = match stripe.read_fragment(entry) {
            Ok(doc) => doc,
            Err(_) => continue,
        };

        let mut busy = stripe.has_active_writer(&doc.first_key);
        for _ in 0..MAX_WRITER_LOCK_RETRIES {
            if !busy {
                break;
            }
            std::thread::sleep(super::MUTEX_RETRY_DELAY);
            busy = stripe.has_active_writer(&doc.first_key);
        }
        if busy {
            stats.skipped_busy += 1;
            continue;
        }

        stats.visited += 1;
        match callback(&doc) {
            ScanAction::Continue => {}
            ScanAction::Delete | ScanAction::DeleteAllAlternates => {
                if stripe.remove(&doc.first_key)? {
                    stats.deleted += 1;
                }
            }
            ScanAction::Update(replacement) => {
                stripe.add_writer(doc.first_key, *replacement, false, false, u64::MAX)?;
                stats.updated += 1;
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{aio::SyncFileAio, key::CacheKey};
    use test_log::test;

    fn new_stripe(dir: &tempfile::TempDir) -> Stripe {
        let path = dir.path().join("stripe.bin");
        Stripe::create(path, 0, 8 * 1024 * 1024, 256, 1024 * 1024, std::sync::Arc::new(SyncFileAio))
            .expect("create stripe")
    }

    fn write_object(stripe: &Stripe, id: u8) {
        let key = CacheKey::from_bytes([id; 16]);
        let doc = Doc::new(key, key, 3, 0, 0, 0, vec![], b"abc".to_vec(), true);
        stripe.add_writer(key, doc, false, false, 64 * 1024 * 1024).expect("write");
    }

    #[test]
    fn deletes_even_indexed_objects() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stripe = new_stripe(&dir);
        for id in 1..=6_u8 {
            write_object(&stripe, id);
        }

        let stats = scan_stripe(&stripe, |doc| {
            if doc.first_key.as_bytes()[0] % 2 == 0 {
                ScanAction::Delete
            } else {
                ScanAction::Continue
            }
        })?;

        assert_eq!(stats.visited, 6);
        assert_eq!(stats.deleted, 3);

        for id in 1..=6_u8 {
            let key = CacheKey::from_bytes([id; 16]);
            assert_eq!(stripe.probe(&key).is_some(), id % 2 != 0);
        }
        Ok(())
    }

    #[test]
    fn empty_stripe_scans_to_zero_visits() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stripe = new_stripe(&dir);
        let stats = scan_stripe(&stripe, |_| ScanAction::Continue)?;
        assert_eq!(stats.visited, 0);
        Ok(())
    }
}
