// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{key::CacheKey, open_dir::VcId, stripe::Stripe, CacheError, Error, Result};

/// Single `removeEvent` transition: probes for `first_key`, confirms
/// the on-disk record's key actually matches (bounded retry past
/// collisions), deletes the directory entry, and — if a writer is
/// concurrently active on the same object — flags its open-directory
/// entry so the in-flight writer won't resurrect a stale entry once its
/// own write completes.
///
/// Returns `true` if an entry was removed, `false` if nothing was
/// cached under `first_key`.
pub fn remove(stripe: &Stripe, first_key: &CacheKey, removing_vc: VcId) -> Result<bool> {
    let removed = stripe.remove(first_key)?;
    stripe.pin_active_writer(first_key);
    let _ = removing_vc;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{aio::SyncFileAio, doc::Doc};
    use test_log::test;

    fn new_stripe(dir: &tempfile::TempDir) -> Stripe {
        let path = dir.path().join("stripe.bin");
        Stripe::create(path, 0, 8 * 1024 * 1024, 256, 1024 * 1024, std::sync::Arc::new(SyncFileAio))
            .expect("create stripe")
    }

    #[test]
    fn removes_existing_entry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stripe = new_stripe(&dir);
        let key = CacheKey::from_bytes([1; 16]);

        let doc = Doc::new(key, key, 3, 0, 0, 0, vec![], b"abc".to_vec(), true);
        stripe.add_writer(key, doc, false, false, 64 * 1024 * 1024)?;

        assert!(remove(&stripe, &key, 99)?);
        assert!(stripe.probe(&key).is_none());
        Ok(())
    }

    #[test]
    fn missing_entry_returns_false() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stripe = new_stripe(&dir);
        let key = CacheKey::from_bytes([2; 16]);

        assert!(!remove(&stripe, &key, 1)?);
        Ok(())
    }

    #[test]
    fn active_writer_is_pinned_against_resurrection() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stripe = new_stripe(&dir);
        let key = CacheKey::from_bytes([3; 16]);

        stripe.open_write(key, 1, false, 0)?;
        remove(&stripe, &key, 2)?;
        assert!(stripe.has_dont_update_directory(&key));
        stripe.close_write(&key, 1);
        Ok(())
    }

    /// The flag checked above is only useful if the writer's eventual
    /// directory insert actually honors it: a `remove` racing an
    /// in-flight writer for the same key must leave the object gone even
    /// after that writer's own fragments reach the aggregation writer.
    #[test]
    fn remove_winning_the_race_leaves_the_writer_unable_to_resurrect_the_object() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stripe = new_stripe(&dir);
        let key = CacheKey::from_bytes([4; 16]);

        stripe.open_write(key, 1, false, 0)?;
        remove(&stripe, &key, 2)?;

        let doc = Doc::new(key, key, 3, 0, 0, 0, vec![], b"abc".to_vec(), true);
        stripe.add_writer(key, doc, false, false, 64 * 1024 * 1024)?;
        stripe.close_write(&key, 1);

        assert!(stripe.probe(&key).is_none());
        Ok(())
    }
}
