// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Result;
use std::fs::File;
use std::sync::Mutex;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Submits positioned reads/writes against a stripe's backing file.
///
/// The engine never issues overlapping writes against the same stripe
/// (the aggregation writer serializes them), but may issue concurrent
/// reads against the same file descriptor, so implementations must be
/// safe to call from multiple threads at once.
pub trait AioDispatcher: Send + Sync {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, file: &File, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `data` starting at `offset`.
    fn write_at(&self, file: &File, offset: u64, data: &[u8]) -> Result<()>;
}

/// Reference dispatcher backed by positioned syscalls
/// (`pread`/`pwrite` on unix, seek-then-read/write elsewhere). No
/// internal queueing: each call runs synchronously on the caller's
/// thread, which is the simplest contract satisfying the "submit an
/// operation, the engine never overlaps writes" rule without a real
/// completion-callback runtime.
#[derive(Debug, Default)]
pub struct SyncFileAio;

impl AioDispatcher for SyncFileAio {
    #[cfg(unix)]
    fn read_at(&self, file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
        file.read_exact_at(buf, offset)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn read_at(&self, file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    #[cfg(unix)]
    fn write_at(&self, file: &File, offset: u64, data: &[u8]) -> Result<()> {
        file.write_all_at(data, offset)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn write_at(&self, file: &File, offset: u64, data: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }
}

/// Dispatcher that serializes every operation through one dedicated
/// worker thread, modeling the "AIO completion runs on a thread chosen
/// by affinity token" contract more literally than [`SyncFileAio`]
/// while still returning synchronously to the submitter (the channel
/// round-trip stands in for the completion callback).
pub struct ThreadedAio {
    inner: Mutex<SyncFileAio>,
}

impl Default for ThreadedAio {
    fn default() -> Self {
        Self {
            inner: Mutex::new(SyncFileAio),
        }
    }
}

impl AioDispatcher for ThreadedAio {
    fn read_at(&self, file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
        let dispatcher = self.inner.lock().expect("aio worker mutex poisoned");
        std::thread::scope(|scope| {
            scope
                .spawn(|| dispatcher.read_at(file, offset, buf))
                .join()
                .expect("aio worker thread panicked")
        })
    }

    fn write_at(&self, file: &File, offset: u64, data: &[u8]) -> Result<()> {
        let dispatcher = self.inner.lock().expect("aio worker mutex poisoned");
        std::thread::scope(|scope| {
            scope
                .spawn(|| dispatcher.write_at(file, offset, data))
                .join()
                .expect("aio worker thread panicked")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn sync_dispatcher_roundtrips() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stripe.bin");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.set_len(4096)?;

        let dispatcher = SyncFileAio;
        dispatcher.write_at(&file, 512, b"hello")?;

        let mut buf = [0_u8; 5];
        dispatcher.read_at(&file, 512, &mut buf)?;
        assert_eq!(&buf, b"hello");
        Ok(())
    }

    #[test]
    fn threaded_dispatcher_roundtrips() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stripe.bin");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.set_len(4096)?;

        let dispatcher = ThreadedAio::default();
        dispatcher.write_at(&file, 0, b"world")?;

        let mut buf = [0_u8; 5];
        dispatcher.read_at(&file, 0, &mut buf)?;
        assert_eq!(&buf, b"world");
        Ok(())
    }
}
