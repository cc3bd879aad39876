// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-disk error budget and bad-disk persistence.
//!
//! Mirrors `CacheDisk`'s `num_errors` / `online` fields: every disk in a
//! [`DiskSet`] tracks its own error counter, and once that counter
//! reaches `max_disk_errors` the disk is marked bad (`online = false`
//! in the original) and excluded from further routing.

use crate::Result;
use log::{info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// One physical span's health state.
#[derive(Debug)]
pub struct Disk {
    path: PathBuf,
    errors: AtomicU32,
    max_errors: u32,
}

impl Disk {
    fn new(path: PathBuf, max_errors: u32, start_bad: bool) -> Self {
        Self {
            path,
            errors: AtomicU32::new(if start_bad { max_errors } else { 0 }),
            max_errors,
        }
    }

    /// Filesystem path this disk spans.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consecutive I/O errors recorded since the disk was last healthy.
    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.errors.load(Ordering::SeqCst)
    }

    /// `DISK_BAD`: errors have reached the configured budget.
    #[must_use]
    pub fn is_bad(&self) -> bool {
        self.errors.load(Ordering::SeqCst) >= self.max_errors
    }

    /// Records one I/O failure. Returns `true` exactly when this error
    /// pushed the disk from healthy to bad.
    fn record_error(&self) -> bool {
        let previous = self.errors.fetch_add(1, Ordering::SeqCst);
        previous + 1 == self.max_errors
    }

    /// `SET_DISK_BAD`.
    fn force_bad(&self) {
        self.errors.store(self.max_errors, Ordering::SeqCst);
    }
}

/// Every span the cache was configured with, plus the shared error
/// budget and optional persistence of which disks are bad across
/// restarts (`persist_bad_disks`).
pub struct DiskSet {
    disks: Vec<Disk>,
    max_disk_errors: u32,
    bad_disks_file: Option<PathBuf>,
}

impl DiskSet {
    /// Builds the disk set, pre-marking any disk bad whose path is
    /// listed in `bad_disks_file` (one absolute path per line) if that
    /// file exists.
    pub fn open(paths: Vec<PathBuf>, max_disk_errors: u32, bad_disks_file: Option<PathBuf>) -> Result<Self> {
        let previously_bad = match &bad_disks_file {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(PathBuf::from)
                    .collect::<HashSet<_>>()
            }
            _ => HashSet::new(),
        };

        let disks = paths
            .into_iter()
            .map(|path| {
                let start_bad = previously_bad.contains(&path);
                if start_bad {
                    warn!("disk {} excluded at startup (listed in bad-disks file)", path.display());
                }
                Disk::new(path, max_disk_errors, start_bad)
            })
            .collect();

        Ok(Self { disks, max_disk_errors, bad_disks_file })
    }

    /// Every disk in this set.
    #[must_use]
    pub fn disks(&self) -> &[Disk] {
        &self.disks
    }

    /// Error budget shared by every disk in this set.
    #[must_use]
    pub fn max_disk_errors(&self) -> u32 {
        self.max_disk_errors
    }

    fn find(&self, path: &Path) -> Option<&Disk> {
        self.disks.iter().find(|disk| disk.path == path)
    }

    /// Whether the disk at `path` has exhausted its error budget.
    #[must_use]
    pub fn is_bad(&self, path: &Path) -> bool {
        self.find(path).is_some_and(Disk::is_bad)
    }

    /// Paths of every disk that is not currently bad; what
    /// `Volume::rebuild_routing` consults after a disk trips its error
    /// budget.
    #[must_use]
    pub fn healthy_paths(&self) -> Vec<&Path> {
        self.disks.iter().filter(|d| !d.is_bad()).map(Disk::path).collect()
    }

    /// Records one I/O failure against `path`'s error counter. Once the
    /// counter reaches `max_disk_errors` the disk is persisted to the
    /// bad-disks file, if configured, and `true` is returned so the
    /// caller knows to rebuild routing.
    pub fn record_error(&self, path: &Path) -> Result<bool> {
        let Some(disk) = self.find(path) else { return Ok(false) };
        let became_bad = disk.record_error();
        if became_bad {
            warn!("disk {} exceeded max_disk_errors, marking bad", path.display());
            self.persist_bad(path)?;
        }
        Ok(became_bad)
    }

    /// Forces `path` bad immediately, independent of its error count.
    pub fn mark_bad(&self, path: &Path) -> Result<()> {
        if let Some(disk) = self.find(path) {
            disk.force_bad();
            self.persist_bad(path)?;
        }
        Ok(())
    }

    fn persist_bad(&self, path: &Path) -> Result<()> {
        let Some(state_file) = &self.bad_disks_file else { return Ok(()) };

        let mut existing = if state_file.exists() {
            fs::read_to_string(state_file)?
        } else {
            String::new()
        };
        let already_listed = existing.lines().any(|line| Path::new(line.trim()) == path);
        if !already_listed {
            if !existing.is_empty() && !existing.ends_with('\n') {
                existing.push('\n');
            }
            existing.push_str(&path.display().to_string());
            existing.push('\n');
            fs::write(state_file, existing)?;
            info!("persisted {} to bad-disks file", path.display());
        }
        Ok(())
    }
}
