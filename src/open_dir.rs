// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{dir::DirEntry, key::CacheKey};
use std::collections::HashMap;

/// Number of hash chains in a stripe's open-directory table.
pub const OPEN_DIR_BUCKETS: usize = 256;

/// Resolution of the `move_resident_alt` / `rewrite_resident_alt`
/// interaction: modeled as an explicit state rather than loose
/// booleans, per the design notes' own recommendation.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum ResidentAltState {
    /// no move is pending or in flight
    #[default]
    NotResident,
    /// a single-fragment object's body is queued to move alongside its
    /// vector on the next evacuation/rewrite
    PendingMove,
    /// the move has been folded into a completed write
    Moved,
}

/// Opaque handle identifying a writer or reader registered on an
/// [`OpenDirEntry`]. In the full engine this would be the virtual
/// connection itself; kept as an id here since VCs are represented by
/// their state machines in `vc::*`, not a shared allocator-backed type.
pub type VcId = u64;

/// Per-object coordinator, created on first open-write for a
/// `first_key` and destroyed once the last writer leaves and any
/// delayed readers have been signalled.
#[derive(Debug, Clone)]
pub struct OpenDirEntry {
    /// the object this entry coordinates writers/readers for
    pub first_key: CacheKey,
    /// insertion-ordered active writers
    pub writers: Vec<VcId>,
    /// readers waiting on `writers` to produce more bytes (read-while-writer)
    pub delayed_readers: Vec<VcId>,
    /// directory entry for the resident first fragment, if known
    pub first_dir: Option<DirEntry>,
    /// progress of a resident single-fragment body queued to move
    /// alongside its vector
    pub resident_alt: ResidentAltState,
    /// an in-flight writer should not let its stale entry be re-inserted
    /// (set when a concurrent `remove` wins the race)
    pub dont_update_directory: bool,
    /// the object's vector record is currently being read back for a
    /// rewrite
    pub reading_vec: bool,
    /// the object's vector record is currently being written
    pub writing_vec: bool,
}

impl OpenDirEntry {
    /// A fresh entry for `first_key` with no writers or readers yet.
    #[must_use]
    pub fn new(first_key: CacheKey) -> Self {
        Self {
            first_key,
            writers: Vec::new(),
            delayed_readers: Vec::new(),
            first_dir: None,
            resident_alt: ResidentAltState::NotResident,
            dont_update_directory: false,
            reading_vec: false,
            writing_vec: false,
        }
    }

    /// Number of concurrent writers currently open on this key.
    #[must_use]
    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }

    /// Whether any writer is currently open on this key.
    #[must_use]
    pub fn has_writers(&self) -> bool {
        !self.writers.is_empty()
    }
}

/// Stripe-wide table of [`OpenDirEntry`] instances, bucketed by
/// `first_key` into [`OPEN_DIR_BUCKETS`] hash chains.
#[derive(Debug, Default)]
pub struct OpenDir {
    entries: HashMap<CacheKey, OpenDirEntry>,
}

impl OpenDir {
    /// An empty open-directory table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The open-directory entry for `first_key`, if any writer or
    /// delayed reader currently holds it.
    #[must_use]
    pub fn get(&self, first_key: &CacheKey) -> Option<&OpenDirEntry> {
        self.entries.get(first_key)
    }

    /// Mutable access to the entry for `first_key`.
    pub fn get_mut(&mut self, first_key: &CacheKey) -> Option<&mut OpenDirEntry> {
        self.entries.get_mut(first_key)
    }

    /// Joins an existing entry for `first_key`, or creates one and adds
    /// `writer` as its first writer. `allow_if_writers` mirrors the
    /// single-writer-by-default policy: if false and writers already
    /// exist, the call fails and the caller should report
    /// `CacheError::DocBusy`.
    pub fn open_write(
        &mut self,
        first_key: CacheKey,
        writer: VcId,
        allow_if_writers: bool,
        max_writers: usize,
    ) -> Result<(), ()> {
        let entry = self.entries.entry(first_key).or_insert_with(|| OpenDirEntry::new(first_key));

        if entry.has_writers() && !allow_if_writers {
            return Err(());
        }
        if max_writers > 0 && entry.writers.len() >= max_writers {
            return Err(());
        }

        entry.writers.push(writer);
        Ok(())
    }

    /// Removes `writer` from its entry; if it was the last writer and
    /// there are no delayed readers left to serve, the entry is
    /// dropped.
    pub fn close_write(&mut self, first_key: &CacheKey, writer: VcId) {
        let Some(entry) = self.entries.get_mut(first_key) else {
            return;
        };
        entry.writers.retain(|w| *w != writer);
        if entry.writers.is_empty() && entry.delayed_readers.is_empty() {
            self.entries.remove(first_key);
        }
    }

    /// Queues `reader` to be retried once this key's active write
    /// completes, rather than failing immediately.
    pub fn add_delayed_reader(&mut self, first_key: &CacheKey, reader: VcId) {
        if let Some(entry) = self.entries.get_mut(first_key) {
            entry.delayed_readers.push(reader);
        }
    }

    /// Drops `reader` from this key's delayed-reader queue.
    pub fn remove_delayed_reader(&mut self, first_key: &CacheKey, reader: VcId) {
        if let Some(entry) = self.entries.get_mut(first_key) {
            entry.delayed_readers.retain(|r| *r != reader);
            if entry.writers.is_empty() && entry.delayed_readers.is_empty() {
                self.entries.remove(first_key);
            }
        }
    }

    /// Number of keys with an open writer or delayed reader.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is currently open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
