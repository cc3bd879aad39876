// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An on-disk object cache engine: a set of independent, fixed-size
//! *stripes*, each holding a segmented open-addressed directory index,
//! a 4 MiB aggregation write buffer, a preservation/evacuation table
//! for circular reuse, and the virtual-connection state machines
//! (`open_read`, `open_write`, `remove`, `scan`) that drive them.
//!
//! Objects are addressed by a 128-bit [`CacheKey`] and hash to exactly
//! one stripe; within a stripe, writes are appended to the circular
//! data area in aggregation-batch order and the directory is the only
//! index maintained (no key ranges, no compaction).
//!
//! # Example usage
//!
//! ```
//! use stripe_cache::{Cache, CacheKey, CacheScheme, EngineConfig, SizeSpec, SpanConfig, StorageConfig, VolumeConfig, VolumeSpanConfig, WriteOptions};
//!
//! # fn main() -> stripe_cache::Result<()> {
//! # let folder = tempfile::tempdir()?;
//! let storage = StorageConfig {
//!     spans: vec![SpanConfig {
//!         id: "span0".to_string(),
//!         path: folder.path().join("span0.bin"),
//!         size: Some(128 * 1024 * 1024),
//!         hash_seed: None,
//!     }],
//!     volumes: vec![VolumeConfig {
//!         id: 1,
//!         size: SizeSpec::Percent(100.0),
//!         scheme: CacheScheme::Http,
//!         ram_cache: true,
//!         spans: vec![VolumeSpanConfig { use_span: "span0".to_string(), size: SizeSpec::Percent(100.0) }],
//!     }],
//! };
//!
//! let cache = Cache::open(&storage, EngineConfig::new())?;
//!
//! let key = CacheKey::from_bytes([1; 16]);
//! cache.open_write(CacheScheme::Http, key, b"headers".to_vec(), b"body".to_vec(), WriteOptions::default())?;
//!
//! let result = cache.open_read(CacheScheme::Http, &key)?;
//! assert_eq!(result.data, b"body");
//! #
//! # Ok(())
//! # }
//! ```

#![doc(html_logo_url = "https://raw.githubusercontent.com/fjall-rs/value-log/main/logo.png")]
#![doc(html_favicon_url = "https://raw.githubusercontent.com/fjall-rs/value-log/main/logo.png")]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]

mod aggregate;
mod aio;
pub mod cache;
mod coding;
pub mod config;
mod dir;
pub mod disk;
mod doc;
mod error;
mod evacuate;
mod header;
mod key;
mod open_dir;
mod ram_cache;
mod scheduler;
mod stripe;
pub mod vc;
mod version;
pub mod volume;

pub use {
    cache::{Cache, WriteOptions},
    config::{
        EngineConfig, ResolvedSpanAllocation, ResolvedVolume, SizeSpec, SpanConfig, StorageConfig, VolumeConfig,
        VolumeSpanConfig,
    },
    dir::DirEntry,
    disk::{Disk, DiskSet},
    doc::Doc,
    error::{CacheError, ConfigError, Error, Result},
    key::CacheKey,
    open_dir::VcId,
    scheduler::Scheduler,
    vc::{read::ReadResult, scan::{ScanAction, ScanStats}, write::WriteRequest},
    version::Version,
    volume::{CacheScheme, Volume},
};

#[doc(hidden)]
pub use aio::{AioDispatcher, SyncFileAio, ThreadedAio};

#[doc(hidden)]
pub use ram_cache::{QuickRamCache, RamCache, RamCacheLookup};
