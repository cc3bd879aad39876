// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Span-to-stripe mapping, key routing within a volume, and the
//! stripe-sizing rules from the storage layout configuration.

use crate::{disk::DiskSet, key::CacheKey, stripe::Stripe, CacheError, ConfigError, Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Minimum size of a single stripe (§6.5).
pub const MIN_STRIPE_SIZE: u64 = 128 * 1024 * 1024;

/// Maximum size of a single stripe (§6.5).
pub const MAX_STRIPE_SIZE: u64 = 512 * 1024 * 1024 * 1024 * 1024;

/// `cache_config_min_average_object_size`'s default: the assumed mean
/// object size used to size the directory (`vol_init_data_internal`).
const MIN_AVERAGE_OBJECT_SIZE: u64 = 8000;

/// Four-way associative directory buckets (kept local since
/// `dir::segment::DIR_DEPTH` is a private implementation detail of the
/// directory module).
const DIR_DEPTH: u64 = 4;

/// Sizes the directory for a stripe of `stripe_bytes` total length:
/// assumes the mean object is `MIN_AVERAGE_OBJECT_SIZE` bytes, so the
/// directory needs `stripe_bytes / MIN_AVERAGE_OBJECT_SIZE` entries,
/// folded into 4-way buckets. This skips the three-pass refinement the
/// original does to net out the header/footer overhead against
/// `total_len` (negligible at the stripe sizes this bound allows).
#[must_use]
pub fn estimate_total_buckets(stripe_bytes: u64) -> usize {
    let total_entries = stripe_bytes / MIN_AVERAGE_OBJECT_SIZE;
    let total_buckets = (total_entries / DIR_DEPTH).max(1);
    total_buckets as usize
}

/// What kind of objects a volume accepts, mirroring `CacheType`
/// (`CACHE_HTTP` vs plain/none) from the configuration's `scheme` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CacheScheme {
    /// HTTP object cache semantics.
    Http,
    /// Plain key/value storage, no HTTP alternate handling.
    None,
}

/// Splits `total_bytes` into one or more stripe sizes, each within
/// `[MIN_STRIPE_SIZE, MAX_STRIPE_SIZE]`. A single allocation larger than
/// `MAX_STRIPE_SIZE` is spread over as many equally-sized stripes as
/// needed; an allocation smaller than `MIN_STRIPE_SIZE` is rejected
/// rather than silently rounded up.
pub fn split_into_stripes(total_bytes: u64) -> Result<Vec<u64>> {
    if total_bytes < MIN_STRIPE_SIZE {
        return Err(Error::Config(ConfigError::StripeSizeOutOfBounds(total_bytes)));
    }

    let stripe_count = total_bytes.div_ceil(MAX_STRIPE_SIZE).max(1);
    let base = total_bytes / stripe_count;
    if base < MIN_STRIPE_SIZE {
        return Err(Error::Config(ConfigError::StripeSizeOutOfBounds(base)));
    }

    let mut sizes = vec![base; stripe_count as usize];
    // fold the division remainder into the last stripe rather than
    // losing bytes to integer truncation
    if let Some(last) = sizes.last_mut() {
        *last += total_bytes - base * stripe_count;
    }
    Ok(sizes)
}

/// One runtime span-stripe pair: which physical disk it lives on (for
/// health routing) and the opened [`Stripe`] itself.
struct RoutedStripe {
    disk_path: std::path::PathBuf,
    stripe: Arc<Stripe>,
}

/// A configured volume: an ordered set of stripes (possibly spread
/// across several spans/disks) that objects of a given `(frag_type,
/// key)` route to by hashing `key` to one stripe index. Stripes whose
/// backing disk has gone bad are excluded from routing until the next
/// rebuild admits a replacement (this engine doesn't relocate existing
/// data onto a new disk; it simply stops routing new traffic there,
/// matching `CacheProcessor.cc`'s "rebuild volume routing" behavior).
pub struct Volume {
    /// Volume id, `1..=255`.
    pub id: u8,
    /// What kind of objects this volume accepts.
    pub scheme: CacheScheme,
    /// Whether reads/writes against this volume get a RAM cache tier.
    pub ram_cache: bool,
    stripes: Vec<RoutedStripe>,
    healthy: RwLock<Vec<bool>>,
    ready: AtomicBool,
}

impl Volume {
    /// Builds a volume routing across `stripes`, all initially healthy.
    #[must_use]
    pub fn new(id: u8, scheme: CacheScheme, ram_cache: bool, stripes: Vec<(std::path::PathBuf, Arc<Stripe>)>) -> Self {
        let healthy = vec![true; stripes.len()];
        let ready = !stripes.is_empty();
        Self {
            id,
            scheme,
            ram_cache,
            stripes: stripes
                .into_iter()
                .map(|(disk_path, stripe)| RoutedStripe { disk_path, stripe })
                .collect(),
            healthy: RwLock::new(healthy),
            ready: AtomicBool::new(ready),
        }
    }

    /// Number of stripes backing this volume.
    #[must_use]
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Every stripe in this volume, healthy or not — used by `scan`,
    /// which walks a volume's whole backing store rather than routing
    /// a single key.
    #[must_use]
    pub fn all_stripes(&self) -> Vec<Arc<Stripe>> {
        self.stripes.iter().map(|routed| Arc::clone(&routed.stripe)).collect()
    }

    /// Whether this volume has at least one stripe and can serve requests.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Hashes `key` to exactly one (currently healthy) stripe. Returns
    /// `NotReady` if every stripe in this volume is bad.
    pub fn route(&self, key: &CacheKey) -> Result<Arc<Stripe>> {
        if self.stripes.is_empty() {
            return Err(Error::Cache(CacheError::NotReady));
        }
        let healthy = self.healthy.read().expect("volume lock poisoned");
        let healthy_count = healthy.iter().filter(|h| **h).count();
        if healthy_count == 0 {
            return Err(Error::Cache(CacheError::NotReady));
        }

        let start = (key.word0() as usize) % self.stripes.len();
        for offset in 0..self.stripes.len() {
            let index = (start + offset) % self.stripes.len();
            if healthy[index] {
                return Ok(Arc::clone(&self.stripes[index].stripe));
            }
        }
        Err(Error::Cache(CacheError::NotReady))
    }

    /// Re-derives which stripes are eligible for routing from the
    /// current state of `disks`. Called after `DiskSet::record_error`
    /// or `DiskSet::mark_bad` reports a disk just went bad.
    pub fn rebuild_routing(&self, disks: &DiskSet) {
        let mut healthy = self.healthy.write().expect("volume lock poisoned");
        for (slot, routed) in healthy.iter_mut().zip(&self.stripes) {
            *slot = !disks.is_bad(&routed.disk_path);
        }
        self.ready.store(healthy.iter().any(|h| *h), Ordering::SeqCst);
    }
}

/// Guards mutation of a volume's routing table from more than one
/// caller at a time (`rebuild_routing` itself is cheap, but a disk-bad
/// notification and a concurrent read of `is_ready` shouldn't tear).
pub type VolumeRegistry = Mutex<Vec<Arc<Volume>>>;
