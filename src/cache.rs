// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Top-level public API: routes `(frag_type, key, hostname)` requests
//! from a surrounding system onto the right stripe, dispatches the
//! corresponding virtual-connection state machine on that stripe's
//! affine worker, and folds disk I/O failures back into the disk error
//! budget and volume routing tables.

use crate::{
    config::{EngineConfig, ResolvedVolume, StorageConfig},
    dir::DirEntry,
    disk::DiskSet,
    key::CacheKey,
    open_dir::VcId,
    scheduler::Scheduler,
    stripe::Stripe,
    vc::{
        read::{open_read as vc_open_read, ReadResult},
        remove::remove as vc_remove,
        scan::{scan_stripe, ScanAction, ScanStats},
        write::{open_write as vc_open_write, WriteRequest},
    },
    volume::{estimate_total_buckets, split_into_stripes, CacheScheme, Volume},
    aio::{AioDispatcher, SyncFileAio},
    doc::Doc,
    CacheError, Error, Result,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-request overrides for `open_write`; everything not set falls
/// back to the engine-wide [`EngineConfig`] default.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Wait for this write to reach the sync queue before returning.
    pub sync: bool,
    /// Allow a second concurrent writer on the same key instead of
    /// failing with `ECACHE_DOC_BUSY`.
    pub allow_if_writers: bool,
    /// Upper bound on concurrent writers when `allow_if_writers` is set.
    pub max_writers: usize,
    /// Overrides [`EngineConfig::target_fragment_size`] for this write.
    pub target_fragment_size: Option<u64>,
    /// Pin-until timestamp (unix seconds) to store on the object's head
    /// fragment; `None`/`Some(0)` leaves the object unpinned.
    pub pin_in_cache: Option<u32>,
}

/// Stripe-level cache engine, opened from a validated [`StorageConfig`]
/// and wired to a [`Scheduler`] for thread-affine virtual-connection
/// dispatch. One process normally owns a single `Cache`.
pub struct Cache {
    volumes: Vec<Arc<Volume>>,
    disks: Arc<DiskSet>,
    scheduler: Scheduler,
    config: EngineConfig,
    next_vc_id: AtomicU64,
}

impl Cache {
    /// Resolves `storage`, opens (creating if absent) every stripe it
    /// names, and builds the routing volumes. Fails closed: any
    /// configuration or I/O error here means the whole cache reports
    /// not-ready rather than serving a partial layout.
    pub fn open(storage: &StorageConfig, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let resolved = storage.validate()?;

        let mut span_paths: Vec<PathBuf> = storage.spans.iter().map(|s| s.path.clone()).collect();
        span_paths.sort();
        span_paths.dedup();
        let disks = Arc::new(DiskSet::open(span_paths, config.max_disk_errors, config.persist_bad_disks.clone())?);

        let aio: Arc<dyn AioDispatcher> = Arc::new(SyncFileAio);
        let mut span_cursors: HashMap<PathBuf, u64> = HashMap::new();
        // whether each span file already held data before this `open`
        // call; decided once per path so a span isn't opened as
        // "fresh" for one stripe and "existing" for the next one
        // carved out of the same file.
        let mut span_preexisting: HashMap<PathBuf, bool> = HashMap::new();
        let mut volumes = Vec::with_capacity(resolved.len());

        for ResolvedVolume { id, scheme, ram_cache, allocations } in resolved {
            let mut stripes = Vec::new();

            for allocation in allocations {
                for stripe_len in split_into_stripes(allocation.bytes)? {
                    let skip = *span_cursors.entry(allocation.span_path.clone()).or_insert(0);
                    let preexisting =
                        *span_preexisting.entry(allocation.span_path.clone()).or_insert_with(|| allocation.span_path.exists());
                    let total_buckets = estimate_total_buckets(stripe_len);
                    let ram_cache_bytes = if ram_cache { stripe_len / 64 } else { 0 };

                    let stripe = if preexisting {
                        Stripe::open(&allocation.span_path, skip, stripe_len, total_buckets, ram_cache_bytes, Arc::clone(&aio))
                    } else {
                        Stripe::create(&allocation.span_path, skip, stripe_len, total_buckets, ram_cache_bytes, Arc::clone(&aio))
                    }?;

                    *span_cursors.get_mut(&allocation.span_path).expect("just inserted") += stripe_len;
                    stripes.push((allocation.span_path.clone(), Arc::new(stripe)));
                }
            }

            volumes.push(Arc::new(Volume::new(id, scheme, ram_cache, stripes)));
        }

        Ok(Self {
            volumes,
            disks,
            scheduler: Scheduler::default(),
            config,
            next_vc_id: AtomicU64::new(1),
        })
    }

    /// The configuration this cache was opened with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn allocate_vc_id(&self) -> VcId {
        self.next_vc_id.fetch_add(1, Ordering::SeqCst)
    }

    fn volumes_for(&self, scheme: CacheScheme) -> Vec<&Arc<Volume>> {
        self.volumes.iter().filter(|v| v.scheme == scheme).collect()
    }

    fn route(&self, scheme: CacheScheme, key: &CacheKey) -> Result<Arc<Stripe>> {
        let candidates = self.volumes_for(scheme);
        if candidates.is_empty() {
            return Err(Error::Cache(CacheError::NotReady));
        }
        let index = (key.word0() as usize) % candidates.len();
        candidates[index].route(key)
    }

    /// Folds an I/O failure observed on `stripe` back into the disk
    /// error budget; if this pushes the owning disk over
    /// `max_disk_errors`, every volume's routing table is rebuilt to
    /// stop sending new traffic to it (existing VCs on that stripe
    /// still fail with the error that triggered this call).
    fn note_io_failure(&self, stripe: &Stripe) {
        if let Ok(became_bad) = self.disks.record_error(stripe.path()) {
            if became_bad {
                for volume in &self.volumes {
                    volume.rebuild_routing(&self.disks);
                }
            }
        }
    }

    /// `lookup`: does an object exist for `key`, without reading it.
    pub fn lookup(&self, scheme: CacheScheme, key: &CacheKey) -> Result<bool> {
        let stripe = self.route(scheme, key)?;
        Ok(stripe.probe(key).is_some())
    }

    /// The current directory entry for `key`, if cached. Useful for
    /// confirming an object actually moved (evacuation, wraparound
    /// relocation) rather than just remaining readable.
    pub fn locate(&self, scheme: CacheScheme, key: &CacheKey) -> Result<Option<DirEntry>> {
        let stripe = self.route(scheme, key)?;
        Ok(stripe.probe(key))
    }

    /// `open_read`.
    pub fn open_read(&self, scheme: CacheScheme, key: &CacheKey) -> Result<ReadResult> {
        let stripe = self.route(scheme, key)?;
        let vc_id = self.allocate_vc_id();
        let key = *key;
        let read_while_writer = self.config.read_while_writer;
        let retry_delay = self.config.mutex_retry_delay;
        let result = self.scheduler.run_on(vc_id, {
            let stripe = Arc::clone(&stripe);
            move || vc_open_read(&stripe, &key, vc_id, read_while_writer, retry_delay)
        });
        if matches!(result, Err(Error::Io(_))) {
            self.note_io_failure(&stripe);
        }
        result
    }

    /// `open_write`.
    pub fn open_write(
        &self,
        scheme: CacheScheme,
        first_key: CacheKey,
        header: Vec<u8>,
        data: Vec<u8>,
        opts: WriteOptions,
    ) -> Result<DirEntry> {
        let stripe = self.route(scheme, &first_key)?;
        let vc_id = self.allocate_vc_id();

        let req = WriteRequest {
            first_key,
            header,
            data,
            sync: opts.sync,
            allow_if_writers: opts.allow_if_writers,
            max_writers: opts.max_writers,
            target_fragment_size: opts.target_fragment_size.unwrap_or(self.config.target_fragment_size),
            backlog_threshold: self.config.agg_write_backlog,
            checksums: self.config.checksums,
            pin_until: opts.pin_in_cache.unwrap_or(0),
        };

        let result = self.scheduler.run_on(vc_id, {
            let stripe = Arc::clone(&stripe);
            move || vc_open_write(&stripe, vc_id, req)
        });
        if matches!(result, Err(Error::Io(_))) {
            self.note_io_failure(&stripe);
        }
        result
    }

    /// `remove`.
    pub fn remove(&self, scheme: CacheScheme, key: &CacheKey) -> Result<bool> {
        let stripe = self.route(scheme, key)?;
        let vc_id = self.allocate_vc_id();
        let key = *key;
        self.scheduler.run_on(vc_id, {
            let stripe = Arc::clone(&stripe);
            move || vc_remove(&stripe, &key, vc_id)
        })
    }

    /// `scan`: walks every stripe of every volume matching `scheme`,
    /// aggregating stats across all of them. Mirrors `CacheVC::scanVol`
    /// iterating stripes on behalf of one top-level `scan()` call.
    pub fn scan(&self, scheme: CacheScheme, mut callback: impl FnMut(&Doc) -> ScanAction) -> Result<ScanStats> {
        let mut total = ScanStats::default();
        for volume in self.volumes_for(scheme) {
            for stripe in volume.all_stripes() {
                let stats = scan_stripe(&stripe, &mut callback)?;
                total.visited += stats.visited;
                total.deleted += stats.deleted;
                total.updated += stats.updated;
                total.skipped_busy += stats.skipped_busy;
            }
        }
        Ok(total)
    }
}
