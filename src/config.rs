// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Storage layout configuration (spans/volumes, parsed from YAML) and
//! the engine's operational tunables (`EngineConfig`), built the same
//! consuming-builder way as a value log's segment/compression config.

use crate::{doc::DOC_FIXED_LEN, volume::CacheScheme, ConfigError, Error, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// An absolute byte count or a percentage of some larger quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum SizeSpec {
    /// A fixed byte count.
    Absolute(u64),
    /// A percentage of the referenced quantity, `0.0..=100.0`.
    Percent(f32),
}

/// One physical span: a raw device or a plain file, `size` left as
/// `None` for a raw device whose capacity is probed at open time.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SpanConfig {
    /// Name other config entries use to reference this span.
    pub id: String,
    /// Backing file or raw device path.
    pub path: PathBuf,
    /// Usable size in bytes; `None` for a raw device, probed at open.
    pub size: Option<u64>,
    /// Seed mixed into this span's directory hashing, if set.
    pub hash_seed: Option<u32>,
}

/// One volume's claim on a span, either a fixed byte count or a
/// percentage of that span's usable bytes.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct VolumeSpanConfig {
    /// Id of the [`SpanConfig`] this claim draws from.
    pub use_span: String,
    /// How much of that span this volume claims.
    pub size: SizeSpec,
}

/// One logical volume: a target size (as a share of the whole cache),
/// the kind of object it accepts, whether it gets a RAM cache tier, and
/// the spans it's built from.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct VolumeConfig {
    /// Volume id, `1..=255`.
    pub id: u8,
    /// Target size, as a share of the whole cache.
    pub size: SizeSpec,
    /// What kind of objects this volume accepts.
    pub scheme: CacheScheme,
    /// Whether this volume gets a RAM cache tier.
    pub ram_cache: bool,
    /// Spans this volume draws stripes from.
    pub spans: Vec<VolumeSpanConfig>,
}

/// Top-level storage layout document.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct StorageConfig {
    /// Declared physical spans.
    pub spans: Vec<SpanConfig>,
    /// Declared logical volumes.
    pub volumes: Vec<VolumeConfig>,
}

/// One `(span, bytes)` allocation resolved out of a volume's `spans`
/// list, ready to be handed to [`crate::volume::split_into_stripes`].
#[derive(Debug, Clone)]
pub struct ResolvedSpanAllocation {
    /// Which span this allocation was carved from.
    pub span_id: String,
    /// That span's backing path.
    pub span_path: PathBuf,
    /// Concrete byte count resolved from the volume's claim.
    pub bytes: u64,
}

/// A volume with every span claim resolved to concrete byte counts.
#[derive(Debug, Clone)]
pub struct ResolvedVolume {
    /// Volume id, `1..=255`.
    pub id: u8,
    /// What kind of objects this volume accepts.
    pub scheme: CacheScheme,
    /// Whether this volume gets a RAM cache tier.
    pub ram_cache: bool,
    /// Resolved byte allocations, one per span claim.
    pub allocations: Vec<ResolvedSpanAllocation>,
}

impl StorageConfig {
    /// Parses a storage layout document from YAML text.
    #[cfg(feature = "serde")]
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Config(ConfigError::UnknownSpan(e.to_string())))
    }

    /// Resolves volume ids, percentage/absolute span claims and
    /// exclusive-span ownership into concrete per-volume byte
    /// allocations, applying the bounds and uniqueness rules from the
    /// storage layout contract:
    ///   - volume ids must be unique and within `1..=255`
    ///   - every `use_span` must name a declared span
    ///   - percentage claims against one span may not exceed 100%
    ///   - a `Percent(100.0)` claim marks exclusive ownership of that
    ///     span and conflicts with any other claim against it
    pub fn validate(&self) -> Result<Vec<ResolvedVolume>> {
        let mut seen_ids = HashSet::new();
        for volume in &self.volumes {
            if volume.id == 0 {
                return Err(Error::Config(ConfigError::InvalidVolumeId(volume.id)));
            }
            if !seen_ids.insert(volume.id) {
                return Err(Error::Config(ConfigError::InvalidVolumeId(volume.id)));
            }
        }

        let spans_by_id: HashMap<&str, &SpanConfig> = self.spans.iter().map(|s| (s.id.as_str(), s)).collect();

        // percentage bookkeeping, and exclusivity, per span
        let mut percent_claimed: HashMap<&str, f32> = HashMap::new();
        let mut claim_count: HashMap<&str, usize> = HashMap::new();
        let mut exclusive_claim: HashMap<&str, bool> = HashMap::new();

        for volume in &self.volumes {
            for span_claim in &volume.spans {
                let span = spans_by_id
                    .get(span_claim.use_span.as_str())
                    .ok_or_else(|| Error::Config(ConfigError::UnknownSpan(span_claim.use_span.clone())))?;

                *claim_count.entry(span.id.as_str()).or_insert(0) += 1;
                if let SizeSpec::Percent(pct) = span_claim.size {
                    if (pct - 100.0).abs() < f32::EPSILON {
                        *exclusive_claim.entry(span.id.as_str()).or_insert(false) = true;
                    }
                    let total = percent_claimed.entry(span.id.as_str()).or_insert(0.0);
                    *total += pct;
                    if *total > 100.0 {
                        return Err(Error::Config(ConfigError::PercentOverflow));
                    }
                }
            }
        }

        for (span_id, exclusive) in &exclusive_claim {
            if *exclusive && claim_count.get(span_id).copied().unwrap_or(0) > 1 {
                return Err(Error::Config(ConfigError::SpanDoubleClaimed((*span_id).to_string())));
            }
        }

        let mut resolved = Vec::with_capacity(self.volumes.len());
        for volume in &self.volumes {
            let mut allocations = Vec::with_capacity(volume.spans.len());
            for span_claim in &volume.spans {
                let span = spans_by_id.get(span_claim.use_span.as_str()).expect("validated above");
                let span_bytes = span.size.unwrap_or(0);
                let bytes = match span_claim.size {
                    SizeSpec::Absolute(bytes) => bytes,
                    SizeSpec::Percent(pct) => ((f64::from(pct) / 100.0) * span_bytes as f64) as u64,
                };
                allocations.push(ResolvedSpanAllocation {
                    span_id: span.id.clone(),
                    span_path: span.path.clone(),
                    bytes,
                });
            }
            resolved.push(ResolvedVolume {
                id: volume.id,
                scheme: volume.scheme,
                ram_cache: volume.ram_cache,
                allocations,
            });
        }

        Ok(resolved)
    }
}

/// Operational tunables, named verbatim after the contract in §6.6 so
/// an operator porting a config from the original engine can map
/// fields one-to-one. Built with a consuming-builder, like a value
/// log's segment/compression configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub(crate) dir_sync_frequency: Duration,
    pub(crate) dir_sync_delay: Duration,
    pub(crate) max_doc_size: u64,
    pub(crate) target_fragment_size: u64,
    pub(crate) agg_write_backlog: u64,
    pub(crate) hit_evacuate_percent: u8,
    pub(crate) max_disk_errors: u32,
    pub(crate) mutex_retry_delay: Duration,
    pub(crate) read_while_writer: bool,
    pub(crate) background_fill_completed_threshold: u32,
    pub(crate) persist_bad_disks: Option<PathBuf>,
    pub(crate) checksums: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let target_fragment_size = 1024 * 1024 - DOC_FIXED_LEN as u64;
        Self {
            dir_sync_frequency: Duration::from_secs(60),
            dir_sync_delay: Duration::from_millis(500),
            max_doc_size: 0,
            target_fragment_size,
            agg_write_backlog: 8 * 1024 * 1024,
            hit_evacuate_percent: 10,
            max_disk_errors: 5,
            mutex_retry_delay: Duration::from_millis(2),
            read_while_writer: false,
            background_fill_completed_threshold: 0,
            persist_bad_disks: None,
            checksums: true,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration builder seeded with the defaults from
    /// §6.6.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How often the directory's dual header/footer commit runs.
    #[must_use]
    pub fn dir_sync_frequency(mut self, frequency: Duration) -> Self {
        self.dir_sync_frequency = frequency;
        self
    }

    /// Extra delay folded into the directory sync schedule to spread
    /// writeback load.
    #[must_use]
    pub fn dir_sync_delay(mut self, delay: Duration) -> Self {
        self.dir_sync_delay = delay;
        self
    }

    /// `0` means unlimited.
    #[must_use]
    pub fn max_doc_size(mut self, bytes: u64) -> Self {
        self.max_doc_size = bytes;
        self
    }

    /// Clamped to `4 MiB - sizeof(Doc)` at write time regardless of
    /// what's set here (see [`crate::vc::write::MAX_FRAGMENT_SIZE`]).
    #[must_use]
    pub fn target_fragment_size(mut self, bytes: u64) -> Self {
        self.target_fragment_size = bytes;
        self
    }

    /// Bytes of pending aggregation-buffer writes above which new
    /// writers block.
    #[must_use]
    pub fn agg_write_backlog(mut self, bytes: u64) -> Self {
        self.agg_write_backlog = bytes;
        self
    }

    /// Percent of a stripe's recently-hit, about-to-be-overwritten
    /// region that gets preserved via evacuation instead of dropped.
    #[must_use]
    pub fn hit_evacuate_percent(mut self, percent: u8) -> Self {
        self.hit_evacuate_percent = percent;
        self
    }

    /// Consecutive I/O errors a disk tolerates before it's marked bad.
    #[must_use]
    pub fn max_disk_errors(mut self, count: u32) -> Self {
        self.max_disk_errors = count;
        self
    }

    /// Backoff between retries when a document's mutex is contended.
    #[must_use]
    pub fn mutex_retry_delay(mut self, delay: Duration) -> Self {
        self.mutex_retry_delay = delay;
        self
    }

    /// Enabling this requires `max_doc_size == 0` and
    /// `background_fill_completed_threshold == 0`; checked by
    /// [`EngineConfig::validate`].
    #[must_use]
    pub fn read_while_writer(mut self, enabled: bool) -> Self {
        self.read_while_writer = enabled;
        self
    }

    /// Background-fill progress, in percent, below which a
    /// `read_while_writer` read falls back to waiting for completion.
    #[must_use]
    pub fn background_fill_completed_threshold(mut self, threshold: u32) -> Self {
        self.background_fill_completed_threshold = threshold;
        self
    }

    /// Path that bad disks are appended to, and consulted on the next
    /// [`crate::Cache::open`] to pre-exclude them.
    #[must_use]
    pub fn persist_bad_disks(mut self, path: PathBuf) -> Self {
        self.persist_bad_disks = Some(path);
        self
    }

    /// Whether each fragment gets a stored checksum.
    #[must_use]
    pub fn checksums(mut self, enabled: bool) -> Self {
        self.checksums = enabled;
        self
    }

    /// Validates inter-field constraints that can't be expressed by the
    /// builder alone.
    pub fn validate(&self) -> Result<()> {
        if self.read_while_writer && !(self.max_doc_size == 0 && self.background_fill_completed_threshold == 0) {
            return Err(Error::Config(ConfigError::ReadWhileWriterRequiresUnlimitedSize));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn span(id: &str, bytes: u64) -> SpanConfig {
        SpanConfig { id: id.to_string(), path: PathBuf::from(format!("/dev/{id}")), size: Some(bytes), hash_seed: None }
    }

    fn volume(id: u8, span_id: &str, pct: f32) -> VolumeConfig {
        VolumeConfig {
            id,
            size: SizeSpec::Percent(pct),
            scheme: CacheScheme::Http,
            ram_cache: true,
            spans: vec![VolumeSpanConfig { use_span: span_id.to_string(), size: SizeSpec::Percent(pct) }],
        }
    }

    #[test]
    fn resolves_percent_allocation_against_span_size() -> Result<()> {
        let config = StorageConfig { spans: vec![span("a", 1_000_000_000)], volumes: vec![volume(1, "a", 50.0)] };

        let resolved = config.validate()?;
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].allocations[0].bytes, 500_000_000);
        Ok(())
    }

    #[test]
    fn rejects_unknown_span() {
        let config = StorageConfig { spans: vec![], volumes: vec![volume(1, "missing", 10.0)] };
        assert!(matches!(config.validate(), Err(Error::Config(ConfigError::UnknownSpan(_)))));
    }

    #[test]
    fn rejects_percent_overflow_on_one_span() {
        let config =
            StorageConfig { spans: vec![span("a", 1_000)], volumes: vec![volume(1, "a", 70.0), volume(2, "a", 40.0)] };
        assert!(matches!(config.validate(), Err(Error::Config(ConfigError::PercentOverflow))));
    }

    #[test]
    fn rejects_exclusive_span_double_claimed() {
        let config =
            StorageConfig { spans: vec![span("a", 1_000)], volumes: vec![volume(1, "a", 100.0), volume(2, "a", 0.0)] };
        assert!(matches!(config.validate(), Err(Error::Config(ConfigError::SpanDoubleClaimed(_)))));
    }

    #[test]
    fn rejects_duplicate_volume_ids() {
        let config =
            StorageConfig { spans: vec![span("a", 1_000)], volumes: vec![volume(1, "a", 50.0), volume(1, "a", 0.0)] };
        assert!(matches!(config.validate(), Err(Error::Config(ConfigError::InvalidVolumeId(1)))));
    }

    #[test]
    fn read_while_writer_requires_unlimited_doc_size() {
        let config = EngineConfig::new().read_while_writer(true).max_doc_size(4096);
        assert!(matches!(
            config.validate(),
            Err(Error::Config(ConfigError::ReadWhileWriterRequiresUnlimitedSize))
        ));

        let config = EngineConfig::new().read_while_writer(true);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_target_fragment_size_leaves_room_for_doc_header() {
        let config = EngineConfig::new();
        assert_eq!(config.target_fragment_size, 1024 * 1024 - DOC_FIXED_LEN as u64);
    }
}
