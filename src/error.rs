// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    version::Version,
};

/// The negative error-code taxonomy returned to cache clients (see the
/// on-disk/external interface error table).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum CacheError {
    /// No document exists for the requested key
    NoDoc,
    /// A writer already holds the object and concurrent writers are disallowed
    DocBusy,
    /// The stripe directory is corrupt beyond self-recovery
    DirBad,
    /// A document's metadata failed validation (bad magic, bad version, checksum mismatch)
    BadMetaData,
    /// A disk read failed
    ReadFail,
    /// A disk write failed, or aggregation backlog was exceeded
    WriteFail,
    /// Too many alternates for one object
    MaxAltExceeded,
    /// The cache (or a stripe within it) isn't ready to serve requests yet
    NotReady,
    /// No alternate matched the request's selection criteria
    AltMiss,
    /// The read request itself was malformed
    BadReadRequest,
}

impl CacheError {
    /// The conventional negative wire code for this error.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::NoDoc => -1,
            Self::DocBusy => -2,
            Self::DirBad => -3,
            Self::BadMetaData => -4,
            Self::ReadFail => -5,
            Self::WriteFail => -6,
            Self::MaxAltExceeded => -7,
            Self::NotReady => -8,
            Self::AltMiss => -9,
            Self::BadReadRequest => -10,
        }
    }
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NoDoc => "ECACHE_NO_DOC",
            Self::DocBusy => "ECACHE_DOC_BUSY",
            Self::DirBad => "ECACHE_DIR_BAD",
            Self::BadMetaData => "ECACHE_BAD_META_DATA",
            Self::ReadFail => "ECACHE_READ_FAIL",
            Self::WriteFail => "ECACHE_WRITE_FAIL",
            Self::MaxAltExceeded => "ECACHE_MAX_ALT_EXCEEDED",
            Self::NotReady => "ECACHE_NOT_READY",
            Self::AltMiss => "ECACHE_ALT_MISS",
            Self::BadReadRequest => "ECACHE_BAD_READ_REQUEST",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// Storage-layout configuration error (span/volume sizing, see `config.rs`)
#[derive(Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// A span referenced by a volume does not exist
    UnknownSpan(String),
    /// A volume id is outside `1..=255`
    InvalidVolumeId(u8),
    /// Percentage shares across volumes don't leave room to complement to 100
    PercentOverflow,
    /// A stripe would be sized outside the allowed bounds
    StripeSizeOutOfBounds(u64),
    /// A span was claimed exclusively by more than one volume
    SpanDoubleClaimed(String),
    /// `read_while_writer` was enabled without `max_doc_size == 0` and
    /// `background_fill_completed_threshold == 0`
    ReadWhileWriterRequiresUnlimitedSize,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownSpan(s) => write!(f, "volume references unknown span {s:?}"),
            Self::InvalidVolumeId(id) => write!(f, "invalid volume id {id} (must be 1..=255)"),
            Self::PercentOverflow => write!(f, "volume percentages exceed 100%"),
            Self::StripeSizeOutOfBounds(bytes) => {
                write!(f, "stripe size {bytes} bytes is out of bounds")
            }
            Self::SpanDoubleClaimed(s) => write!(f, "span {s:?} claimed by more than one volume"),
            Self::ReadWhileWriterRequiresUnlimitedSize => write!(
                f,
                "read_while_writer requires max_doc_size == 0 and background_fill_completed_threshold == 0"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Represents errors that can occur in the cache engine
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Invalid data format version
    InvalidVersion(Option<Version>),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// A cache-level operation failed; see [`CacheError`] for the taxonomy
    Cache(CacheError),

    /// Storage layout configuration is invalid
    Config(ConfigError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidVersion(_) | Self::Encode(_) | Self::Decode(_) | Self::Cache(_) => None,
            Self::Config(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

impl From<CacheError> for Error {
    fn from(value: CacheError) -> Self {
        Self::Cache(value)
    }
}

impl From<ConfigError> for Error {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

/// Cache engine result
pub type Result<T> = std::result::Result<T, Error>;
