// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Virtual-connection state machines. Each submodule implements one of
//! the four request types the external API (`cache.rs`) dispatches to:
//! open-read, open-write, remove, scan.

pub mod read;
pub mod remove;
pub mod scan;
pub mod write;

use std::time::Duration;

/// Default delay between a busy record's scan retries, matching the
/// `mutex_retry_delay` tunable's default.
pub const MUTEX_RETRY_DELAY: Duration = Duration::from_millis(2);
