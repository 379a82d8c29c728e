// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Store and stream configuration (§4.3, §13).

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Minimum allowed `BlockSize`.
pub const MIN_BLOCK_SIZE: u64 = 32_000;
/// Maximum allowed `BlockSize`.
pub const MAX_BLOCK_SIZE: u64 = 128 * 1024 * 1024;

const DEFAULT_CACHE_EXPIRE: Duration = Duration::from_secs(5);
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// How a stream discards messages once a limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscardPolicy {
    /// Drop the oldest messages to make room (the default).
    Old,
    /// Refuse new writes once a limit is reached.
    New,
}

impl Default for DiscardPolicy {
    fn default() -> Self {
        DiscardPolicy::Old
    }
}

/// Retention family, used only to pick a default `BlockSize` (§4.3) when
/// the caller leaves it at zero. The store itself enforces limits
/// identically regardless of this tag; scheduling *when* a stream is
/// `WorkQueue`- or `Interest`-retained lives above the store (§1 scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    Limits,
    WorkQueue,
    Interest,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::Limits
    }
}

/// Per-stream configuration, persisted as `meta.inf` (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_msgs: u64,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_bytes: u64,
    /// `None` = unlimited.
    #[serde(default)]
    pub max_age: Option<Duration>,
    #[serde(default)]
    pub discard: DiscardPolicy,
    /// 0 lets the store derive a size from `max_bytes`/`retention` (§4.3).
    #[serde(default)]
    pub block_size: u64,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retention: RetentionPolicy::Limits,
            max_msgs: 0,
            max_bytes: 0,
            max_age: None,
            discard: DiscardPolicy::Old,
            block_size: 0,
        }
    }

    /// Resolves the effective block size, applying §4.3's derivation rule
    /// when `block_size == 0` and validating the configured/clamped ceiling.
    pub fn effective_block_size(&self) -> Result<u64> {
        let size = if self.block_size != 0 {
            self.block_size
        } else if self.max_bytes > 0 {
            let derived = (self.max_bytes / 4 + 1).div_ceil(100) * 100;
            derived.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
        } else if matches!(self.retention, RetentionPolicy::Limits) {
            64 * 1024 * 1024
        } else {
            32 * 1024 * 1024
        };

        if size > MAX_BLOCK_SIZE {
            return Err(StoreError::Configuration(format!(
                "block size {size} exceeds maximum {MAX_BLOCK_SIZE}"
            )));
        }
        Ok(size)
    }
}

/// Filesystem and timing knobs for a [`crate::store::FileStore`] (§4.3).
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    pub store_dir: PathBuf,
    /// Non-zero overrides `StreamConfig::effective_block_size` outright; 0
    /// defers to the stream config's own `block_size`/retention-derived
    /// value (§4.3).
    pub block_size: u64,
    pub cache_expire: Duration,
    pub sync_interval: Duration,
}

impl FileStoreConfig {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            block_size: 0,
            cache_expire: DEFAULT_CACHE_EXPIRE,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_dir.as_os_str().is_empty() {
            return Err(StoreError::Configuration("store_dir must not be empty".into()));
        }
        if self.block_size != 0 && self.block_size > MAX_BLOCK_SIZE {
            return Err(StoreError::Configuration(format!(
                "block size {} exceeds maximum {MAX_BLOCK_SIZE}",
                self.block_size
            )));
        }
        Ok(())
    }
}
