//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::cache::ExhaustionPolicy;
use crate::storage::disk::ChecksumMode;
use crate::storage::wal::WalConfig;

/// Page cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of pages resident in the read cache.
    pub capacity_pages: usize,
    pub exhaustion: ExhaustionPolicy,
    /// Period of the background flusher.
    pub flush_interval: Duration,
    /// Dirty pages above which the flusher is woken early.
    pub max_dirty_pages: usize,
    /// Free page buffers kept for reuse.
    pub buffer_pool_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity_pages: 1024,
            exhaustion: ExhaustionPolicy::default(),
            flush_interval: Duration::from_millis(500),
            max_dirty_pages: 512,
            buffer_pool_limit: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding page files, the file registry and checkpoint metadata.
    pub data_dir: PathBuf,
    pub wal: WalConfig,
    pub cache: CacheConfig,
    /// Checksum mode of files added without an explicit mode.
    pub default_checksum_mode: ChecksumMode,
}

impl EngineConfig {
    /// Configuration rooted at `dir`, with the WAL in `dir/wal`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let data_dir = dir.into();
        EngineConfig {
            wal: WalConfig {
                wal_dir: data_dir.join("wal"),
                ..WalConfig::default()
            },
            data_dir,
            cache: CacheConfig::default(),
            default_checksum_mode: ChecksumMode::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::new("vibestore_data")
    }
}
