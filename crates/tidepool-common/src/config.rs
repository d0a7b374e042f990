//! Configuration structures for Tidepool.
//!
//! Configuration is an explicit value built once at startup and handed to
//! the disk manager and the buffer pool. Nothing here is global.

use crate::error::{Result, TidepoolError};
use crate::page::{PageHeader, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Page replacement policy used by the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplacerKind {
    /// Second-chance clock sweep under a single latch.
    #[default]
    Clock,
    /// Least recently unpinned, backed by a lock-free recency list.
    Lru,
}

/// Buffer pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Page size in bytes.
    pub page_size: usize,
    /// Number of frames in the pool.
    pub pool_size: usize,
    /// Replacement policy.
    pub replacer: ReplacerKind,
    /// First page id handed out by `new_page`.
    pub first_page_id: i32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pool_size: 1024, // 4 MB with 4 KB pages
            replacer: ReplacerKind::Clock,
            first_page_id: 0,
        }
    }
}

impl BufferConfig {
    /// Creates a config with the given pool size and defaults elsewhere.
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Default::default()
        }
    }

    /// Returns the total buffer pool size in bytes.
    pub fn pool_size_bytes(&self) -> usize {
        self.pool_size * self.page_size
    }

    /// Checks that the configuration can back a working pool.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(TidepoolError::ConfigError(
                "pool_size must be greater than 0".to_string(),
            ));
        }
        if self.page_size < PageHeader::SIZE {
            return Err(TidepoolError::ConfigError(format!(
                "page_size {} is smaller than the {} byte page header",
                self.page_size,
                PageHeader::SIZE
            )));
        }
        if self.first_page_id < 0 {
            return Err(TidepoolError::ConfigError(format!(
                "first_page_id {} is negative",
                self.first_page_id
            )));
        }
        Ok(())
    }
}

/// Disk manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Path of the database file.
    pub path: PathBuf,
    /// Page size in bytes. Must match the buffer pool.
    pub page_size: usize,
    /// Enable fsync after every page write.
    pub fsync_enabled: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/tidepool.db"),
            page_size: DEFAULT_PAGE_SIZE,
            fsync_enabled: true,
        }
    }
}

impl DiskConfig {
    /// Creates a disk config for the given file with default settings.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}
