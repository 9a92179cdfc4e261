use std::path::Path;
use std::time::Duration;

use objloader_cache::CacheOptions;
use objloader_protocol::DEFAULT_WORKER_BUFFER_CAPACITY;
use serde::{Deserialize, Serialize};

use crate::error::{SdkError, SdkResult};

/// Loader configuration.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// max_cache_read_size = 5000
/// use_read_worker = true
///
/// [cache]
/// max_size_in_mb = 200
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderOptions {
    /// Ids per local store lookup.
    pub max_cache_read_size: usize,
    /// Items per local store write.
    pub max_cache_write_size: usize,
    /// Unwritten items at which downloads pause.
    pub max_write_queue_size: usize,
    pub max_cache_batch_write_wait_ms: u64,
    pub max_cache_batch_read_wait_ms: u64,
    pub max_download_batch_wait_ms: u64,
    /// Run store lookups on a background thread.
    pub use_read_worker: bool,
    /// Run store writes on a background thread.
    pub use_write_worker: bool,
    /// Bytes in each ring buffer between the loader and a worker.
    pub worker_buffer_capacity: usize,
    pub cache: CacheOptions,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_cache_read_size: 10_000,
            max_cache_write_size: 10_000,
            max_write_queue_size: 40_000,
            max_cache_batch_write_wait_ms: 3_000,
            max_cache_batch_read_wait_ms: 3_000,
            max_download_batch_wait_ms: 1_000,
            use_read_worker: false,
            use_write_worker: false,
            worker_buffer_capacity: DEFAULT_WORKER_BUFFER_CAPACITY,
            cache: CacheOptions::default(),
        }
    }
}

impl LoaderOptions {
    pub fn from_toml_str(s: &str) -> SdkResult<Self> {
        toml::from_str(s).map_err(|e| SdkError::Config(e.to_string()))
    }

    /// Read options from a TOML file.
    pub fn load(path: &Path) -> SdkResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            batch_size: self.max_cache_read_size,
            max_wait: Duration::from_millis(self.max_cache_batch_read_wait_ms),
        }
    }

    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            batch_size: self.max_cache_write_size,
            max_wait: Duration::from_millis(self.max_cache_batch_write_wait_ms),
            max_queue_size: self.max_write_queue_size,
        }
    }

    pub fn download_wait(&self) -> Duration {
        Duration::from_millis(self.max_download_batch_wait_ms)
    }
}

/// Batching for cache reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOptions {
    pub batch_size: usize,
    pub max_wait: Duration,
}

/// Batching and backpressure for cache writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteOptions {
    pub batch_size: usize,
    pub max_wait: Duration,
    pub max_queue_size: usize,
}
