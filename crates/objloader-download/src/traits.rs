use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use objloader_queue::Queue;
use objloader_types::{Item, ObjectId};

use crate::error::{DownloadError, DownloadResult};

/// How a download pool is sized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolOptions {
    /// Number of objects the loader expects to fetch.
    pub total: usize,
    /// Flush a partial batch this long after its first id.
    pub max_wait: Duration,
}

/// Fetches objects that are not in the local cache.
///
/// Ids handed to [`add`](Downloader::add) are batched; every resolved item,
/// or a "not found" placeholder for ids the source does not have, is pushed
/// to the results queue given to [`initialize_pool`](Downloader::initialize_pool).
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Start the batch pool. Must be called once before `add`.
    fn initialize_pool(
        &self,
        results: Arc<dyn Queue<Item>>,
        options: PoolOptions,
    ) -> DownloadResult<()>;

    /// Queue an id for download.
    fn add(&self, id: ObjectId);

    /// Fetch the root object directly, bypassing the pool.
    async fn download_single(&self) -> DownloadResult<Option<Item>>;

    /// First batch-level failure, if any. Clears it.
    fn take_error(&self) -> Option<DownloadError>;

    /// Flush queued ids and stop the pool.
    async fn dispose_async(&self);
}
