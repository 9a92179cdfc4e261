//! Object downloads for objloader.
//!
//! - [`Downloader`] -- the pool contract the loader drives
//! - [`ServerDownloader`] -- batched `POST` requests with streamed line parsing
//! - [`MemoryDownloader`] -- the same contract over an in-memory graph
//!
//! Every id handed to a downloader produces exactly one item on the results
//! queue: the object, or a "not found" placeholder.

pub mod error;
pub mod memory;
pub mod pool;
pub mod server;
pub mod traits;

pub use error::{DownloadError, DownloadResult};
pub use memory::MemoryDownloader;
pub use pool::{batch_size_for, LARGE_BATCH_SIZE, SMALL_GRAPH_THRESHOLD, YIELD_EVERY};
pub use server::{ServerDownloader, ServerDownloaderOptions};
pub use traits::{Downloader, PoolOptions};
