//! High-level SDK for objloader.
//!
//! Wires the store, cache, queues and downloader into an [`ObjectLoader`],
//! the main entry point for applications that load object graphs.
//!
//! - [`ObjectLoader`] -- root lookup, closure traversal, single-object fetch
//! - [`CacheReader`] / [`CacheWriter`] -- local store access, inline or on a worker thread
//! - [`LoaderOptions`] -- batching, cache and worker configuration

pub mod error;
pub mod loader;
pub mod options;
pub mod reader;
pub mod worker;
pub mod writer;

pub use error::{SdkError, SdkResult};
pub use loader::ObjectLoader;
pub use options::{LoaderOptions, ReadOptions, WriteOptions};
pub use reader::{CacheReader, InlineCacheReader, WorkerCacheReader};
pub use writer::{CacheWriter, InlineCacheWriter, RequestItem, WorkerCacheWriter};

// Re-export key types
pub use objloader_cache::CacheOptions;
pub use objloader_download::{Downloader, ServerDownloaderOptions};
pub use objloader_store::{Database, FileDatabase, MemoryDatabase};
pub use objloader_types::{Base, Item, ObjectId};
