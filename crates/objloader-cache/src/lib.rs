//! In-memory caching and request deferment for objloader.
//!
//! - [`MemoryCache`] -- bounded cache with sliding TTL and reference-aware eviction
//! - [`DefermentManager`] -- per-id waiter lists guaranteeing one fetch per id
//!
//! Both are owned by a single loader; nothing here is global.

pub mod deferment;
pub mod error;
pub mod memory;

pub use deferment::{DeferredBase, Deferment, DefermentManager};
pub use error::{CacheError, CacheResult};
pub use memory::{CacheOptions, MemoryCache, SweepReport};
