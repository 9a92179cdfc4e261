//! Local persisted store for objloader.
//!
//! Objects fetched from the network are written here so later sessions can
//! skip the download. All backends implement the [`Database`] trait:
//!
//! - [`MemoryDatabase`] -- `HashMap`-based store for tests and ephemeral loads
//! - [`FileDatabase`] -- CRC-framed append log replayed into an index on open
//!
//! The store never interprets payloads beyond (de)serializing them, and only
//! resolved items are persisted.

pub mod error;
pub mod file;
pub mod memory;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use file::FileDatabase;
pub use memory::MemoryDatabase;
pub use traits::Database;
