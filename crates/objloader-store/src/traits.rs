use objloader_types::{Item, ObjectId};

use crate::error::StoreResult;

/// Persisted local cache of resolved objects, keyed by id.
///
/// Only resolved items (with a base) are stored; "not found" placeholders
/// passed to [`put_all`](Database::put_all) are ignored. Every call after
/// [`dispose`](Database::dispose) fails with `StoreError::Disposed`.
pub trait Database: Send + Sync {
    /// Look up a batch of ids. The result is positionally aligned with `keys`.
    fn get_all(&self, keys: &[ObjectId]) -> StoreResult<Vec<Option<Item>>>;

    /// Store a batch of items. Ids already present are left untouched.
    fn put_all(&self, items: &[Item]) -> StoreResult<()>;

    /// Every stored item, in no particular order.
    fn all_items(&self) -> StoreResult<Vec<Item>>;

    /// Remove everything.
    fn clear(&self) -> StoreResult<()>;

    /// Release resources. Idempotent.
    fn dispose(&self) -> StoreResult<()>;

    /// Look up a single id.
    fn get(&self, key: &ObjectId) -> StoreResult<Option<Item>> {
        Ok(self
            .get_all(std::slice::from_ref(key))?
            .into_iter()
            .next()
            .flatten())
    }
}
