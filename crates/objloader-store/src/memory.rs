use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use objloader_types::{Item, ObjectId};

use crate::error::{StoreError, StoreResult};
use crate::traits::Database;

/// In-memory, HashMap-based database.
///
/// Intended for tests and for loaders that should not touch disk. Items are
/// cloned on read and write; bases are shared, so clones are cheap.
pub struct MemoryDatabase {
    items: RwLock<HashMap<ObjectId, Item>>,
    disposed: AtomicBool,
}

impl MemoryDatabase {
    /// Create a new empty database.
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Create a database pre-populated with `items`.
    pub fn with_items(items: impl IntoIterator<Item = Item>) -> Self {
        let db = Self::new();
        {
            let mut map = db.items.write().expect("lock poisoned");
            for item in items.into_iter().filter(Item::is_resolved) {
                map.entry(item.base_id.clone()).or_insert(item);
            }
        }
        db
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.items.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StoreError::Disposed);
        }
        Ok(())
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl Database for MemoryDatabase {
    fn get_all(&self, keys: &[ObjectId]) -> StoreResult<Vec<Option<Item>>> {
        self.check_open()?;
        let map = self.items.read().expect("lock poisoned");
        Ok(keys.iter().map(|key| map.get(key).cloned()).collect())
    }

    fn put_all(&self, items: &[Item]) -> StoreResult<()> {
        self.check_open()?;
        let mut map = self.items.write().expect("lock poisoned");
        for item in items.iter().filter(|item| item.is_resolved()) {
            map.entry(item.base_id.clone())
                .or_insert_with(|| item.clone());
        }
        Ok(())
    }

    fn all_items(&self) -> StoreResult<Vec<Item>> {
        self.check_open()?;
        Ok(self
            .items
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect())
    }

    fn clear(&self) -> StoreResult<()> {
        self.check_open()?;
        self.items.write().expect("lock poisoned").clear();
        Ok(())
    }

    fn dispose(&self) -> StoreResult<()> {
        self.disposed.store(true, Ordering::Release);
        self.items.write().expect("lock poisoned").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objloader_types::Base;
    use serde_json::json;

    fn item(id: &str) -> Item {
        Item::new(Base::from_value(json!({"id": id})).unwrap())
    }

    #[test]
    fn get_all_is_positional() {
        let db = MemoryDatabase::new();
        db.put_all(&[item("a"), item("c")]).unwrap();
        let keys = [ObjectId::new("a"), ObjectId::new("b"), ObjectId::new("c")];
        let found = db.get_all(&keys).unwrap();
        assert_eq!(found.len(), 3);
        assert!(found[0].is_some());
        assert!(found[1].is_none());
        assert_eq!(found[2].as_ref().unwrap().base_id.as_str(), "c");
    }

    #[test]
    fn placeholders_are_not_stored() {
        let db = MemoryDatabase::new();
        db.put_all(&[Item::not_found("ghost")]).unwrap();
        assert!(db.is_empty());
    }

    #[test]
    fn put_is_idempotent() {
        let db = MemoryDatabase::new();
        db.put_all(&[item("a")]).unwrap();
        db.put_all(&[item("a")]).unwrap();
        assert_eq!(db.len(), 1);
        assert_eq!(db.all_items().unwrap().len(), 1);
    }

    #[test]
    fn clear_removes_everything() {
        let db = MemoryDatabase::with_items([item("a"), item("b")]);
        assert_eq!(db.len(), 2);
        db.clear().unwrap();
        assert!(db.get(&ObjectId::new("a")).unwrap().is_none());
    }

    #[test]
    fn calls_after_dispose_fail() {
        let db = MemoryDatabase::new();
        db.dispose().unwrap();
        db.dispose().unwrap();
        assert!(matches!(db.put_all(&[item("a")]), Err(StoreError::Disposed)));
        assert!(matches!(db.get_all(&[]), Err(StoreError::Disposed)));
    }
}
