use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use objloader_types::{Base, Item, ObjectId};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::memory::MemoryCache;

const NAME: &str = "DefermentManager";

type Waiter = oneshot::Sender<CacheResult<Base>>;

/// Result of asking for an object.
#[derive(Debug)]
pub enum Deferment {
    /// Already cached; no waiter was registered.
    Cached(Base),
    /// Not cached yet. `first` is true only for the request that created the
    /// pending entry, and that caller must issue the one fetch for the id.
    Pending { first: bool, base: DeferredBase },
}

impl Deferment {
    /// Resolve to the base, waiting if necessary.
    pub async fn resolve(self) -> CacheResult<Base> {
        match self {
            Self::Cached(base) => Ok(base),
            Self::Pending { base, .. } => base.await_base().await,
        }
    }

    pub fn was_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}

/// A base that will arrive later.
#[derive(Debug)]
pub struct DeferredBase(oneshot::Receiver<CacheResult<Base>>);

impl DeferredBase {
    /// Wait for the base. Fails with `Disposed` if the manager is torn down first.
    pub async fn await_base(self) -> CacheResult<Base> {
        match self.0.await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Disposed(NAME)),
        }
    }
}

/// Tracks who is waiting for which object.
///
/// Guarantees at most one outstanding fetch per id: the first `defer` of an
/// uncached id is told to fetch, later ones just join the waiter list. Fetches
/// started without a waiter are registered with [`begin_fetch`](Self::begin_fetch)
/// so a later `defer` joins them instead of fetching again. An id stays
/// outstanding until it is undeferred.
pub struct DefermentManager {
    cache: Arc<MemoryCache>,
    outstanding: Mutex<HashMap<ObjectId, Vec<Waiter>>>,
    disposed: AtomicBool,
}

impl DefermentManager {
    pub fn new(cache: Arc<MemoryCache>) -> Self {
        Self {
            cache,
            outstanding: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    /// Ask for `id`: answered synchronously from the cache when possible.
    pub fn defer(&self, id: &ObjectId) -> CacheResult<Deferment> {
        self.check_open()?;
        // Waiter table stays locked across the cache check: `undefer` fills
        // the cache before it takes this lock.
        let mut outstanding = self.outstanding.lock().expect("lock poisoned");
        if let Some(base) = self.cache.get(id)?.and_then(|item| item.base) {
            return Ok(Deferment::Cached(base));
        }

        let (tx, rx) = oneshot::channel();
        let first = match outstanding.entry(id.clone()) {
            Entry::Occupied(mut waiters) => {
                waiters.get_mut().push(tx);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![tx]);
                true
            }
        };
        Ok(Deferment::Pending {
            first,
            base: DeferredBase(rx),
        })
    }

    /// Mark `id` as being fetched without waiting for it.
    ///
    /// Returns true when the caller should issue the fetch: the id is neither
    /// cached nor already outstanding.
    pub fn begin_fetch(&self, id: &ObjectId) -> bool {
        if self.check_open().is_err() {
            return false;
        }
        let mut outstanding = self.outstanding.lock().expect("lock poisoned");
        if matches!(self.cache.get(id), Ok(Some(_))) {
            return false;
        }
        match outstanding.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Vec::new());
                true
            }
        }
    }

    /// Deliver a resolved item.
    ///
    /// The item is added to the cache (which calls `request` for newly
    /// discovered references), then everyone waiting on it is woken. An item
    /// without a base wakes its waiters with `NotFound`, or with `Decode` when
    /// the source could not decode it.
    pub fn undefer(&self, item: Item, request: &mut dyn FnMut(&ObjectId)) -> CacheResult<()> {
        self.check_open()?;
        let id = item.base_id.clone();

        let Some(base) = item.base.clone() else {
            let failure = match item.error {
                Some(reason) => {
                    warn!(id = %id, reason = %reason, "object failed to decode");
                    CacheError::Decode { id: id.clone(), reason }
                }
                None => {
                    warn!(id = %id, "undefer called with no base");
                    CacheError::NotFound(id.clone())
                }
            };
            self.resolve(&id, Err(failure));
            return Ok(());
        };

        self.cache.add(item, request)?;
        self.resolve(&id, Ok(base));
        Ok(())
    }

    /// Ids with a fetch or a waiter outstanding.
    pub fn pending_count(&self) -> usize {
        self.outstanding.lock().expect("lock poisoned").len()
    }

    /// Drop every waiter. Their futures fail with `Disposed`.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut outstanding = self.outstanding.lock().expect("lock poisoned");
        if !outstanding.is_empty() {
            debug!(pending = outstanding.len(), "dropping outstanding deferments");
        }
        outstanding.clear();
    }

    fn resolve(&self, id: &ObjectId, result: CacheResult<Base>) {
        let waiters = self.outstanding.lock().expect("lock poisoned").remove(id);
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(result.clone());
        }
    }

    fn check_open(&self) -> CacheResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CacheError::Disposed(NAME));
        }
        Ok(())
    }
}
