use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use objloader_types::{Base, Item, ObjectId};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CacheError, CacheResult};

const BYTES_PER_MB: usize = 1024 * 1024;

/// Sizing and expiry for a [`MemoryCache`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Budget above which the sweeper starts evicting.
    pub max_size_in_mb: usize,
    /// Sliding expiry of an entry, and the sweep interval.
    pub ttl_ms: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_size_in_mb: 500,
            ttl_ms: 5000,
        }
    }
}

impl CacheOptions {
    pub fn max_size_bytes(&self) -> usize {
        self.max_size_in_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Outcome of one [`MemoryCache::sweep`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries removed.
    pub evicted: usize,
    /// Bytes released.
    pub freed_bytes: usize,
    /// Expired entries kept because something still references them.
    pub protected: usize,
    /// Budget in use after the sweep.
    pub remaining_bytes: usize,
}

struct CacheEntry {
    item: Item,
    expires_at: Instant,
    size: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ObjectId, CacheEntry>,
    references: HashMap<ObjectId, u64>,
    current_size: usize,
    disposed: bool,
}

/// Bounded, reference-aware in-memory cache of resolved items.
///
/// Every item added is scanned for `referencedId` occurrences. Each
/// occurrence bumps a per-id reference count, and ids seen for the first time
/// that are not cached yet are handed to the caller's request callback so they
/// get fetched. Reference counts are never decremented within a session.
///
/// Eviction only happens in [`sweep`](Self::sweep), and only once the budget
/// is exceeded: expired entries go first in ascending reference count, and an
/// entry anything still references is never evicted.
pub struct MemoryCache {
    state: Mutex<CacheState>,
    max_size: usize,
    ttl: Duration,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl MemoryCache {
    pub fn new(options: &CacheOptions) -> Self {
        Self::with_limits(options.max_size_bytes(), options.ttl())
    }

    /// A cache with an explicit byte budget and entry TTL.
    pub fn with_limits(max_size: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_size,
            ttl,
            sweeper: Mutex::new(None),
        }
    }

    /// Run [`sweep`](Self::sweep) every TTL on the current tokio runtime.
    ///
    /// The task holds only a weak reference and stops on disposal or once
    /// the cache is dropped.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().expect("lock poisoned");
        if sweeper.is_some() || self.ttl.is_zero() {
            return;
        }
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let cache = Arc::downgrade(self);
        let period = self.ttl;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        match cache.sweep() {
                            Ok(report) if report.evicted > 0 => debug!(
                                evicted = report.evicted,
                                freed_bytes = report.freed_bytes,
                                protected = report.protected,
                                "cache sweep"
                            ),
                            Ok(_) => {}
                            Err(_) => break,
                        }
                    }
                }
            }
        });
        *sweeper = Some((token, handle));
    }

    /// Insert an item, or refresh its expiry if it is already cached.
    ///
    /// `request` is called, after the cache lock is released, for every
    /// referenced id seen for the first time that is not cached.
    pub fn add(&self, item: Item, request: &mut dyn FnMut(&ObjectId)) -> CacheResult<()> {
        let mut to_request = Vec::new();
        {
            let mut guard = self.lock()?;
            let state = &mut *guard;
            let now = Instant::now();

            if let Some(entry) = state.entries.get_mut(&item.base_id) {
                entry.expires_at = now + self.ttl;
                return Ok(());
            }

            let size = item.estimated_size();
            let references = item.base.as_ref().map(Base::references).unwrap_or_default();
            state.current_size += size;
            state.entries.insert(
                item.base_id.clone(),
                CacheEntry {
                    item,
                    expires_at: now + self.ttl,
                    size,
                },
            );

            for id in references {
                let count = state.references.entry(id.clone()).or_insert(0);
                *count += 1;
                if *count == 1 && !state.entries.contains_key(&id) {
                    to_request.push(id);
                }
            }
        }

        for id in &to_request {
            request(id);
        }
        Ok(())
    }

    /// Look up an item, sliding its expiry forward.
    pub fn get(&self, id: &ObjectId) -> CacheResult<Option<Item>> {
        let mut state = self.lock()?;
        Ok(state.entries.get_mut(id).map(|entry| {
            entry.expires_at = Instant::now() + self.ttl;
            entry.item.clone()
        }))
    }

    /// Evict expired, unreferenced entries until back under budget.
    ///
    /// Does nothing while the cache is within its budget.
    pub fn sweep(&self) -> CacheResult<SweepReport> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let mut report = SweepReport::default();

        if state.current_size >= self.max_size {
            let now = Instant::now();
            let mut expired: Vec<(ObjectId, u64)> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(id, _)| (id.clone(), state.references.get(id).copied().unwrap_or(0)))
                .collect();
            expired.sort_by_key(|(_, refs)| *refs);

            for (id, refs) in expired {
                if state.current_size < self.max_size {
                    break;
                }
                if refs > 0 {
                    report.protected += 1;
                    continue;
                }
                if let Some(entry) = state.entries.remove(&id) {
                    state.current_size -= entry.size;
                    report.evicted += 1;
                    report.freed_bytes += entry.size;
                }
            }
        }

        report.remaining_bytes = state.current_size;
        Ok(report)
    }

    /// Bytes currently charged against the budget.
    pub fn current_size(&self) -> usize {
        self.state.lock().expect("lock poisoned").current_size
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.state.lock().expect("lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Times `id` has been seen as a reference.
    pub fn reference_count(&self, id: &ObjectId) -> u64 {
        self.state
            .lock()
            .expect("lock poisoned")
            .references
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Clear all state and stop the sweeper. Later `add`/`get` calls fail.
    pub fn dispose(&self) {
        if let Some((token, _handle)) = self.sweeper.lock().expect("lock poisoned").take() {
            token.cancel();
        }
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.disposed {
            info!(entries = state.entries.len(), bytes = state.current_size, "cache disposed");
        }
        *state = CacheState {
            disposed: true,
            ..CacheState::default()
        };
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, CacheState>> {
        let state = self.state.lock().expect("lock poisoned");
        if state.disposed {
            return Err(CacheError::Disposed("MemoryCache"));
        }
        Ok(state)
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some((token, _)) = sweeper.take() {
                token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, refs: &[&str]) -> Item {
        let children: Vec<_> = refs.iter().map(|r| json!({"referencedId": r})).collect();
        Item::new(Base::from_value(json!({"id": id, "children": children})).unwrap())
    }

    fn sized(id: &str, size: usize) -> Item {
        Item::with_size(Base::from_value(json!({"id": id})).unwrap(), size)
    }

    fn collect_requests(cache: &MemoryCache, item: Item) -> Vec<String> {
        let mut requested = Vec::new();
        cache
            .add(item, &mut |id| requested.push(id.to_string()))
            .unwrap();
        requested
    }

    #[test]
    fn options_defaults_and_toml() {
        let defaults = CacheOptions::default();
        assert_eq!(defaults.max_size_in_mb, 500);
        assert_eq!(defaults.ttl(), Duration::from_secs(5));
        let parsed: CacheOptions = toml::from_str("max_size_in_mb = 1").unwrap();
        assert_eq!(parsed.max_size_bytes(), 1024 * 1024);
        assert_eq!(parsed.ttl_ms, 5000);
    }

    #[test]
    fn add_requests_new_references_once() {
        let cache = MemoryCache::with_limits(usize::MAX, Duration::from_secs(60));
        assert_eq!(collect_requests(&cache, item("root", &["a", "b", "a"])), ["a", "b"]);
        assert_eq!(cache.reference_count(&ObjectId::new("a")), 2);
        // Seen before: no second request.
        assert!(collect_requests(&cache, item("other", &["a"])).is_empty());
        assert_eq!(cache.reference_count(&ObjectId::new("a")), 3);
    }

    #[test]
    fn cached_references_are_not_requested() {
        let cache = MemoryCache::with_limits(usize::MAX, Duration::from_secs(60));
        collect_requests(&cache, item("a", &[]));
        assert!(collect_requests(&cache, item("root", &["a"])).is_empty());
    }

    #[test]
    fn re_add_does_not_double_charge() {
        let cache = MemoryCache::with_limits(usize::MAX, Duration::from_secs(60));
        collect_requests(&cache, sized("a", 100));
        collect_requests(&cache, sized("a", 100));
        assert_eq!(cache.current_size(), 100);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_is_noop_under_budget() {
        let cache = MemoryCache::with_limits(1000, Duration::ZERO);
        collect_requests(&cache, sized("a", 10));
        let report = cache.sweep().unwrap();
        assert_eq!(report.evicted, 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_evicts_until_under_budget_and_protects_referenced() {
        let mb = 1024 * 1024;
        let cache = MemoryCache::with_limits(mb, Duration::ZERO);
        // 2 MB of unreferenced entries.
        for i in 0..32 {
            collect_requests(&cache, sized(&format!("free{i}"), 64 * 1024));
        }
        // A referenced entry: "pinned" is referenced by "holder".
        collect_requests(&cache, item("holder", &["pinned"]));
        collect_requests(&cache, sized("pinned", 64 * 1024));
        assert!(cache.current_size() >= 2 * mb);

        let report = cache.sweep().unwrap();
        assert!(report.evicted > 0);
        assert!(cache.current_size() < mb);
        assert_eq!(report.remaining_bytes, cache.current_size());
        assert!(cache.get(&ObjectId::new("pinned")).unwrap().is_some());
    }

    #[test]
    fn referenced_entries_survive_even_over_budget() {
        let cache = MemoryCache::with_limits(10, Duration::ZERO);
        collect_requests(&cache, item("holder", &["pinned"]));
        collect_requests(&cache, sized("pinned", 100));
        let report = cache.sweep().unwrap();
        assert!(report.protected >= 1);
        assert!(cache.get(&ObjectId::new("pinned")).unwrap().is_some());
    }

    #[test]
    fn unexpired_entries_are_kept() {
        let cache = MemoryCache::with_limits(10, Duration::from_secs(60));
        collect_requests(&cache, sized("fresh", 100));
        assert_eq!(cache.sweep().unwrap().evicted, 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn calls_after_dispose_fail_loudly() {
        let cache = MemoryCache::with_limits(10, Duration::from_secs(1));
        collect_requests(&cache, sized("a", 1));
        cache.dispose();
        assert_eq!(cache.len(), 0);
        assert_eq!(
            cache.get(&ObjectId::new("a")).unwrap_err(),
            CacheError::Disposed("MemoryCache")
        );
        assert!(cache.add(sized("b", 1), &mut |_| {}).is_err());
        cache.dispose();
    }

    #[tokio::test]
    async fn sweeper_runs_and_stops_on_dispose() {
        let cache = Arc::new(MemoryCache::with_limits(1, Duration::from_millis(10)));
        cache.start_sweeper();
        cache.add(sized("a", 100), &mut |_| {}).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.is_empty());
        cache.dispose();
        assert!(cache.sweeper.lock().unwrap().is_none());
    }
}
