use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use objloader_cache::{CacheError, Deferment, DefermentManager};
use objloader_download::DownloadError;
use objloader_queue::{BatchingOptions, BatchingQueue, Queue};
use objloader_store::Database;
use objloader_types::{Base, Item, ObjectId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{SdkError, SdkResult};
use crate::options::ReadOptions;
use crate::worker::{ReadJob, WorkerHost, WORKER_BATCH, WORKER_POLL};

/// Resolves ids from the local store.
///
/// Store hits go to `found` (after waking anyone waiting on them); misses go
/// to `not_found`, which is normally the downloader. At most one lookup per id
/// is outstanding at a time.
#[async_trait]
pub trait CacheReader: Send + Sync {
    /// Wire the reader's outputs. Must be called once before requests.
    fn initialize_queue(
        &self,
        found: Arc<dyn Queue<Item>>,
        not_found: Arc<dyn Queue<ObjectId>>,
    ) -> SdkResult<()>;

    /// Ask for an id. Repeated requests are ignored.
    fn request_item(&self, id: &ObjectId);

    fn request_all(&self, ids: &[ObjectId]) {
        for id in ids {
            self.request_item(id);
        }
    }

    /// Resolve one object, waiting for it if necessary.
    async fn get_object(&self, id: &ObjectId) -> SdkResult<Base>;

    async fn dispose_async(&self);
}

#[derive(Default)]
struct Requested(Mutex<HashSet<ObjectId>>);

impl Requested {
    /// True the first time `id` is seen.
    fn claim(&self, id: &ObjectId) -> bool {
        self.0.lock().expect("lock poisoned").insert(id.clone())
    }
}

/// Ask for `id` once for the life of the reader, unless it is already in
/// flight for someone else.
fn request(
    requested: &Requested,
    deferments: &DefermentManager,
    queue: &OnceLock<BatchingQueue<ObjectId, SdkError>>,
    id: &ObjectId,
) {
    if requested.claim(id) && deferments.begin_fetch(id) {
        push(queue, id.clone());
    }
}

/// Wait for `id`. Only the first waiter of an id with nothing in flight
/// schedules a lookup, so an evicted object is fetched again.
async fn resolve(
    requested: &Requested,
    deferments: &DefermentManager,
    queue: &OnceLock<BatchingQueue<ObjectId, SdkError>>,
    id: &ObjectId,
) -> SdkResult<Base> {
    match deferments.defer(id)? {
        Deferment::Cached(base) => Ok(base),
        Deferment::Pending { first, base } => {
            if first {
                requested.claim(id);
                push(queue, id.clone());
            }
            base.await_base().await.map_err(|e| match e {
                CacheError::Decode { id, reason } => DownloadError::Decode {
                    id: id.into_string(),
                    reason,
                }
                .into(),
                e => e.into(),
            })
        }
    }
}

fn deliver_hit(
    deferments: &DefermentManager,
    item: Item,
    found: &dyn Queue<Item>,
    request: &mut dyn FnMut(&ObjectId),
) {
    if let Err(e) = deferments.undefer(item.clone(), request) {
        debug!(id = %item.base_id, error = %e, "not undeferring store hit");
    }
    found.add(item);
}

fn push(queue: &OnceLock<BatchingQueue<ObjectId, SdkError>>, id: ObjectId) {
    match queue.get() {
        Some(queue) => queue.add(id),
        None => error!(id = %id, "cache reader queue is not initialized; dropping request"),
    }
}

// ---- Inline ----

/// Reads the store on the async runtime, in batches.
pub struct InlineCacheReader {
    database: Arc<dyn Database>,
    deferments: Arc<DefermentManager>,
    options: ReadOptions,
    requested: Requested,
    queue: OnceLock<BatchingQueue<ObjectId, SdkError>>,
    me: Weak<Self>,
}

impl InlineCacheReader {
    pub fn new(
        database: Arc<dyn Database>,
        deferments: Arc<DefermentManager>,
        options: ReadOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            database,
            deferments,
            options,
            requested: Requested::default(),
            queue: OnceLock::new(),
            me: me.clone(),
        })
    }

    async fn read_batch(
        &self,
        batch: Vec<ObjectId>,
        found: &dyn Queue<Item>,
        not_found: &dyn Queue<ObjectId>,
    ) -> SdkResult<()> {
        let database = Arc::clone(&self.database);
        let keys = batch.clone();
        let stored = tokio::task::spawn_blocking(move || database.get_all(&keys)).await??;

        let mut hits = 0usize;
        for (id, item) in batch.into_iter().zip(stored) {
            match item {
                Some(item) => {
                    hits += 1;
                    deliver_hit(&self.deferments, item, found, &mut |id| self.request_item(id));
                }
                None => not_found.add(id),
            }
        }
        debug!(hits, "cache read batch");
        Ok(())
    }
}

#[async_trait]
impl CacheReader for InlineCacheReader {
    fn initialize_queue(
        &self,
        found: Arc<dyn Queue<Item>>,
        not_found: Arc<dyn Queue<ObjectId>>,
    ) -> SdkResult<()> {
        let me = self.me.clone();
        let queue = BatchingQueue::new(
            BatchingOptions::new("cache-read", self.options.batch_size, self.options.max_wait),
            move |batch: Vec<ObjectId>| {
                let me = me.clone();
                let found = Arc::clone(&found);
                let not_found = Arc::clone(&not_found);
                async move {
                    match me.upgrade() {
                        Some(reader) => reader.read_batch(batch, &*found, &*not_found).await,
                        None => Ok(()),
                    }
                }
            },
        );
        self.queue
            .set(queue)
            .map_err(|_| SdkError::AlreadyInitialized("cache reader"))
    }

    fn request_item(&self, id: &ObjectId) {
        request(&self.requested, &self.deferments, &self.queue, id);
    }

    async fn get_object(&self, id: &ObjectId) -> SdkResult<Base> {
        resolve(&self.requested, &self.deferments, &self.queue, id).await
    }

    async fn dispose_async(&self) {
        if let Some(queue) = self.queue.get() {
            queue.dispose_async().await;
        }
    }
}

// ---- Worker ----

/// Reads the store on a background thread.
///
/// Ids cross to the worker on a string ring; items come back on an item
/// ring. A returned placeholder means "not stored" and is forwarded to
/// `not_found`.
pub struct WorkerCacheReader {
    deferments: Arc<DefermentManager>,
    options: ReadOptions,
    requested: Requested,
    host: Arc<WorkerHost<ReadJob>>,
    queue: OnceLock<BatchingQueue<ObjectId, SdkError>>,
    pump: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    me: Weak<Self>,
}

impl WorkerCacheReader {
    /// Start the worker. Fails if the worker cannot attach to its rings.
    pub fn spawn(
        database: Arc<dyn Database>,
        deferments: Arc<DefermentManager>,
        options: ReadOptions,
        capacity: usize,
    ) -> SdkResult<Arc<Self>> {
        let host = Arc::new(WorkerHost::spawn(ReadJob::new(database), capacity)?);
        Ok(Arc::new_cyclic(|me| Self {
            deferments,
            options,
            requested: Requested::default(),
            host,
            queue: OnceLock::new(),
            pump: Mutex::new(None),
            me: me.clone(),
        }))
    }

    fn deliver(&self, items: Vec<Item>, found: &dyn Queue<Item>, not_found: &dyn Queue<ObjectId>) {
        for item in items {
            if item.is_resolved() {
                deliver_hit(&self.deferments, item, found, &mut |id| self.request_item(id));
            } else {
                not_found.add(item.base_id);
            }
        }
    }
}

async fn pump_responses(
    me: Weak<WorkerCacheReader>,
    host: Arc<WorkerHost<ReadJob>>,
    found: Arc<dyn Queue<Item>>,
    not_found: Arc<dyn Queue<ObjectId>>,
    token: CancellationToken,
) {
    loop {
        let items = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            items = host.responses().dequeue_async(WORKER_BATCH, WORKER_POLL) => items,
        };
        if items.is_empty() {
            continue;
        }
        let Some(reader) = me.upgrade() else {
            break;
        };
        reader.deliver(items, &*found, &*not_found);
    }
    debug!("cache read pump stopped");
}

#[async_trait]
impl CacheReader for WorkerCacheReader {
    fn initialize_queue(
        &self,
        found: Arc<dyn Queue<Item>>,
        not_found: Arc<dyn Queue<ObjectId>>,
    ) -> SdkResult<()> {
        let host = Arc::clone(&self.host);
        let queue = BatchingQueue::new(
            BatchingOptions::new("cache-read", self.options.batch_size, self.options.max_wait),
            move |batch: Vec<ObjectId>| {
                let host = Arc::clone(&host);
                async move {
                    let ids: Vec<String> = batch.into_iter().map(ObjectId::into_string).collect();
                    host.send(&ids).await
                }
            },
        );
        self.queue
            .set(queue)
            .map_err(|_| SdkError::AlreadyInitialized("cache reader"))?;

        let token = CancellationToken::new();
        let task = tokio::spawn(pump_responses(
            self.me.clone(),
            Arc::clone(&self.host),
            found,
            not_found,
            token.clone(),
        ));
        *self.pump.lock().expect("lock poisoned") = Some((token, task));
        Ok(())
    }

    fn request_item(&self, id: &ObjectId) {
        request(&self.requested, &self.deferments, &self.queue, id);
    }

    async fn get_object(&self, id: &ObjectId) -> SdkResult<Base> {
        resolve(&self.requested, &self.deferments, &self.queue, id).await
    }

    async fn dispose_async(&self) {
        if let Some(queue) = self.queue.get() {
            queue.dispose_async().await;
        }
        let host = Arc::clone(&self.host);
        if let Err(e) = tokio::task::spawn_blocking(move || host.shutdown()).await {
            error!(error = %e, "read worker shutdown failed");
        }
        let pump = self.pump.lock().expect("lock poisoned").take();
        if let Some((token, task)) = pump {
            token.cancel();
            if let Err(e) = task.await {
                error!(error = %e, "cache read pump failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use objloader_cache::MemoryCache;
    use objloader_queue::AsyncQueue;
    use objloader_store::MemoryDatabase;
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(5);

    fn base(id: &str) -> Base {
        Base::from_value(json!({"id": id, "child": {"referencedId": format!("{id}-child")}})).unwrap()
    }

    fn deferments() -> Arc<DefermentManager> {
        Arc::new(DefermentManager::new(Arc::new(MemoryCache::with_limits(
            usize::MAX,
            Duration::from_secs(60),
        ))))
    }

    fn database() -> Arc<dyn Database> {
        Arc::new(MemoryDatabase::with_items([Item::new(base("stored"))]))
    }

    fn options() -> ReadOptions {
        ReadOptions {
            batch_size: 10,
            max_wait: Duration::from_millis(5),
        }
    }

    struct Outputs {
        found: Arc<AsyncQueue<Item>>,
        not_found: Arc<AsyncQueue<ObjectId>>,
    }

    fn wire(reader: &dyn CacheReader) -> Outputs {
        let outputs = Outputs {
            found: Arc::new(AsyncQueue::new()),
            not_found: Arc::new(AsyncQueue::new()),
        };
        reader
            .initialize_queue(outputs.found.clone(), outputs.not_found.clone())
            .unwrap();
        outputs
    }

    async fn next<T>(queue: &AsyncQueue<T>) -> T {
        tokio::time::timeout(WAIT, queue.next())
            .await
            .expect("timed out")
            .expect("queue finished")
    }

    async fn hits_and_misses(reader: Arc<dyn CacheReader>, dm: Arc<DefermentManager>) {
        let out = wire(&*reader);
        reader.request_all(&[ObjectId::new("stored"), ObjectId::new("missing")]);
        reader.request_item(&ObjectId::new("missing"));

        assert_eq!(next(&out.found).await.base_id.as_str(), "stored");
        assert_eq!(next(&out.not_found).await.as_str(), "missing");
        // A hit lands in the cache and its references are requested.
        assert!(dm.defer(&ObjectId::new("stored")).unwrap().was_cached());
        assert_eq!(next(&out.not_found).await.as_str(), "stored-child");

        reader.dispose_async().await;
        assert!(out.not_found.is_empty());
    }

    #[tokio::test]
    async fn inline_reader_splits_hits_and_misses() {
        let dm = deferments();
        let reader = InlineCacheReader::new(database(), dm.clone(), options());
        hits_and_misses(reader, dm).await;
    }

    #[tokio::test]
    async fn worker_reader_splits_hits_and_misses() {
        let dm = deferments();
        let reader = WorkerCacheReader::spawn(database(), dm.clone(), options(), 4096).unwrap();
        hits_and_misses(reader, dm).await;
    }

    #[tokio::test]
    async fn get_object_waits_for_download() {
        let dm = deferments();
        let reader = InlineCacheReader::new(database(), dm.clone(), options());
        let out = wire(&*reader);

        let waiting = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.get_object(&ObjectId::new("remote")).await })
        };
        assert_eq!(next(&out.not_found).await.as_str(), "remote");
        dm.undefer(Item::new(base("remote")), &mut |_| {}).unwrap();

        let resolved = waiting.await.unwrap().unwrap();
        assert_eq!(resolved.id(), "remote");
        reader.dispose_async().await;
    }

    #[tokio::test]
    async fn requested_id_is_not_looked_up_again_while_in_flight() {
        let dm = deferments();
        let reader = InlineCacheReader::new(database(), dm.clone(), options());
        let out = wire(&*reader);

        reader.request_item(&ObjectId::new("remote"));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let reader = Arc::clone(&reader);
                tokio::spawn(async move { reader.get_object(&ObjectId::new("remote")).await })
            })
            .collect();
        assert_eq!(next(&out.not_found).await.as_str(), "remote");
        // Let the waiters register before the download lands.
        tokio::time::sleep(Duration::from_millis(50)).await;
        dm.undefer(Item::new(base("remote")), &mut |_| {}).unwrap();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap().id(), "remote");
        }
        reader.dispose_async().await;
        assert!(out.not_found.is_empty());
    }

    #[tokio::test]
    async fn waiter_lookup_satisfies_later_request() {
        let dm = deferments();
        let reader = WorkerCacheReader::spawn(database(), dm.clone(), options(), 4096).unwrap();
        let out = wire(&*reader);

        let waiting = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.get_object(&ObjectId::new("remote")).await })
        };
        assert_eq!(next(&out.not_found).await.as_str(), "remote");
        reader.request_all(&[ObjectId::new("remote"), ObjectId::new("remote")]);
        dm.undefer(Item::new(base("remote")), &mut |_| {}).unwrap();

        assert_eq!(waiting.await.unwrap().unwrap().id(), "remote");
        reader.dispose_async().await;
        assert!(out.not_found.is_empty());
    }

    #[tokio::test]
    async fn decode_failure_is_returned_to_waiter() {
        let dm = deferments();
        let reader = InlineCacheReader::new(database(), dm.clone(), options());
        let out = wire(&*reader);

        let waiting = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.get_object(&ObjectId::new("bad")).await })
        };
        assert_eq!(next(&out.not_found).await.as_str(), "bad");
        dm.undefer(Item::failed("bad", "EOF while parsing"), &mut |_| {}).unwrap();

        let err = waiting.await.unwrap().unwrap_err();
        assert!(
            matches!(
                err,
                SdkError::Download(DownloadError::Decode { ref id, ref reason })
                    if id == "bad" && reason == "EOF while parsing"
            ),
            "unexpected error: {err}"
        );
        reader.dispose_async().await;
    }

    #[tokio::test]
    async fn get_object_from_store() {
        let dm = deferments();
        let reader = InlineCacheReader::new(database(), dm, options());
        let _out = wire(&*reader);
        let stored = tokio::time::timeout(WAIT, reader.get_object(&ObjectId::new("stored")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id(), "stored");
        reader.dispose_async().await;
    }

    #[tokio::test]
    async fn initializes_once() {
        let reader = InlineCacheReader::new(database(), deferments(), options());
        let _out = wire(&*reader);
        let again = reader.initialize_queue(
            Arc::new(AsyncQueue::<Item>::new()),
            Arc::new(AsyncQueue::<ObjectId>::new()),
        );
        assert!(matches!(again, Err(SdkError::AlreadyInitialized(_))));
        reader.dispose_async().await;
    }
}
