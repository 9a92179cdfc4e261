use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use objloader_cache::DefermentManager;
use objloader_queue::{BatchingOptions, BatchingQueue, Queue};
use objloader_store::Database;
use objloader_types::{Item, ObjectId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{SdkError, SdkResult};
use crate::options::WriteOptions;
use crate::worker::{WorkerHost, WriteJob, WORKER_BATCH, WORKER_POLL};

/// Called with every id discovered inside a newly resolved item.
pub type RequestItem = Arc<dyn Fn(&ObjectId) + Send + Sync>;

/// Receives downloaded items: wakes their waiters and persists them.
///
/// `add` never blocks. Producers should pause while
/// [`is_saturated`](Queue::is_saturated) reports a full write queue.
#[async_trait]
pub trait CacheWriter: Queue<Item> {
    /// Items handed to the store so far.
    fn written(&self) -> usize;

    /// Persist everything accepted so far and stop.
    async fn dispose_async(&self);
}

fn undefer(deferments: &DefermentManager, request: &RequestItem, item: &Item) {
    if let Err(e) = deferments.undefer(item.clone(), &mut |id| request(id)) {
        debug!(id = %item.base_id, error = %e, "not undeferring written item");
    }
}

fn write_batching(options: &WriteOptions) -> BatchingOptions {
    BatchingOptions::new("cache-write", options.batch_size, options.max_wait)
        .with_max_queue_size(options.max_queue_size)
}

// ---- Inline ----

/// Writes to the store from the async runtime, in batches.
pub struct InlineCacheWriter {
    deferments: Arc<DefermentManager>,
    request: RequestItem,
    queue: BatchingQueue<Item, SdkError>,
    written: Arc<AtomicUsize>,
}

impl InlineCacheWriter {
    pub fn new(
        database: Arc<dyn Database>,
        deferments: Arc<DefermentManager>,
        request: RequestItem,
        options: WriteOptions,
    ) -> Self {
        let written = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&written);
        let queue = BatchingQueue::new(write_batching(&options), move |batch: Vec<Item>| {
            let database = Arc::clone(&database);
            let counter = Arc::clone(&counter);
            async move {
                let count = batch.len();
                tokio::task::spawn_blocking(move || database.put_all(&batch)).await??;
                counter.fetch_add(count, Ordering::AcqRel);
                debug!(count, "cache write batch");
                Ok::<(), SdkError>(())
            }
        });
        Self {
            deferments,
            request,
            queue,
            written,
        }
    }
}

impl Queue<Item> for InlineCacheWriter {
    fn add(&self, item: Item) {
        undefer(&self.deferments, &self.request, &item);
        if item.is_resolved() {
            self.queue.add(item);
        }
    }

    fn is_saturated(&self) -> bool {
        self.queue.is_saturated()
    }
}

#[async_trait]
impl CacheWriter for InlineCacheWriter {
    fn written(&self) -> usize {
        self.written.load(Ordering::Acquire)
    }

    async fn dispose_async(&self) {
        self.queue.dispose_async().await;
        if let Some(e) = self.queue.take_error() {
            error!(error = %e, "cache writes failed");
        }
    }
}

// ---- Worker ----

/// Writes to the store on a background thread.
///
/// Items cross to the worker on an item ring; the worker acknowledges the
/// ids it stored on a string ring.
pub struct WorkerCacheWriter {
    deferments: Arc<DefermentManager>,
    request: RequestItem,
    host: Arc<WorkerHost<WriteJob>>,
    queue: BatchingQueue<Item, SdkError>,
    written: Arc<AtomicUsize>,
    acks: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl WorkerCacheWriter {
    /// Start the worker. Fails if the worker cannot attach to its rings.
    pub fn spawn(
        database: Arc<dyn Database>,
        deferments: Arc<DefermentManager>,
        request: RequestItem,
        options: WriteOptions,
        capacity: usize,
    ) -> SdkResult<Self> {
        let host = Arc::new(WorkerHost::spawn(WriteJob::new(database), capacity)?);

        let sender = Arc::clone(&host);
        let queue = BatchingQueue::new(write_batching(&options), move |batch: Vec<Item>| {
            let host = Arc::clone(&sender);
            async move { host.send(&batch).await }
        });

        let written = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let task = tokio::spawn(count_acks(
            Arc::clone(&host),
            Arc::clone(&written),
            token.clone(),
        ));

        Ok(Self {
            deferments,
            request,
            host,
            queue,
            written,
            acks: Mutex::new(Some((token, task))),
        })
    }
}

async fn count_acks(
    host: Arc<WorkerHost<WriteJob>>,
    written: Arc<AtomicUsize>,
    token: CancellationToken,
) {
    loop {
        let acks = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            acks = host.responses().dequeue_async(WORKER_BATCH, WORKER_POLL) => acks,
        };
        written.fetch_add(acks.len(), Ordering::AcqRel);
    }
}

impl Queue<Item> for WorkerCacheWriter {
    fn add(&self, item: Item) {
        undefer(&self.deferments, &self.request, &item);
        if item.is_resolved() {
            self.queue.add(item);
        }
    }

    fn is_saturated(&self) -> bool {
        self.queue.is_saturated()
    }
}

#[async_trait]
impl CacheWriter for WorkerCacheWriter {
    fn written(&self) -> usize {
        self.written.load(Ordering::Acquire)
    }

    async fn dispose_async(&self) {
        self.queue.dispose_async().await;
        if let Some(e) = self.queue.take_error() {
            error!(error = %e, "cache writes failed");
        }

        let host = Arc::clone(&self.host);
        if let Err(e) = tokio::task::spawn_blocking(move || host.shutdown()).await {
            error!(error = %e, "write worker shutdown failed");
        }

        let acks = self.acks.lock().expect("lock poisoned").take();
        if let Some((token, task)) = acks {
            token.cancel();
            if let Err(e) = task.await {
                error!(error = %e, "write acknowledgement task failed");
            }
        }
        let late = self.host.responses().dequeue(usize::MAX, Duration::ZERO).len();
        self.written.fetch_add(late, Ordering::AcqRel);
        debug!(written = self.written(), "cache writer disposed");
    }
}
