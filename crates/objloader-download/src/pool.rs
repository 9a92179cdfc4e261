use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use objloader_queue::{BatchingOptions, BatchingQueue, Queue};
use objloader_types::{Item, ObjectId};
use tracing::{debug, error};

use crate::error::{DownloadError, DownloadResult};
use crate::traits::PoolOptions;

/// Graphs up to this size are fetched in a single batch.
pub const SMALL_GRAPH_THRESHOLD: usize = 50;
/// Batch size for anything larger.
pub const LARGE_BATCH_SIZE: usize = 10_000;
/// Yield to the scheduler after this many delivered items.
pub const YIELD_EVERY: usize = 1000;

const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);

/// Batch size for a pool expecting `total` objects.
pub fn batch_size_for(total: usize) -> usize {
    if total <= SMALL_GRAPH_THRESHOLD {
        total.max(1)
    } else {
        LARGE_BATCH_SIZE
    }
}

type IdQueue = BatchingQueue<ObjectId, DownloadError>;

enum PoolState {
    Idle,
    Running(Arc<IdQueue>),
    Disposed,
}

/// The batch pool shared by every downloader.
///
/// A failing batch retains its error here and finishes the results queue
/// before the batch returns, so a consumer that sees the end of the results
/// can always read the error.
pub(crate) struct Pool {
    name: &'static str,
    state: Mutex<PoolState>,
    error: Arc<Mutex<Option<DownloadError>>>,
}

impl Pool {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(PoolState::Idle),
            error: Arc::new(Mutex::new(None)),
        }
    }

    /// Start batching. `fetch` downloads one batch into `results`.
    pub(crate) fn start<F, Fut>(
        &self,
        results: Arc<dyn Queue<Item>>,
        options: PoolOptions,
        fetch: F,
    ) -> DownloadResult<()>
    where
        F: Fn(Arc<dyn Queue<Item>>, Vec<ObjectId>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DownloadResult<()>> + Send + 'static,
    {
        let mut state = self.state.lock().expect("lock poisoned");
        match *state {
            PoolState::Idle => {}
            PoolState::Running(_) => return Err(DownloadError::AlreadyInitialized),
            PoolState::Disposed => return Err(DownloadError::Disposed),
        }

        let batch_size = batch_size_for(options.total);
        let retained = Arc::clone(&self.error);
        let fetch = Arc::new(fetch);
        let queue = BatchingQueue::new(
            BatchingOptions::new(self.name, batch_size, options.max_wait),
            move |batch: Vec<ObjectId>| {
                let fetch = Arc::clone(&fetch);
                let results = Arc::clone(&results);
                let retained = Arc::clone(&retained);
                async move {
                    let result = (*fetch)(Arc::clone(&results), batch).await;
                    if let Err(e) = &result {
                        retained
                            .lock()
                            .expect("lock poisoned")
                            .get_or_insert_with(|| e.clone());
                        results.finish();
                    }
                    result
                }
            },
        );
        debug!(pool = self.name, total = options.total, batch_size, "download pool started");
        *state = PoolState::Running(Arc::new(queue));
        Ok(())
    }

    pub(crate) fn add(&self, id: ObjectId) {
        let queue = match &*self.state.lock().expect("lock poisoned") {
            PoolState::Running(queue) => Arc::clone(queue),
            PoolState::Idle => {
                error!(pool = self.name, id = %id, "download pool is not initialized; dropping id");
                return;
            }
            PoolState::Disposed => {
                debug!(pool = self.name, id = %id, "add after dispose; dropping id");
                return;
            }
        };
        queue.add(id);
    }

    pub(crate) fn take_error(&self) -> Option<DownloadError> {
        self.error.lock().expect("lock poisoned").take()
    }

    pub(crate) async fn dispose(&self) {
        let previous = std::mem::replace(
            &mut *self.state.lock().expect("lock poisoned"),
            PoolState::Disposed,
        );
        if let PoolState::Running(queue) = previous {
            queue.dispose_async().await;
            debug!(pool = self.name, "download pool disposed");
        }
    }
}

/// Pushes items to a results queue, waiting while it is saturated and
/// yielding every [`YIELD_EVERY`] items.
pub(crate) struct Delivery<'a> {
    results: &'a dyn Queue<Item>,
    delivered: usize,
}

impl<'a> Delivery<'a> {
    pub(crate) fn new(results: &'a dyn Queue<Item>) -> Self {
        Self {
            results,
            delivered: 0,
        }
    }

    pub(crate) async fn send(&mut self, item: Item) {
        while self.results.is_saturated() {
            tokio::time::sleep(BACKPRESSURE_POLL).await;
        }
        self.results.add(item);
        self.delivered += 1;
        if self.delivered % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
    }

    pub(crate) fn delivered(&self) -> usize {
        self.delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_graphs_use_one_batch() {
        assert_eq!(batch_size_for(0), 1);
        assert_eq!(batch_size_for(3), 3);
        assert_eq!(batch_size_for(SMALL_GRAPH_THRESHOLD), SMALL_GRAPH_THRESHOLD);
        assert_eq!(batch_size_for(SMALL_GRAPH_THRESHOLD + 1), LARGE_BATCH_SIZE);
    }
}
