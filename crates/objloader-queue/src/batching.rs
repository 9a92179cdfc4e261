use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::QueueError;
use crate::traits::Queue;

/// When a [`BatchingQueue`] flushes and when it reports saturation.
#[derive(Clone, Debug)]
pub struct BatchingOptions {
    /// Label used in logs.
    pub name: &'static str,
    /// Flush as soon as this many items are waiting.
    pub batch_size: usize,
    /// Flush this long after the first item of a batch arrived.
    pub max_wait: Duration,
    /// Report saturation once this many accepted items are not yet processed.
    pub max_queue_size: Option<usize>,
}

impl BatchingOptions {
    pub fn new(name: &'static str, batch_size: usize, max_wait: Duration) -> Self {
        Self {
            name,
            batch_size: batch_size.max(1),
            max_wait,
            max_queue_size: None,
        }
    }

    pub fn with_max_queue_size(mut self, max: usize) -> Self {
        self.max_queue_size = Some(max);
        self
    }
}

/// Groups items into batches and hands each batch to an async processor.
///
/// A batch is flushed when it reaches `batch_size` or when `max_wait` has
/// passed since its first item, whichever comes first. Flushes run one at a
/// time on a background task; empty batches are never flushed. A failing
/// batch is logged, the first failure is kept for [`take_error`](Self::take_error),
/// and later batches still run.
pub struct BatchingQueue<T, E = QueueError> {
    options: BatchingOptions,
    sender: mpsc::UnboundedSender<T>,
    /// Accepted but not yet processed.
    pending: Arc<AtomicUsize>,
    error: Arc<Mutex<Option<E>>>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<T, E> BatchingQueue<T, E>
where
    T: Send + 'static,
    E: Display + Send + 'static,
{
    /// Start the queue on the current tokio runtime.
    pub fn new<F, Fut>(options: BatchingOptions, process: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let error = Arc::new(Mutex::new(None));
        let token = CancellationToken::new();

        let worker = BatchWorker {
            name: options.name,
            batch_size: options.batch_size,
            max_wait: options.max_wait,
            receiver,
            process,
            pending: Arc::clone(&pending),
            error: Arc::clone(&error),
        };
        let task = tokio::spawn(worker.run(token.clone()));

        Self {
            options,
            sender,
            pending,
            error,
            token,
            task: Mutex::new(Some(task)),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn add_all(&self, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.push(item);
        }
    }

    /// Items accepted but not yet processed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// The first processing error, if any. Clears it.
    pub fn take_error(&self) -> Option<E> {
        self.error.lock().expect("lock poisoned").take()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop accepting items, flush everything already accepted, and wait for
    /// the background task to exit.
    pub async fn dispose_async(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        let task = self.task.lock().expect("lock poisoned").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(queue = self.options.name, error = %e, "batching task failed");
            }
        }
        debug!(queue = self.options.name, "batching queue disposed");
    }

    fn push(&self, item: T) {
        if self.is_disposed() {
            warn!(queue = self.options.name, "add after dispose; dropping item");
            return;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(item).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            warn!(queue = self.options.name, "batching task has stopped; dropping item");
        }
    }
}

impl<T, E> Queue<T> for BatchingQueue<T, E>
where
    T: Send + 'static,
    E: Display + Send + 'static,
{
    fn add(&self, item: T) {
        self.push(item);
    }

    fn is_saturated(&self) -> bool {
        self.options
            .max_queue_size
            .is_some_and(|max| self.pending() >= max)
    }
}

impl<T, E> Drop for BatchingQueue<T, E> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct BatchWorker<T, E, F> {
    name: &'static str,
    batch_size: usize,
    max_wait: Duration,
    receiver: mpsc::UnboundedReceiver<T>,
    process: F,
    pending: Arc<AtomicUsize>,
    error: Arc<Mutex<Option<E>>>,
}

impl<T, E, F, Fut> BatchWorker<T, E, F>
where
    E: Display,
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    async fn run(mut self, token: CancellationToken) {
        let mut batch: Vec<T> = Vec::with_capacity(self.batch_size);
        let mut deadline: Option<Instant> = None;

        loop {
            let timer = deadline.unwrap_or_else(|| Instant::now() + self.max_wait);
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                received = self.receiver.recv() => match received {
                    Some(item) => {
                        if batch.is_empty() {
                            deadline = Some(Instant::now() + self.max_wait);
                        }
                        batch.push(item);
                        if batch.len() >= self.batch_size {
                            deadline = None;
                            self.flush(&mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(timer), if deadline.is_some() => {
                    deadline = None;
                    self.flush(&mut batch).await;
                }
            }
        }

        // Drain whatever was accepted before shutdown.
        self.receiver.close();
        while let Ok(item) = self.receiver.try_recv() {
            batch.push(item);
            if batch.len() >= self.batch_size {
                self.flush(&mut batch).await;
            }
        }
        self.flush(&mut batch).await;
    }

    async fn flush(&self, batch: &mut Vec<T>) {
        if batch.is_empty() {
            return;
        }
        let items = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        let count = items.len();
        debug!(queue = self.name, batch_size = count, "flushing batch");

        let result = (self.process)(items).await;
        self.pending.fetch_sub(count, Ordering::AcqRel);
        if let Err(e) = result {
            error!(queue = self.name, batch_size = count, error = %e, "batch failed");
            let mut slot = self.error.lock().expect("lock poisoned");
            if slot.is_none() {
                *slot = Some(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Batches = Arc<Mutex<Vec<Vec<u32>>>>;

    fn recording(
        batch_size: usize,
        max_wait: Duration,
    ) -> (BatchingQueue<u32>, Batches) {
        let batches: Batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let queue = BatchingQueue::new(
            BatchingOptions::new("test", batch_size, max_wait),
            move |batch: Vec<u32>| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(batch);
                    Ok::<(), QueueError>(())
                }
            },
        );
        (queue, batches)
    }

    #[tokio::test]
    async fn flushes_when_batch_is_full() {
        let (queue, batches) = recording(3, Duration::from_secs(60));
        queue.add_all([1, 2, 3, 4]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2, 3]]);
        queue.dispose_async().await;
        assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2, 3], vec![4]]);
    }

    #[tokio::test]
    async fn flushes_partial_batch_after_max_wait() {
        let (queue, batches) = recording(100, Duration::from_millis(20));
        queue.add(7);
        queue.add(8);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*batches.lock().unwrap(), vec![vec![7, 8]]);
        assert_eq!(queue.pending(), 0);
        queue.dispose_async().await;
    }

    #[tokio::test]
    async fn never_flushes_empty_batches() {
        let (queue, batches) = recording(2, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(40)).await;
        queue.dispose_async().await;
        assert!(batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_after_dispose_is_dropped() {
        let (queue, batches) = recording(2, Duration::from_millis(5));
        queue.dispose_async().await;
        queue.add(1);
        queue.dispose_async().await;
        assert!(batches.lock().unwrap().is_empty());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn first_error_is_kept_and_processing_continues() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let queue = BatchingQueue::new(
            BatchingOptions::new("failing", 1, Duration::from_secs(60)),
            move |batch: Vec<u32>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(QueueError::Process(format!("bad {}", batch[0])))
                }
            },
        );
        queue.add_all([1, 2]);
        queue.dispose_async().await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(queue.take_error(), Some(QueueError::Process("bad 1".into())));
        assert_eq!(queue.take_error(), None);
    }

    #[tokio::test]
    async fn reports_saturation() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let release = Arc::clone(&gate);
        let queue = BatchingQueue::new(
            BatchingOptions::new("slow", 1, Duration::from_secs(60)).with_max_queue_size(2),
            move |_batch: Vec<u32>| {
                let release = Arc::clone(&release);
                async move {
                    release.notified().await;
                    Ok::<(), QueueError>(())
                }
            },
        );
        queue.add(1);
        assert!(!queue.is_saturated());
        queue.add(2);
        assert!(queue.is_saturated());
        gate.notify_one();
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.notify_one();
        queue.dispose_async().await;
        assert!(!queue.is_saturated());
    }
}
