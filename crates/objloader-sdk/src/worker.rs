use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use objloader_protocol::{InitFailureKind, WorkerMessage};
use objloader_ring::{ItemCodec, QueueCodec, StringCodec, TypedQueue};
use objloader_store::Database;
use objloader_types::{Item, ObjectId};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error, info, warn};

use crate::error::{SdkError, SdkResult};

/// Messages a worker takes per loop iteration.
pub const WORKER_BATCH: usize = 1000;
/// How long a worker waits for input before checking for `Dispose`.
pub const WORKER_POLL: Duration = Duration::from_millis(50);

const INIT_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const SEND_TIMEOUT: Duration = Duration::from_millis(100);

type Msg<C> = <C as QueueCodec>::Message;

/// Work done on the far side of a worker boundary.
pub trait WorkerJob: Send + 'static {
    /// Loader to worker.
    type Request: QueueCodec + 'static;
    /// Worker to loader.
    type Response: QueueCodec + 'static;

    const NAME: &'static str;

    /// Handle one batch. `fits` tells whether a response can cross the ring.
    fn handle(
        &mut self,
        batch: Vec<Msg<Self::Request>>,
        fits: &dyn Fn(&Msg<Self::Response>) -> bool,
    ) -> Vec<Msg<Self::Response>>;
}

// ---- Jobs ----

/// Looks ids up in the store. Misses, and hits too large for the ring, come
/// back as "not found" placeholders so the loader fetches them instead.
pub struct ReadJob {
    database: Arc<dyn Database>,
}

impl ReadJob {
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self { database }
    }
}

impl WorkerJob for ReadJob {
    type Request = StringCodec;
    type Response = ItemCodec;

    const NAME: &'static str = "cache-read-worker";

    fn handle(&mut self, batch: Vec<String>, fits: &dyn Fn(&Item) -> bool) -> Vec<Item> {
        let keys: Vec<ObjectId> = batch.into_iter().map(ObjectId::new).collect();
        let found = match self.database.get_all(&keys) {
            Ok(found) => found,
            Err(e) => {
                error!(error = %e, count = keys.len(), "worker lookup failed");
                vec![None; keys.len()]
            }
        };
        keys.into_iter()
            .zip(found)
            .map(|(id, item)| match item {
                Some(item) if fits(&item) => item,
                Some(_) => {
                    debug!(id = %id, "stored object too large for ring; fetching instead");
                    Item::not_found(id)
                }
                None => Item::not_found(id),
            })
            .collect()
    }
}

/// Persists items and acknowledges the ids it stored.
pub struct WriteJob {
    database: Arc<dyn Database>,
}

impl WriteJob {
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self { database }
    }
}

impl WorkerJob for WriteJob {
    type Request = ItemCodec;
    type Response = StringCodec;

    const NAME: &'static str = "cache-write-worker";

    fn handle(&mut self, batch: Vec<Item>, _fits: &dyn Fn(&String) -> bool) -> Vec<String> {
        match self.database.put_all(&batch) {
            Ok(()) => batch
                .into_iter()
                .filter(Item::is_resolved)
                .map(|item| item.base_id.into_string())
                .collect(),
            Err(e) => {
                error!(error = %e, count = batch.len(), "worker write failed");
                Vec::new()
            }
        }
    }
}

// ---- Host ----

/// Run a blocking wait. On a multi-threaded runtime the current worker's
/// other tasks are moved elsewhere first; `block_in_place` is not available
/// on a current-thread runtime, so there the wait just blocks.
fn blocking_wait<T>(wait: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(wait)
        }
        _ => wait(),
    }
}

/// Loader-side handle on a background worker thread.
///
/// Bulk traffic goes through two ring buffers; the control channel only
/// carries [`WorkerMessage`]s.
pub struct WorkerHost<J: WorkerJob> {
    requests: TypedQueue<J::Request>,
    responses: TypedQueue<J::Response>,
    control: Sender<WorkerMessage>,
    events: Mutex<Receiver<WorkerMessage>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<J: WorkerJob> WorkerHost<J> {
    /// Start the worker thread and wait until it has attached to both rings.
    pub fn spawn(job: J, capacity: usize) -> SdkResult<Self> {
        let requests = TypedQueue::<J::Request>::create(capacity)?;
        let responses = TypedQueue::<J::Response>::create(capacity)?;
        let (control, control_rx) = mpsc::channel();
        let (events_tx, events) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(J::NAME.to_string())
            .spawn(move || run_worker(job, control_rx, events_tx))?;

        let host = Self {
            requests,
            responses,
            control,
            events: Mutex::new(events),
            thread: Mutex::new(Some(thread)),
        };
        host.send_control(WorkerMessage::init(
            host.requests.shared_region(),
            host.responses.shared_region(),
            capacity,
        ))?;

        let answer =
            blocking_wait(|| host.events.lock().expect("lock poisoned").recv_timeout(INIT_TIMEOUT));
        match answer {
            Ok(WorkerMessage::Ready) => {
                info!(worker = J::NAME, capacity, "worker ready");
                Ok(host)
            }
            Ok(WorkerMessage::InitFailed { kind, error }) => {
                host.join();
                Err(SdkError::WorkerInit { kind, error })
            }
            Ok(other) => Err(SdkError::Worker(format!(
                "{} answered init with {}",
                J::NAME,
                other.type_name()
            ))),
            Err(_) => Err(SdkError::Worker(format!("{} did not answer init", J::NAME))),
        }
    }

    pub fn requests(&self) -> &TypedQueue<J::Request> {
        &self.requests
    }

    pub fn responses(&self) -> &TypedQueue<J::Response> {
        &self.responses
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Send every message, retrying while the ring is full. Messages larger
    /// than the ring are skipped.
    pub async fn send(&self, messages: &[Msg<J::Request>]) -> SdkResult<()> {
        let mut sent = 0;
        while sent < messages.len() {
            sent += self.requests.enqueue_async(&messages[sent..], SEND_TIMEOUT).await;
            if sent < messages.len() && !self.requests.fits(&messages[sent]) {
                warn!(worker = J::NAME, "message too large for ring; skipping");
                sent += 1;
                continue;
            }
            if sent < messages.len() && !self.is_running() {
                return Err(SdkError::Worker(format!(
                    "{} stopped with {} messages unsent",
                    J::NAME,
                    messages.len() - sent
                )));
            }
        }
        Ok(())
    }

    /// Let the worker drain queued requests, then ask it to stop and wait.
    ///
    /// Blocks the calling thread.
    pub fn shutdown(&self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !self.requests.is_empty() && self.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        if !self.requests.is_empty() {
            warn!(worker = J::NAME, "stopping worker with requests still queued");
        }

        if self.send_control(WorkerMessage::Dispose).is_ok() {
            let answer = self
                .events
                .lock()
                .expect("lock poisoned")
                .recv_timeout(SHUTDOWN_TIMEOUT);
            match answer {
                Ok(WorkerMessage::Disposed) => debug!(worker = J::NAME, "worker disposed"),
                Ok(other) => warn!(worker = J::NAME, message = other.type_name(), "unexpected message during shutdown"),
                Err(RecvTimeoutError::Timeout) => warn!(worker = J::NAME, "worker did not confirm shutdown"),
                Err(RecvTimeoutError::Disconnected) => {}
            }
        }
        self.join();
    }

    fn send_control(&self, message: WorkerMessage) -> SdkResult<()> {
        self.control
            .send(message)
            .map_err(|_| SdkError::Worker(format!("{} has exited", J::NAME)))
    }

    fn join(&self) {
        let thread = self.thread.lock().expect("lock poisoned").take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!(worker = J::NAME, "worker thread panicked");
            }
        }
    }
}

impl<J: WorkerJob> Drop for WorkerHost<J> {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.control.send(WorkerMessage::Dispose);
        }
    }
}

// ---- Worker side ----

/// Worker thread body: attach, answer `Ready`, then loop until `Dispose`.
pub fn run_worker<J: WorkerJob>(
    mut job: J,
    control: Receiver<WorkerMessage>,
    events: Sender<WorkerMessage>,
) {
    let Some((inbound, outbound)) = attach::<J>(&control, &events) else {
        return;
    };
    let _ = events.send(WorkerMessage::Ready);

    let fits = |message: &Msg<J::Response>| outbound.fits(message);
    loop {
        if dispose_requested(&control) {
            break;
        }
        let batch = inbound.dequeue(WORKER_BATCH, WORKER_POLL);
        if batch.is_empty() {
            continue;
        }
        let count = batch.len();
        let responses = job.handle(batch, &fits);
        debug!(worker = J::NAME, count, responses = responses.len(), "worker batch handled");
        if !send_responses(&outbound, &responses, &control) {
            break;
        }
    }

    let _ = events.send(WorkerMessage::Disposed);
    debug!(worker = J::NAME, "worker stopped");
}

fn attach<J: WorkerJob>(
    control: &Receiver<WorkerMessage>,
    events: &Sender<WorkerMessage>,
) -> Option<(TypedQueue<J::Request>, TypedQueue<J::Response>)> {
    let fail = |kind: InitFailureKind, error: String| {
        error!(worker = J::NAME, %kind, %error, "worker init failed");
        let _ = events.send(WorkerMessage::InitFailed { kind, error });
    };

    let message = control.recv().ok()?;
    let received = message.type_name();
    let WorkerMessage::Init {
        inbound,
        inbound_capacity,
        outbound,
        outbound_capacity,
    } = message
    else {
        fail(
            InitFailureKind::Internal,
            format!("expected Init, got {received}"),
        );
        return None;
    };

    if !cfg!(target_has_atomic = "ptr") {
        fail(
            InitFailureKind::UnsupportedEnvironment,
            "pointer-sized atomics are not available".to_string(),
        );
        return None;
    }

    let inbound = TypedQueue::<J::Request>::from_existing(inbound, inbound_capacity);
    let outbound = TypedQueue::<J::Response>::from_existing(outbound, outbound_capacity);
    match (inbound, outbound) {
        (Ok(inbound), Ok(outbound)) => Some((inbound, outbound)),
        (Err(e), _) | (_, Err(e)) => {
            fail(InitFailureKind::Internal, e.to_string());
            None
        }
    }
}

/// Dispose was requested, or the loader side went away.
fn dispose_requested(control: &Receiver<WorkerMessage>) -> bool {
    match control.try_recv() {
        Ok(WorkerMessage::Dispose) | Err(TryRecvError::Disconnected) => true,
        Ok(other) => {
            warn!(message = other.type_name(), "ignoring unexpected control message");
            false
        }
        Err(TryRecvError::Empty) => false,
    }
}

/// Returns `false` if dispose arrived before everything was sent.
fn send_responses<C: QueueCodec>(
    outbound: &TypedQueue<C>,
    responses: &[C::Message],
    control: &Receiver<WorkerMessage>,
) -> bool {
    let mut sent = 0;
    while sent < responses.len() {
        sent += outbound.enqueue(&responses[sent..], WORKER_POLL);
        if sent < responses.len() && dispose_requested(control) {
            warn!(unsent = responses.len() - sent, "dropping responses on dispose");
            return false;
        }
    }
    true
}
