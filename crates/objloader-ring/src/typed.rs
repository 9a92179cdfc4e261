use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use objloader_types::{Item, ObjectId};
use tracing::{error, warn};

use crate::error::{RingError, RingResult};
use crate::frame::RingBufferQueue;
use crate::ring::{Backoff, SharedRegion};

/// How long async queue operations sleep between polls.
pub const ASYNC_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Encoding of one logical message type to and from frame payloads.
pub trait QueueCodec {
    type Message: Send + Sync + 'static;

    fn encode(message: &Self::Message) -> RingResult<Vec<u8>>;
    fn decode(bytes: &[u8]) -> RingResult<Self::Message>;
}

/// UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl QueueCodec for StringCodec {
    type Message = String;

    fn encode(message: &String) -> RingResult<Vec<u8>> {
        Ok(message.as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> RingResult<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| RingError::Decode(e.to_string()))
    }
}

/// JSON-encoded [`Item`] records.
///
/// A record whose payload is unreadable but whose `baseId` is intact decodes
/// to a "not found" item, so the receiver still learns which id it concerns.
#[derive(Debug, Clone, Copy, Default)]
pub struct ItemCodec;

impl QueueCodec for ItemCodec {
    type Message = Item;

    fn encode(message: &Item) -> RingResult<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| RingError::Encode(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> RingResult<Item> {
        match serde_json::from_slice::<Item>(bytes) {
            Ok(item) => Ok(item),
            Err(e) => {
                let value: serde_json::Value = serde_json::from_slice(bytes)
                    .map_err(|_| RingError::Decode(e.to_string()))?;
                match value.get("baseId").and_then(|id| id.as_str()) {
                    Some(id) => {
                        warn!(id, error = %e, "item payload unreadable; treating as not found");
                        Ok(Item::not_found(ObjectId::new(id)))
                    }
                    None => Err(RingError::Decode(e.to_string())),
                }
            }
        }
    }
}

/// A channel moving one message type across a ring buffer.
pub struct TypedQueue<C: QueueCodec> {
    frames: RingBufferQueue,
    _codec: PhantomData<fn() -> C>,
}

/// Channel of ids and acknowledgements.
pub type StringQueue = TypedQueue<StringCodec>;

/// Channel of items.
pub type ItemQueue = TypedQueue<ItemCodec>;

impl<C: QueueCodec> Clone for TypedQueue<C> {
    fn clone(&self) -> Self {
        Self {
            frames: self.frames.clone(),
            _codec: PhantomData,
        }
    }
}

impl<C: QueueCodec> TypedQueue<C> {
    pub fn new(frames: RingBufferQueue) -> Self {
        Self {
            frames,
            _codec: PhantomData,
        }
    }

    /// Create a channel over a fresh region of `capacity` bytes.
    pub fn create(capacity: usize) -> RingResult<Self> {
        Ok(Self::new(RingBufferQueue::create(capacity)?))
    }

    /// Attach to a region created by the other endpoint.
    pub fn from_existing(region: Arc<SharedRegion>, capacity: usize) -> RingResult<Self> {
        Ok(Self::new(RingBufferQueue::from_existing(region, capacity)?))
    }

    pub fn shared_region(&self) -> Arc<SharedRegion> {
        self.frames.shared_region()
    }

    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }

    /// No messages are waiting.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether `message` is small enough to ever be sent on this channel.
    pub fn fits(&self, message: &C::Message) -> bool {
        C::encode(message).is_ok_and(|payload| payload.len() <= self.frames.max_payload())
    }

    /// Send messages in order, stopping at the first that cannot be sent
    /// before `timeout`. Returns how many were sent; the caller retries the rest.
    pub fn enqueue(&self, messages: &[C::Message], timeout: Duration) -> usize {
        let backoff = Backoff::new(timeout);
        let mut sent = 0;
        for message in messages {
            let payload = match C::encode(message) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "failed to encode queue message");
                    break;
                }
            };
            if !self.frames.enqueue_frame(&payload, backoff.remaining()) {
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Receive up to `max` messages.
    ///
    /// Waits up to `timeout` for the first frame, then takes further frames
    /// only while they are immediately available. Undecodable frames are
    /// logged and skipped.
    pub fn dequeue(&self, max: usize, timeout: Duration) -> Vec<C::Message> {
        let mut messages = Vec::new();
        let mut wait = timeout;
        while messages.len() < max {
            let Some(frame) = self.frames.dequeue_frame(wait) else {
                break;
            };
            wait = Duration::ZERO;
            match C::decode(&frame) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(error = %e, len = frame.len(), "skipping undecodable frame"),
            }
        }
        messages
    }

    /// Like [`enqueue`](Self::enqueue), but never blocks the async runtime.
    pub async fn enqueue_async(&self, messages: &[C::Message], timeout: Duration) -> usize {
        let deadline = Instant::now().checked_add(timeout);
        let mut sent = 0;
        loop {
            sent += self.enqueue(&messages[sent..], Duration::ZERO);
            if sent == messages.len() || expired(deadline) {
                return sent;
            }
            tokio::time::sleep(ASYNC_POLL_INTERVAL).await;
        }
    }

    /// Like [`dequeue`](Self::dequeue), but never blocks the async runtime.
    pub async fn dequeue_async(&self, max: usize, timeout: Duration) -> Vec<C::Message> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let messages = self.dequeue(max, Duration::ZERO);
            if !messages.is_empty() || expired(deadline) {
                return messages;
            }
            tokio::time::sleep(ASYNC_POLL_INTERVAL).await;
        }
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    matches!(deadline, Some(deadline) if Instant::now() >= deadline)
}
