use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::error::{RingError, RingResult};
use crate::ring::{Backoff, RingBuffer, SharedRegion};

/// Length of the little-endian `u32` prefix in front of every frame.
pub const FRAME_HEADER_LEN: usize = 4;

/// Length-prefixed message framing on top of a [`RingBuffer`].
///
/// Wire format:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [N bytes: payload]
/// ```
#[derive(Clone, Debug)]
pub struct RingBufferQueue {
    buffer: RingBuffer,
}

impl RingBufferQueue {
    /// Wrap a ring buffer. The ring must be large enough for a header plus
    /// at least one payload byte.
    pub fn new(buffer: RingBuffer) -> RingResult<Self> {
        if buffer.capacity() <= FRAME_HEADER_LEN {
            return Err(RingError::InvalidCapacity(buffer.capacity()));
        }
        Ok(Self { buffer })
    }

    /// Create a queue over a fresh region of `capacity` bytes.
    pub fn create(capacity: usize) -> RingResult<Self> {
        Self::new(RingBuffer::create(capacity)?)
    }

    /// Attach to a region created by the other endpoint.
    pub fn from_existing(region: Arc<SharedRegion>, capacity: usize) -> RingResult<Self> {
        Self::new(RingBuffer::from_existing(region, capacity)?)
    }

    pub fn shared_region(&self) -> Arc<SharedRegion> {
        self.buffer.shared_region()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// No frame bytes are waiting.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Largest payload a single frame can carry.
    pub fn max_payload(&self) -> usize {
        self.buffer.capacity() - FRAME_HEADER_LEN
    }

    /// Push one frame. `false` means "try later" (or the payload can never fit).
    pub fn enqueue_frame(&self, payload: &[u8], timeout: Duration) -> bool {
        if payload.len() > self.max_payload() || payload.len() > u32::MAX as usize {
            error!(
                len = payload.len(),
                max = self.max_payload(),
                "frame payload exceeds ring capacity"
            );
            return false;
        }
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);

        let _writer = self.buffer.region().claim_writer();
        self.buffer.push(&frame, timeout)
    }

    /// Pop one frame, waiting up to `timeout` for it to arrive in full.
    ///
    /// An incomplete frame at timeout is left in place. A header declaring a
    /// frame larger than the ring is dropped with an error log.
    pub fn dequeue_frame(&self, timeout: Duration) -> Option<Vec<u8>> {
        let _reader = self.buffer.region().claim_reader();
        let backoff = Backoff::new(timeout);

        let header = self.buffer.peek(FRAME_HEADER_LEN, timeout)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > self.max_payload() {
            error!(
                len,
                capacity = self.buffer.capacity(),
                "frame header declares length beyond ring capacity; dropping header"
            );
            self.buffer.shift(FRAME_HEADER_LEN, Duration::ZERO);
            return None;
        }

        if !self
            .buffer
            .wait_for_data(FRAME_HEADER_LEN + len, backoff.remaining())
        {
            return None;
        }
        self.buffer.shift(FRAME_HEADER_LEN, Duration::ZERO)?;
        self.buffer.shift(len, Duration::ZERO)
    }
}
