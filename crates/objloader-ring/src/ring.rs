use std::hint;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::error;

use crate::error::{RingError, RingResult};

/// Memory shared by the two endpoints of a ring buffer.
///
/// Holds the read and write positions and the byte storage. Positions run
/// modulo twice the ring capacity, so a full ring and an empty ring are
/// distinguishable without sacrificing a slot.
///
/// Bytes are written with relaxed stores and published by a release store of
/// the write position; the reader acquires the write position before touching
/// any byte, and symmetrically for the read position.
pub struct SharedRegion {
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    /// Claimed by the producing side for the duration of a push.
    writer: Mutex<()>,
    /// Claimed by the consuming side for the duration of a frame read.
    reader: Mutex<()>,
    data: Box<[AtomicU8]>,
}

impl SharedRegion {
    /// Allocate a zeroed region of `size` bytes.
    pub fn new(size: usize) -> Arc<Self> {
        let data = (0..size).map(|_| AtomicU8::new(0)).collect();
        Arc::new(Self {
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            writer: Mutex::new(()),
            reader: Mutex::new(()),
            data,
        })
    }

    /// Size of the byte storage.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn claim_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().expect("lock poisoned")
    }

    pub(crate) fn claim_reader(&self) -> MutexGuard<'_, ()> {
        self.reader.lock().expect("lock poisoned")
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("size", &self.data.len())
            .field("write_pos", &self.write_pos.load(Ordering::Relaxed))
            .field("read_pos", &self.read_pos.load(Ordering::Relaxed))
            .finish()
    }
}

// ---- Waiting ----

/// Escalating wait: spin, then yield, then short sleeps, until a deadline.
pub(crate) struct Backoff {
    step: u32,
    deadline: Option<Instant>,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;
    const MAX_SLEEP: Duration = Duration::from_millis(1);

    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            step: 0,
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub(crate) fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Wait a little. Returns `false` once the deadline has passed.
    pub(crate) fn snooze(&mut self) -> bool {
        let now = Instant::now();
        if matches!(self.deadline, Some(deadline) if now >= deadline) {
            return false;
        }
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                hint::spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            let pause = match self.deadline {
                Some(deadline) => Self::MAX_SLEEP.min(deadline - now),
                None => Self::MAX_SLEEP,
            };
            thread::sleep(pause);
        }
        self.step = self.step.saturating_add(1);
        true
    }
}

// ---- Ring buffer ----

/// Fixed-capacity circular byte buffer over a [`SharedRegion`].
///
/// Intended for exactly one writer and one reader running concurrently,
/// typically on different threads. Every blocking operation takes a timeout
/// and reports expiry with a sentinel value.
#[derive(Clone, Debug)]
pub struct RingBuffer {
    region: Arc<SharedRegion>,
    capacity: usize,
}

impl RingBuffer {
    /// Create a ring buffer over a fresh region of `capacity` bytes.
    pub fn create(capacity: usize) -> RingResult<Self> {
        if capacity == 0 || capacity > usize::MAX / 2 {
            return Err(RingError::InvalidCapacity(capacity));
        }
        Ok(Self {
            region: SharedRegion::new(capacity),
            capacity,
        })
    }

    /// Attach to a region created by the other endpoint.
    ///
    /// Both endpoints must agree on `capacity`.
    pub fn from_existing(region: Arc<SharedRegion>, capacity: usize) -> RingResult<Self> {
        if capacity == 0 || capacity > usize::MAX / 2 {
            return Err(RingError::InvalidCapacity(capacity));
        }
        if region.size() < capacity {
            return Err(RingError::RegionTooSmall {
                required: capacity,
                actual: region.size(),
            });
        }
        Ok(Self { region, capacity })
    }

    /// The region backing this buffer, for handing to the other endpoint.
    pub fn shared_region(&self) -> Arc<SharedRegion> {
        Arc::clone(&self.region)
    }

    pub(crate) fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently stored.
    pub fn len(&self) -> usize {
        let write = self.region.write_pos.load(Ordering::Acquire);
        let read = self.region.read_pos.load(Ordering::Acquire);
        self.used(write, read)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes that can be pushed without waiting.
    pub fn available_space(&self) -> usize {
        self.capacity - self.len()
    }

    /// Append `data`, waiting up to `timeout` for enough free space.
    ///
    /// Returns `false` on timeout, or immediately when `data` can never fit.
    /// The bytes become visible to the reader all at once.
    pub fn push(&self, data: &[u8], timeout: Duration) -> bool {
        if data.is_empty() {
            return true;
        }
        if data.len() > self.capacity {
            error!(
                len = data.len(),
                capacity = self.capacity,
                "push exceeds ring capacity"
            );
            return false;
        }

        let mut backoff = Backoff::new(timeout);
        loop {
            let write = self.region.write_pos.load(Ordering::Relaxed);
            let read = self.region.read_pos.load(Ordering::Acquire);
            if self.capacity - self.used(write, read) >= data.len() {
                let start = write % self.capacity;
                for (i, byte) in data.iter().enumerate() {
                    self.region.data[(start + i) % self.capacity].store(*byte, Ordering::Relaxed);
                }
                self.region
                    .write_pos
                    .store(self.advance(write, data.len()), Ordering::Release);
                return true;
            }
            if !backoff.snooze() {
                return false;
            }
        }
    }

    /// Copy the next `n` bytes without consuming them.
    pub fn peek(&self, n: usize, timeout: Duration) -> Option<Vec<u8>> {
        let read = self.await_readable(n, timeout)?;
        Some(self.copy_out(read, n))
    }

    /// Consume exactly `n` bytes.
    pub fn shift(&self, n: usize, timeout: Duration) -> Option<Vec<u8>> {
        let read = self.await_readable(n, timeout)?;
        let bytes = self.copy_out(read, n);
        self.region
            .read_pos
            .store(self.advance(read, n), Ordering::Release);
        Some(bytes)
    }

    /// Wait until at least `n` bytes are readable.
    pub fn wait_for_data(&self, n: usize, timeout: Duration) -> bool {
        self.await_readable(n, timeout).is_some()
    }

    /// Returns the read position once `n` bytes are available.
    fn await_readable(&self, n: usize, timeout: Duration) -> Option<usize> {
        if n > self.capacity {
            error!(n, capacity = self.capacity, "read exceeds ring capacity");
            return None;
        }
        let mut backoff = Backoff::new(timeout);
        loop {
            let write = self.region.write_pos.load(Ordering::Acquire);
            let read = self.region.read_pos.load(Ordering::Relaxed);
            if self.used(write, read) >= n {
                return Some(read);
            }
            if !backoff.snooze() {
                return None;
            }
        }
    }

    fn copy_out(&self, read: usize, n: usize) -> Vec<u8> {
        let start = read % self.capacity;
        (0..n)
            .map(|i| self.region.data[(start + i) % self.capacity].load(Ordering::Relaxed))
            .collect()
    }

    fn used(&self, write: usize, read: usize) -> usize {
        let span = 2 * self.capacity;
        (write + span - read) % span
    }

    fn advance(&self, pos: usize, n: usize) -> usize {
        (pos + n) % (2 * self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn push_then_shift_returns_same_bytes() {
        let ring = RingBuffer::create(16).unwrap();
        assert!(ring.push(b"hello", SHORT));
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.shift(5, SHORT).unwrap(), b"hello");
        assert!(ring.is_empty());
    }

    #[test]
    fn peek_does_not_consume() {
        let ring = RingBuffer::create(16).unwrap();
        ring.push(b"abc", SHORT);
        assert_eq!(ring.peek(2, SHORT).unwrap(), b"ab");
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.shift(3, SHORT).unwrap(), b"abc");
    }

    #[test]
    fn full_ring_uses_whole_capacity() {
        let ring = RingBuffer::create(8).unwrap();
        assert!(ring.push(&[1; 8], SHORT));
        assert_eq!(ring.available_space(), 0);
        assert!(!ring.push(&[2], Duration::ZERO));
    }

    #[test]
    fn oversized_push_fails_immediately() {
        let ring = RingBuffer::create(4).unwrap();
        let started = Instant::now();
        assert!(!ring.push(&[0; 5], Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn shift_times_out_on_empty_ring() {
        let ring = RingBuffer::create(8).unwrap();
        let started = Instant::now();
        assert!(ring.shift(1, SHORT).is_none());
        assert!(started.elapsed() >= SHORT);
        assert!(!ring.wait_for_data(1, Duration::ZERO));
    }

    #[test]
    fn data_survives_wraparound() {
        let ring = RingBuffer::create(7).unwrap();
        for round in 0..50u8 {
            let chunk = [round, round.wrapping_add(1), round.wrapping_add(2)];
            assert!(ring.push(&chunk, SHORT));
            assert_eq!(ring.shift(3, SHORT).unwrap(), chunk);
        }
    }

    #[test]
    fn from_existing_shares_positions() {
        let writer = RingBuffer::create(32).unwrap();
        let reader = RingBuffer::from_existing(writer.shared_region(), 32).unwrap();
        writer.push(b"shared", SHORT);
        assert_eq!(reader.shift(6, SHORT).unwrap(), b"shared");
        assert!(writer.is_empty());
    }

    #[test]
    fn from_existing_rejects_small_region() {
        let region = SharedRegion::new(8);
        assert_eq!(
            RingBuffer::from_existing(region, 16).unwrap_err(),
            RingError::RegionTooSmall {
                required: 16,
                actual: 8
            }
        );
    }

    #[test]
    fn writer_unblocks_when_reader_drains() {
        let ring = RingBuffer::create(4).unwrap();
        assert!(ring.push(&[9; 4], SHORT));
        let reader = ring.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            reader.shift(4, Duration::from_secs(1))
        });
        assert!(ring.push(&[7; 4], Duration::from_secs(2)));
        assert_eq!(handle.join().unwrap().unwrap(), vec![9; 4]);
        assert_eq!(ring.shift(4, SHORT).unwrap(), vec![7; 4]);
    }
}
