//! Ring buffers for moving messages between threads.
//!
//! A [`RingBuffer`] is a fixed-capacity circular byte buffer over a
//! [`SharedRegion`] that both endpoints hold. On top of it:
//!
//! - [`RingBufferQueue`] -- length-prefixed frames
//! - [`TypedQueue`] -- one message type per frame ([`StringQueue`], [`ItemQueue`])
//!
//! # Rules
//!
//! 1. One producer and one consumer per region.
//! 2. Every blocking call takes a timeout; expiry is a sentinel, never an error.
//! 3. A reader never observes a partially written frame.

pub mod error;
pub mod frame;
pub mod ring;
pub mod typed;

pub use error::{RingError, RingResult};
pub use frame::{RingBufferQueue, FRAME_HEADER_LEN};
pub use ring::{RingBuffer, SharedRegion};
pub use typed::{ItemCodec, ItemQueue, QueueCodec, StringCodec, StringQueue, TypedQueue};
