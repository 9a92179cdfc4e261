//! Queues that connect the stages of the objloader pipeline.
//!
//! - [`Queue`] -- the sink trait every stage accepts
//! - [`BatchingQueue`] -- size/time-bounded batches handed to an async processor
//! - [`AsyncQueue`] -- the consumer-facing output sequence
//! - [`AggregateQueue`] -- fan-out to the consumer and to persistence

pub mod aggregate;
pub mod async_queue;
pub mod batching;
pub mod error;
pub mod traits;

pub use aggregate::AggregateQueue;
pub use async_queue::AsyncQueue;
pub use batching::{BatchingOptions, BatchingQueue};
pub use error::{QueueError, QueueResult};
pub use traits::Queue;
