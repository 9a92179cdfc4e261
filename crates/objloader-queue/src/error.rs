/// Errors from queue processing.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    /// A batch processor failed.
    #[error("batch processing failed: {0}")]
    Process(String),

    /// The queue was disposed.
    #[error("{0} is disposed")]
    Disposed(&'static str),
}

/// Result alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
