/// Errors from local store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store was disposed; no further calls are accepted.
    #[error("database is disposed")]
    Disposed,

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
