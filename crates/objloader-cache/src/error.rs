use objloader_types::ObjectId;

/// Errors from cache and deferment operations.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    /// The cache or deferment manager was disposed.
    #[error("{0} is disposed")]
    Disposed(&'static str),

    /// The source confirmed the object does not exist.
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// The source returned the object but it could not be decoded.
    #[error("object {id} could not be decoded: {reason}")]
    Decode { id: ObjectId, reason: String },
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
