/// Errors from ring buffer and channel queue operations.
///
/// Timeouts are not errors: blocking primitives report them with sentinel
/// return values (`false`, `None`, a short count).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RingError {
    /// A shared region is smaller than the capacity requested of it.
    #[error("shared region too small: need {required} bytes, got {actual}")]
    RegionTooSmall { required: usize, actual: usize },

    /// A ring buffer must hold at least one frame header.
    #[error("invalid ring capacity: {0}")]
    InvalidCapacity(usize),

    /// A message could not be encoded into a frame.
    #[error("encode error: {0}")]
    Encode(String),

    /// A frame could not be decoded into a message.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Result alias for ring operations.
pub type RingResult<T> = Result<T, RingError>;
