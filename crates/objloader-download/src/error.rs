use objloader_protocol::ProtocolError;
use thiserror::Error;

/// Errors from downloading objects.
///
/// Transport failures are kept as text so the error can be retained by the
/// pool and handed to more than one observer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    #[error("you do not have access to this stream")]
    AccessDenied,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to fetch objects: HTTP {status}")]
    FetchFailed { status: u16 },

    #[error("error parsing object {id}: {reason}")]
    Decode { id: String, reason: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid header {0}")]
    InvalidHeader(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("download pool is not initialized")]
    NotInitialized,

    #[error("download pool is already initialized")]
    AlreadyInitialized,

    #[error("downloader is disposed")]
    Disposed,
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request(e.to_string())
    }
}

impl From<ProtocolError> for DownloadError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Decode { id, reason } => Self::Decode { id, reason },
            other => Self::Protocol(other.to_string()),
        }
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
