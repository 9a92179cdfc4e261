use objloader_protocol::InitFailureKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("worker failed to initialize ({kind}): {error}")]
    WorkerInit { kind: InitFailureKind, error: String },

    #[error("worker error: {0}")]
    Worker(String),

    #[error("{0} is already initialized")]
    AlreadyInitialized(&'static str),

    #[error("{0} is disposed")]
    Disposed(&'static str),

    #[error("invalid object graph: {0}")]
    InvalidGraph(String),

    #[error("store error: {0}")]
    Store(#[from] objloader_store::StoreError),

    #[error("cache error: {0}")]
    Cache(#[from] objloader_cache::CacheError),

    #[error("download error: {0}")]
    Download(#[from] objloader_download::DownloadError),

    #[error("ring buffer error: {0}")]
    Ring(#[from] objloader_ring::RingError),

    #[error("type error: {0}")]
    Type(#[from] objloader_types::TypeError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SdkResult<T> = Result<T, SdkError>;
