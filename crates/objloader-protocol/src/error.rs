use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid line format in response: {0}")]
    InvalidLine(String),

    #[error("object id is not valid UTF-8")]
    InvalidUtf8,

    #[error("error parsing object {id}: {reason}")]
    Decode { id: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
