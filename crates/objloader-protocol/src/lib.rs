//! Wire formats for objloader.
//!
//! - Batch download: `POST {server}/api/getobjects/{stream}` with a
//!   [`GetObjectsRequest`] body; the response streams `<id>\t<json>\n` records
//!   decoded incrementally by [`LineParser`].
//! - Single object: `GET {server}/objects/{stream}/{object}/single`, decoded
//!   by [`parse_single`].
//! - Worker boundary: [`WorkerMessage`] control messages.

pub mod auth;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod message;

pub use auth::AuthMethod;
pub use codec::{
    encode_line, parse_line, parse_single, GetObjectsRequest, LineParser, RAW_ENCODING_MARKER,
};
pub use endpoint::{endpoints, ServerEndpoints};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{InitFailureKind, WorkerMessage, DEFAULT_WORKER_BUFFER_CAPACITY};
