use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Number of hex characters kept from the BLAKE3 digest by [`ObjectId::from_content`].
const CONTENT_ID_HEX_LEN: usize = 32;

/// Content-addressed identifier for an object in the graph.
///
/// Ids are opaque strings on the wire (typically a hex content hash). The
/// only hard constraint is that they fit the line protocol: no tabs, no
/// newlines, not empty.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Wrap an id string without validation.
    ///
    /// Use [`ObjectId::parse`] for untrusted input.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse and validate an id string.
    pub fn parse(id: &str) -> Result<Self, TypeError> {
        if id.is_empty() || id.contains(['\t', '\n', '\r']) {
            return Err(TypeError::InvalidId(id.to_string()));
        }
        Ok(Self(id.to_string()))
    }

    /// Compute an id from raw content (truncated BLAKE3 hex digest).
    pub fn from_content(data: &[u8]) -> Self {
        let digest = hex::encode(blake3::hash(data).as_bytes());
        Self(digest[..CONTENT_ID_HEX_LEN].to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short representation (first 8 characters) for log output.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }

    /// Consume the id and return the inner string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for ObjectId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ObjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
