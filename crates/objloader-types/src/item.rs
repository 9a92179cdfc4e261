use serde::{Deserialize, Serialize};

use crate::base::Base;
use crate::id::ObjectId;

/// A unit of work flowing through the loader pipeline.
///
/// `base` is absent while the object is still unresolved, and stays absent
/// when the source confirmed it does not exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(rename = "baseId")]
    pub base_id: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Base>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Why the source could not deliver the payload, when it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Item {
    /// A resolved item carrying its payload.
    pub fn new(base: Base) -> Self {
        Self {
            base_id: base.object_id(),
            base: Some(base),
            size: None,
            error: None,
        }
    }

    /// A resolved item with a known wire size in bytes.
    pub fn with_size(base: Base, size: usize) -> Self {
        Self {
            size: Some(size),
            ..Self::new(base)
        }
    }

    /// A placeholder for an id the source does not have.
    pub fn not_found(id: impl Into<ObjectId>) -> Self {
        Self {
            base_id: id.into(),
            base: None,
            size: None,
            error: None,
        }
    }

    /// A placeholder for an id whose payload arrived but failed to decode.
    pub fn failed(id: impl Into<ObjectId>, reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::not_found(id)
        }
    }

    /// Whether the payload is present.
    pub fn is_resolved(&self) -> bool {
        self.base.is_some()
    }

    /// Size used for cache budgeting.
    ///
    /// The wire size when known, otherwise the serialized payload length.
    pub fn estimated_size(&self) -> usize {
        match (self.size, &self.base) {
            (Some(size), _) => size,
            (None, Some(base)) => base.estimated_size(),
            (None, None) => 0,
        }
    }
}
