use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::TypeError;
use crate::id::ObjectId;

/// Field on the root object that maps every reachable id to its depth.
pub const CLOSURE_FIELD: &str = "__closure";

/// Field marking a nested value as a reference to another object.
pub const REFERENCE_FIELD: &str = "referencedId";

/// An object payload.
///
/// A base is a JSON object with a string `id`. The tree is shared behind an
/// `Arc`: bases flow through caches, queues and the output stream, and are
/// never mutated once decoded.
#[derive(Clone, PartialEq)]
pub struct Base(Arc<Value>);

impl Base {
    /// Wrap a JSON value, checking that it is shaped like a base.
    pub fn from_value(value: Value) -> Result<Self, TypeError> {
        if !Self::is_base(&value) {
            let hint = value
                .get("id")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "value".to_string());
            return Err(TypeError::NotABase(hint));
        }
        Ok(Self(Arc::new(value)))
    }

    /// Parse a JSON document into a base.
    pub fn from_json(json: &str) -> Result<Self, TypeError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| TypeError::Serialization(e.to_string()))?;
        Self::from_value(value)
    }

    /// Returns `true` if `value` is a JSON object with a string `id`.
    pub fn is_base(value: &Value) -> bool {
        matches!(value.get("id"), Some(Value::String(_)))
    }

    /// The object's own id.
    pub fn id(&self) -> &str {
        self.0.get("id").and_then(Value::as_str).unwrap_or_default()
    }

    /// The object's id as an [`ObjectId`].
    pub fn object_id(&self) -> ObjectId {
        ObjectId::new(self.id())
    }

    /// The underlying JSON tree.
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Look up a top-level field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The closure manifest: `(id, depth)` pairs in map iteration order.
    ///
    /// Entries whose depth is not an integer are ignored. Returns an empty
    /// list when the object has no closure.
    pub fn closure(&self) -> Vec<(ObjectId, i64)> {
        match self.0.get(CLOSURE_FIELD) {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(id, depth)| depth.as_i64().map(|d| (ObjectId::new(id.as_str()), d)))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Every `referencedId` occurrence in the tree, depth-first, in document order.
    ///
    /// Duplicates are kept: each occurrence counts as a separate reference.
    pub fn references(&self) -> Vec<ObjectId> {
        let mut found = Vec::new();
        let mut stack: Vec<&Value> = vec![&self.0];
        while let Some(value) = stack.pop() {
            match value {
                Value::Object(map) => {
                    if let Some(Value::String(id)) = map.get(REFERENCE_FIELD) {
                        found.push(ObjectId::new(id.as_str()));
                    }
                    let children: Vec<&Value> = map
                        .iter()
                        .filter(|(k, _)| k.as_str() != REFERENCE_FIELD)
                        .map(|(_, v)| v)
                        .collect();
                    stack.extend(children.into_iter().rev());
                }
                Value::Array(values) => stack.extend(values.iter().rev()),
                _ => {}
            }
        }
        found
    }

    /// Estimated in-memory footprint in bytes (serialized JSON length).
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self.0.as_ref())
            .map(|bytes| bytes.len())
            .unwrap_or(0)
    }
}

impl fmt::Debug for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Base").field(&self.id()).finish()
    }
}

impl Serialize for Base {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Base {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}
