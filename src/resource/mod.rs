//! Typed configuration resources.
//!
//! - [`kind`] - Resource kinds and their key layout
//! - [`codec`] - Canonical byte encoding for the store
//! - [`validate`] - Structural and referential checks run before writes
//!
//! A [`Resource`] carries the store-managed metadata (`id`, `create_time`,
//! `update_time`) next to an opaque JSON payload. The payload schema belongs
//! to the gateway and is not interpreted beyond the fields validation needs.

pub mod codec;
pub mod kind;
pub mod validate;

pub use codec::ResourceCodec;
pub use kind::ResourceKind;
pub use validate::{Reference, Validator};

use crate::core::error::{TrellisError, TrellisResult};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A configuration resource as stored under `prefix/segment/key`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique id within the resource type.
    #[serde(
        default,
        deserialize_with = "deserialize_id",
        skip_serializing_if = "String::is_empty"
    )]
    pub id: String,

    /// Unix seconds at creation; immutable afterwards.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub create_time: i64,

    /// Unix seconds at the last write.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub update_time: i64,

    /// Remaining document fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Accept ids stored as strings or numbers.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "id must be a string or number, got: {}",
            other
        ))),
    }
}

impl Resource {
    /// Create a resource with the given id and payload.
    pub fn new(id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            create_time: 0,
            update_time: 0,
            payload,
        }
    }

    /// Build a resource from a JSON document, which must be an object.
    pub fn from_value(value: Value) -> TrellisResult<Self> {
        if !value.is_object() {
            return Err(TrellisError::validation("resource must be a JSON object"));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Render the resource as a JSON document.
    pub fn to_value(&self) -> TrellisResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// String field from the payload.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }

    /// Raw payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Key of this resource for the given kind, if present.
    pub fn key_for(&self, kind: ResourceKind) -> Option<String> {
        match kind.key_field() {
            "id" => Some(self.id.clone()).filter(|id| !id.is_empty()),
            field => self
                .payload
                .get(field)
                .and_then(value_as_key)
                .filter(|key| !key.is_empty()),
        }
    }
}

/// Render a JSON scalar used as a key or foreign id.
pub fn value_as_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_ids_become_strings() {
        let resource = Resource::from_value(json!({"id": 42, "uri": "/a"})).unwrap();
        assert_eq!(resource.id, "42");
        assert_eq!(resource.field_str("uri"), Some("/a"));
    }

    #[test]
    fn consumers_are_keyed_by_username() {
        let resource = Resource::from_value(json!({"username": "jack"})).unwrap();
        assert_eq!(resource.key_for(ResourceKind::Consumer).as_deref(), Some("jack"));
        assert_eq!(resource.key_for(ResourceKind::Route), None);
    }

    #[test]
    fn non_object_documents_are_rejected() {
        assert!(Resource::from_value(json!([1, 2])).is_err());
    }
}
