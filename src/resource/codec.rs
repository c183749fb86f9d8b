//! Canonical byte encoding of resources.
//!
//! Values are compact JSON. Payload maps are ordered by key, so encoding
//! the same resource twice yields identical bytes, which is what the
//! verifier's byte comparison relies on.

use super::Resource;
use crate::core::error::{TrellisError, TrellisResult};
use bytes::Bytes;

/// Encoder/decoder between [`Resource`] and stored bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceCodec;

impl ResourceCodec {
    /// Encode a resource to its stored form.
    pub fn encode(resource: &Resource) -> TrellisResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(resource)?))
    }

    /// Decode stored bytes found under `key`.
    ///
    /// Documents written without an id take the key as their id.
    pub fn decode(key: &str, bytes: &[u8]) -> TrellisResult<Resource> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| TrellisError::codec(format!("key {}: {}", key, e)))?;
        let mut resource = Resource::from_value(value)
            .map_err(|e| TrellisError::codec(format!("key {}: {}", key, e)))?;
        if resource.id.is_empty() && !key.is_empty() {
            resource.id = key.to_string();
        }
        Ok(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encoding_is_deterministic() {
        let a = Resource::from_value(json!({"id": "1", "uri": "/x", "methods": ["GET"]})).unwrap();
        let b = Resource::from_value(json!({"methods": ["GET"], "uri": "/x", "id": "1"})).unwrap();
        assert_eq!(
            ResourceCodec::encode(&a).unwrap(),
            ResourceCodec::encode(&b).unwrap()
        );
    }

    #[test]
    fn missing_id_falls_back_to_key() {
        let resource = ResourceCodec::decode("r1", br#"{"uri":"/a"}"#).unwrap();
        assert_eq!(resource.id, "r1");
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = ResourceCodec::decode("r1", b"not json").unwrap_err();
        assert!(matches!(err, TrellisError::Codec { .. }));
    }
}
