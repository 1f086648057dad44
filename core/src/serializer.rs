//! Encoding of the created-channel payload.
//!
//! A newly created session is announced with the field map of its first
//! write. Publisher and notifier must agree on the encoding; JSON is the
//! default.

use crate::error::{Result, SessionError};
use std::collections::BTreeMap;

/// Encodes and decodes the created-channel payload.
pub trait PayloadSerializer: Send + Sync {
    /// Encode a field map.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Serialization`] on failure.
    fn serialize(&self, fields: &BTreeMap<String, String>) -> Result<Vec<u8>>;

    /// Decode a field map.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Serialization`] if the payload is malformed.
    fn deserialize(&self, payload: &[u8]) -> Result<BTreeMap<String, String>>;
}

/// JSON object encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPayloadSerializer;

impl PayloadSerializer for JsonPayloadSerializer {
    fn serialize(&self, fields: &BTreeMap<String, String>) -> Result<Vec<u8>> {
        serde_json::to_vec(fields).map_err(|e| SessionError::Serialization(e.to_string()))
    }

    fn deserialize(&self, payload: &[u8]) -> Result<BTreeMap<String, String>> {
        serde_json::from_slice(payload).map_err(|e| SessionError::Serialization(e.to_string()))
    }
}

/// Compact binary encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodePayloadSerializer;

impl PayloadSerializer for BincodePayloadSerializer {
    fn serialize(&self, fields: &BTreeMap<String, String>) -> Result<Vec<u8>> {
        bincode::serialize(fields).map_err(|e| SessionError::Serialization(e.to_string()))
    }

    fn deserialize(&self, payload: &[u8]) -> Result<BTreeMap<String, String>> {
        bincode::deserialize(payload).map_err(|e| SessionError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_json_payload_is_an_object() {
        let fields = BTreeMap::from([("creationTime".to_string(), "1".to_string())]);
        let bytes = JsonPayloadSerializer.serialize(&fields).unwrap();

        assert_eq!(bytes, br#"{"creationTime":"1"}"#);
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        assert!(matches!(
            JsonPayloadSerializer.deserialize(b"not json"),
            Err(SessionError::Serialization(_))
        ));
        assert!(matches!(
            BincodePayloadSerializer.deserialize(&[0xff]),
            Err(SessionError::Serialization(_))
        ));
    }
}
