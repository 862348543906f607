//! Opaque value handles and the serializer collaborator.
//!
//! The engine treats the payload it manages as opaque: it never inspects a
//! value beyond asking it to encode itself to bytes, and never constructs
//! one except by handing encoded bytes back to a [`ValueCodec`]. Both the
//! handle type and the codec are external collaborators (see the crate's
//! scope notes); [`JsonValue`]/[`JsonCodec`] are the default implementation
//! used by the test suite and available for callers who don't need a
//! custom wire format.

use std::sync::Arc;

use crate::error::Error;

/// An opaque, reference-counted value handle.
///
/// Implementations must encode deterministically: two encodes of an
/// unmodified value must produce identical bytes, since the engine relies
/// on byte-equality to prove round-trip correctness.
pub trait ValueHandle: Send + Sync + std::fmt::Debug {
    /// Serializes this value to bytes.
    fn encode(&self) -> Vec<u8>;
}

/// A managed value, shared by every `StorageState` snapshot that currently
/// holds it in memory.
pub type Value = Arc<dyn ValueHandle>;

/// Decodes bytes produced by [`ValueHandle::encode`] back into a value.
pub trait ValueCodec: Send + Sync + std::fmt::Debug {
    fn decode(&self, bytes: &[u8]) -> Result<Value, Error>;
}

/// A JSON-backed value handle, used as the engine's default payload type.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonValue(pub serde_json::Value);

impl JsonValue {
    #[must_use]
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn into_value(self) -> Arc<dyn ValueHandle> {
        Arc::new(self)
    }
}

impl ValueHandle for JsonValue {
    fn encode(&self) -> Vec<u8> {
        // `serde_json::Value` serializes deterministically (object key order
        // is insertion order, preserved by `serde_json`'s default map).
        serde_json::to_vec(&self.0).expect("serde_json::Value always serializes")
    }
}

/// The default [`ValueCodec`], round-tripping [`JsonValue`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Value, Error> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))?;
        Ok(Arc::new(JsonValue(value)))
    }
}

/// Compares two values by their encoded bytes -- the engine's notion of
/// "byte-equivalent" from the round-trip invariants.
#[must_use]
pub fn values_byte_equal(a: &Value, b: &Value) -> bool {
    a.encode() == b.encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_value_round_trips_through_codec() {
        let original: Value = JsonValue::new(serde_json::json!({"a": 1, "b": [1,2,3]})).into_value();
        let bytes = original.encode();
        let decoded = JsonCodec.decode(&bytes).unwrap();
        assert!(values_byte_equal(&original, &decoded));
    }
}
