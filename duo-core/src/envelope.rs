//! Envelope codec: every application message is a JSON text frame `{"type": ..., "data": {...}}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_ENVELOPE_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// Wire-level unit exchanged once the transport is established.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl Envelope {
    /// Build an envelope from a typed payload.
    pub fn new<T: Serialize>(kind: &str, payload: &T) -> Result<Self, EnvelopeError> {
        let data = serde_json::to_value(payload).map_err(EnvelopeError::Encode)?;
        Ok(Self {
            kind: kind.to_string(),
            data,
        })
    }

    /// Envelope with an empty `data` object.
    pub fn bare(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            data: empty_object(),
        }
    }

    /// Parse `data` into the payload type expected for this envelope's kind.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.data.clone()).map_err(|source| EnvelopeError::Payload {
            kind: self.kind.clone(),
            source,
        })
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

/// Encode an envelope into a single text frame.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, EnvelopeError> {
    let text = serde_json::to_string(envelope).map_err(EnvelopeError::Encode)?;
    if text.len() > MAX_ENVELOPE_LEN {
        return Err(EnvelopeError::TooLarge);
    }
    Ok(text)
}

/// Decode one text frame. Frames without a string `type` are malformed.
pub fn decode_envelope(text: &str) -> Result<Envelope, EnvelopeError> {
    if text.len() > MAX_ENVELOPE_LEN {
        return Err(EnvelopeError::TooLarge);
    }
    serde_json::from_str(text).map_err(EnvelopeError::Decode)
}

/// Error encoding or decoding an envelope. Malformed input is dropped by callers, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("envelope too large")]
    TooLarge,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FileChunkAck, FILE_CHUNK_ACK};

    #[test]
    fn typed_payload_roundtrip() {
        let ack = FileChunkAck {
            id: "t-1".into(),
            index: 7,
        };
        let env = Envelope::new(FILE_CHUNK_ACK, &ack).unwrap();
        let text = encode_envelope(&env).unwrap();
        assert!(text.contains("\"type\":\"fileChunkAck\""));
        let decoded = decode_envelope(&text).unwrap();
        assert!(decoded.is(FILE_CHUNK_ACK));
        let back: FileChunkAck = decoded.payload().unwrap();
        assert_eq!(back.index, 7);
        assert_eq!(back.id, "t-1");
    }

    #[test]
    fn missing_data_defaults_to_empty_object() {
        let env = decode_envelope(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(env.kind, "ping");
        assert!(env.data.as_object().map(|o| o.is_empty()).unwrap_or(false));
    }

    #[test]
    fn missing_type_is_malformed() {
        assert!(matches!(
            decode_envelope(r#"{"data":{}}"#),
            Err(EnvelopeError::Decode(_))
        ));
        assert!(matches!(
            decode_envelope("not json"),
            Err(EnvelopeError::Decode(_))
        ));
    }

    #[test]
    fn wrong_payload_shape_reports_kind() {
        let env = decode_envelope(r#"{"type":"fileChunkAck","data":{"id":3}}"#).unwrap();
        match env.payload::<FileChunkAck>() {
            Err(EnvelopeError::Payload { kind, .. }) => assert_eq!(kind, "fileChunkAck"),
            other => panic!("expected payload error, got {other:?}"),
        }
    }
}
