//! Response payload serialization.

use bytes::Bytes;
use thiserror::Error;

/// Body of a full (non-chunked) response before serialization.
#[derive(Debug, Clone, Default)]
pub enum ResponsePayload {
    #[default]
    Empty,
    /// Pre-encoded bytes, passed through untouched.
    Bytes(Bytes),
    /// A structured value serialized by the configured [`Serializer`].
    Json(serde_json::Value),
}

impl ResponsePayload {
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, SerializeError> {
        serde_json::to_value(value)
            .map(ResponsePayload::Json)
            .map_err(|e| SerializeError(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ResponsePayload::Empty)
    }
}

#[derive(Error, Debug)]
#[error("payload serialization failed: {0}")]
pub struct SerializeError(pub String);

/// Turns a [`ResponsePayload`] into wire bytes. The sender consults this
/// exactly once per full response.
pub trait Serializer {
    fn serialize(&self, payload: &ResponsePayload) -> Result<Bytes, SerializeError>;

    /// Mime type of the serialized representation, used when the response
    /// does not name one itself.
    fn mime_type(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, payload: &ResponsePayload) -> Result<Bytes, SerializeError> {
        match payload {
            ResponsePayload::Empty => Ok(Bytes::new()),
            ResponsePayload::Bytes(b) => Ok(b.clone()),
            ResponsePayload::Json(v) => serde_json::to_vec(v)
                .map(Bytes::from)
                .map_err(|e| SerializeError(e.to_string())),
        }
    }

    fn mime_type(&self) -> &str {
        "application/json"
    }
}

/// Generic error body, also used as the substitute when serializing the real
/// payload fails.
pub fn error_payload(message: &str, error_uid: &str) -> ResponsePayload {
    ResponsePayload::Json(serde_json::json!({
        "error_id": error_uid,
        "message": message,
    }))
}
