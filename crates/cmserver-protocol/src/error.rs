//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while framing or decoding messages.
///
/// Every variant is fatal for the connection that produced it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Buffered bytes exceeded the framer bound without a complete envelope.
    #[error("frame buffer overflow: {size} bytes buffered (max: {max})")]
    BufferOverflow { size: usize, max: usize },

    /// Failed to serialize or deserialize a JSON payload.
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Extracted payload was not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Payload is JSON but not an object with a string `type` field.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Outgoing payload contains a framing marker and would corrupt the stream.
    #[error("payload contains a framing marker")]
    MarkerInPayload,
}
