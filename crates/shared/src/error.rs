//! Shared error types.

use thiserror::Error;

/// Reasons an inbound frame or payload could not be decoded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not a JSON envelope.
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    /// The envelope carried an empty `type`.
    #[error("frame has an empty message type")]
    MissingType,
    /// The envelope was fine but its payload did not match the expected shape.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    pub fn invalid_payload(kind: impl Into<String>, source: serde_json::Error) -> Self {
        ProtocolError::InvalidPayload {
            kind: kind.into(),
            source,
        }
    }
}
