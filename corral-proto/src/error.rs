//! Error types for envelope and payload decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Errors produced while decoding wire messages.
///
/// These never reach a broker caller: a malformed inbound message is logged
/// and dropped because a shared raw transport may carry unrelated traffic.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The raw message is not a well-formed envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The envelope payload is not a well-formed RPC object.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
