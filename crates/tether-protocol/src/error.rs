//! Error types for the protocol layer.

/// Errors from encoding, decoding, or validating wire messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// The bytes are not a well-formed message: malformed JSON, a missing
    /// field, or an unknown `type` tag.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message decoded but breaks a protocol rule, such as an empty
    /// ticket or an unknown status code.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
