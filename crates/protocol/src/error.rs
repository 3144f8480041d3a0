//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// An inbound frame could not be parsed into a known message shape.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// An outbound value could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::MalformedMessage(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_maps_to_malformed() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ProtocolError = err.into();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn test_error_display() {
        let err = ProtocolError::MalformedMessage("missing `kind` field".to_string());
        assert_eq!(err.to_string(), "malformed message: missing `kind` field");
    }
}
