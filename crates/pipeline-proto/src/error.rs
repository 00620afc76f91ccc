//! Error types for the pipeline-proto crate.

use thiserror::Error;

/// Errors that can occur while decoding or validating protocol data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    /// Failed to encode a message.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a message.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Invalid entity key for the given kind.
    #[error("invalid {kind} key: {reason}")]
    InvalidKey {
        /// Entity kind the key was parsed for.
        kind: String,
        /// Why the key was rejected.
        reason: String,
    },

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtoError::InvalidKey {
            kind: "source".to_string(),
            reason: "expected namespace/kind/name".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid source key: expected namespace/kind/name"
        );

        assert_eq!(
            ProtoError::MissingField("payload").to_string(),
            "missing required field: payload"
        );
    }

    #[test]
    fn test_from_serde_error() {
        let serde_err = serde_json::from_str::<u64>("nope").unwrap_err();
        let err = ProtoError::from(serde_err);

        assert!(matches!(err, ProtoError::Decoding(_)));
    }
}
