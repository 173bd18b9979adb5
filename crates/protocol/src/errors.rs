//! Protocol errors module

use thiserror::Error;

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("Serialization error: {source}")]
    SerializationError { source: serde_json::Error },

    #[error("Chain rejected: {reason}")]
    ChainRejected { reason: String },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::SerializationError { source: err }
    }
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedMessage {
            reason: reason.into(),
        }
    }

    pub(crate) fn rejected(reason: impl Into<String>) -> Self {
        ProtocolError::ChainRejected {
            reason: reason.into(),
        }
    }
}
