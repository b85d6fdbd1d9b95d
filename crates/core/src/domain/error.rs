// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Message type {0} is reserved for the control protocol")]
    ReservedMessageType(u32),

    #[error("Malformed payload for message type {kind}: {reason}")]
    MalformedPayload { kind: u32, reason: String },

    #[error("Cannot encode message: {0}")]
    Encode(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
