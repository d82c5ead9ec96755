use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Envelope has no data payload")]
    MissingPayload,

    #[error("{0}")]
    Custom(String),
}

impl Error {
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable classification carried by `ERROR` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Envelope could not be decoded or lacks required routing fields.
    InvalidMessage,
    /// `REGISTER` without a usable string name.
    InvalidClientName,
    /// The sending port never completed registration.
    NotRegistered,
    /// Point-to-point target is not registered.
    TargetNotFound,
    /// Writing to the target's port failed; the target was evicted.
    DeliveryFailed,
    /// A remote handler returned an error.
    HandlerFailed,
    /// The recipient has no handler for the payload type.
    NoHandler,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::InvalidClientName => "INVALID_CLIENT_NAME",
            ErrorCode::NotRegistered => "NOT_REGISTERED",
            ErrorCode::TargetNotFound => "TARGET_NOT_FOUND",
            ErrorCode::DeliveryFailed => "DELIVERY_FAILED",
            ErrorCode::HandlerFailed => "HANDLER_FAILED",
            ErrorCode::NoHandler => "NO_HANDLER",
        };
        f.write_str(s)
    }
}
