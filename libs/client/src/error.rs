use std::time::Duration;

use thiserror::Error;

use courier_core::{Envelope, ErrorCode, RequestId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Client is not connected")]
    NotConnected,

    #[error("Client is already connected or connecting")]
    AlreadyConnected,

    #[error("Client name must be a non-empty string")]
    InvalidClientName,

    #[error("Registration timed out after {0:?}")]
    RegistrationTimeout(Duration),

    #[error("Request {request_id} timed out after {after:?}")]
    Timeout {
        request_id: RequestId,
        after: Duration,
    },

    #[error("{0}")]
    TargetNotFound(String),

    #[error("{0}")]
    DeliveryFailed(String),

    /// The broker or a remote handler answered with an error
    #[error("{message}")]
    Remote {
        code: Option<ErrorCode>,
        message: String,
    },

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] courier_fabric::Error),
}

impl Error {
    /// Classify an `ERROR` envelope
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let message = envelope
            .error
            .clone()
            .unwrap_or_else(|| "Unknown error".to_string());

        match envelope.code {
            Some(ErrorCode::TargetNotFound) => Error::TargetNotFound(message),
            Some(ErrorCode::DeliveryFailed) => Error::DeliveryFailed(message),
            Some(ErrorCode::InvalidClientName) => Error::InvalidClientName,
            code => Error::Remote { code, message },
        }
    }
}

impl From<courier_core::Error> for Error {
    fn from(err: courier_core::Error) -> Self {
        Error::InvalidResponse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
