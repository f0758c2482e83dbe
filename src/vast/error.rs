//! Error types for the Vast.ai gateway.

use thiserror::Error;

use crate::marketplace::{Classify, SpecError};

/// Errors raised by the Vast.ai gateway.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum VastError {
    /// Raised when the gateway is misconfigured.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a create request is missing a required field.
    #[error("invalid instance spec: {0}")]
    Validation(String),
    /// Raised when the offer was rented or withdrawn before it could be
    /// accepted.
    #[error("offer {offer_id} is no longer available: {message}")]
    CapacityUnavailable {
        /// Offer that could not be accepted.
        offer_id: String,
        /// Message returned by the API.
        message: String,
    },
    /// Raised when the request never produced a response.
    #[error("request to Vast.ai failed: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },
    /// Raised when the API answers with an error.
    #[error("Vast.ai returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Message returned by the API.
        message: String,
    },
    /// Raised when a response body cannot be decoded.
    #[error("malformed Vast.ai response: {message}")]
    Malformed {
        /// Description of the decoding failure.
        message: String,
    },
}

impl Classify for VastError {
    fn is_capacity_unavailable(&self) -> bool {
        matches!(self, Self::CapacityUnavailable { .. })
    }
}

impl From<reqwest::Error> for VastError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport {
            message: value.to_string(),
        }
    }
}

impl From<SpecError> for VastError {
    fn from(value: SpecError) -> Self {
        match value {
            SpecError::Validation(field) => Self::Validation(field),
        }
    }
}
