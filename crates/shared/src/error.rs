use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Raised when an inbound socket envelope cannot be decoded into the payload
/// its `(subsystem, action)` pair promises.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope has no data payload")]
    MissingData,
    #[error("envelope payload does not match the action schema: {0}")]
    Payload(#[from] serde_json::Error),
}
