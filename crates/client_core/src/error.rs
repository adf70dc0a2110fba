use shared::error::ErrorCode;
use thiserror::Error;

/// Failure taxonomy of the REST gateway. Transport and API failures surface
/// as a store-level error status; `Unauthenticated` means the credential
/// refresh was already attempted and the session must end.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("api rejected request ({code:?}): {message}")]
    Api { code: ErrorCode, message: String },
    #[error("not authenticated")]
    Unauthenticated,
}

impl GatewayError {
    pub fn from_status(status: reqwest::StatusCode, message: String) -> Self {
        use reqwest::StatusCode;

        let code = match status {
            StatusCode::UNAUTHORIZED => ErrorCode::Unauthorized,
            StatusCode::FORBIDDEN => ErrorCode::Forbidden,
            StatusCode::NOT_FOUND => ErrorCode::NotFound,
            StatusCode::TOO_MANY_REQUESTS => ErrorCode::RateLimited,
            status if status.is_client_error() => ErrorCode::Validation,
            _ => ErrorCode::Internal,
        };
        Self::Api { code, message }
    }

    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, Self::Unauthenticated)
    }
}
