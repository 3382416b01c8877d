//! HTTP mapping for exchange errors
//!
//! Error bodies are `{"error": "<code>", "message": "...", "retryable": bool}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Error returned by API handlers.
#[derive(Debug)]
pub struct ApiError(pub exchange::Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        use exchange::Error;
        match self.0 {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::ChallengeNotFound => StatusCode::NOT_FOUND,
            Error::VerificationFailed | Error::OtpFailed => StatusCode::UNAUTHORIZED,
            Error::UserCreationConflict(_) => StatusCode::CONFLICT,
            Error::TokenGenerationFailed(_) => StatusCode::BAD_GATEWAY,
            Error::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        self.0.code()
    }
}

impl From<exchange::Error> for ApiError {
    fn from(err: exchange::Error) -> Self {
        ApiError(err)
    }
}

impl From<pkce::Error> for ApiError {
    fn from(err: pkce::Error) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
