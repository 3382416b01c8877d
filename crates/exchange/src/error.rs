//! Error taxonomy for challenge redemption and token refresh

use identity::GatewayError;
use tracing::warn;

/// Errors from [`TokenOrchestrator`](crate::TokenOrchestrator) operations.
///
/// Nothing here is retried internally. `is_retryable` tells the caller
/// whether starting over (with a fresh registration for redemptions) can help.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed or out-of-policy input, including exchange type escalation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown, expired, already consumed or concurrently claimed code id.
    #[error("challenge not found")]
    ChallengeNotFound,

    #[error("code verifier does not match the registered challenge")]
    VerificationFailed,

    #[error("one-time password rejected")]
    OtpFailed,

    #[error("user creation conflict: {0}")]
    UserCreationConflict(String),

    #[error("token generation failed: {0}")]
    TokenGenerationFailed(String),

    /// Gateway deadline elapsed. The code id is spent and the gateway-side
    /// outcome is unknown.
    #[error("identity gateway timed out")]
    GatewayTimeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a caller may sensibly retry the whole flow.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TokenGenerationFailed(_) | Error::GatewayTimeout | Error::Internal(_)
        )
    }

    /// Stable snake_case identifier, used in API bodies and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::ChallengeNotFound => "challenge_not_found",
            Error::VerificationFailed => "verification_failed",
            Error::OtpFailed => "otp_failed",
            Error::UserCreationConflict(_) => "user_creation_conflict",
            Error::TokenGenerationFailed(_) => "token_generation_failed",
            Error::GatewayTimeout => "gateway_timeout",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<pkce::Error> for Error {
    fn from(err: pkce::Error) -> Self {
        match err {
            pkce::Error::InvalidRequest(msg) => Error::InvalidRequest(msg),
            pkce::Error::ChallengeNotFound => Error::ChallengeNotFound,
            pkce::Error::Internal(msg) => Error::Internal(msg),
        }
    }
}

/// Gateway detail (provider bodies, endpoint URLs) is logged here and never
/// carried into the caller-facing message.
impl From<GatewayError> for Error {
    fn from(err: GatewayError) -> Self {
        warn!(error = %err, "identity gateway call failed");
        match err {
            GatewayError::UserConflict(_) => Error::UserCreationConflict(
                "username is registered with different attributes".into(),
            ),
            GatewayError::Rejected(_) => {
                Error::TokenGenerationFailed("identity provider rejected the request".into())
            }
            GatewayError::Unavailable(_) => {
                Error::TokenGenerationFailed("identity provider unavailable".into())
            }
            GatewayError::Protocol(_) => Error::TokenGenerationFailed(
                "unexpected identity provider response".into(),
            ),
        }
    }
}

/// Result alias for exchange operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(Error::GatewayTimeout.is_retryable());
        assert!(Error::TokenGenerationFailed("x".into()).is_retryable());
        assert!(Error::Internal("collision".into()).is_retryable());

        assert!(!Error::InvalidRequest("x".into()).is_retryable());
        assert!(!Error::ChallengeNotFound.is_retryable());
        assert!(!Error::VerificationFailed.is_retryable());
        assert!(!Error::OtpFailed.is_retryable());
        assert!(!Error::UserCreationConflict("x".into()).is_retryable());
    }

    #[test]
    fn registry_errors_map_one_to_one() {
        assert_eq!(
            Error::from(pkce::Error::ChallengeNotFound),
            Error::ChallengeNotFound
        );
        assert_eq!(
            Error::from(pkce::Error::InvalidRequest("bad".into())),
            Error::InvalidRequest("bad".into())
        );
        assert_eq!(
            Error::from(pkce::Error::Internal("full".into())),
            Error::Internal("full".into())
        );
    }

    #[test]
    fn gateway_conflict_is_distinct_from_other_failures() {
        let err = Error::from(GatewayError::UserConflict("alice".into()));
        assert_eq!(err.code(), "user_creation_conflict");

        for gateway_err in [
            GatewayError::Rejected("no".into()),
            GatewayError::Unavailable("down".into()),
            GatewayError::Protocol("garbage".into()),
        ] {
            let err = Error::from(gateway_err);
            assert_eq!(err.code(), "token_generation_failed");
        }
    }

    #[test]
    fn gateway_detail_stays_out_of_the_message() {
        let detail = "refresh grant returned 401: {\"internal\":\"db-host=10.0.0.7\"}";
        for gateway_err in [
            GatewayError::UserConflict(detail.into()),
            GatewayError::Rejected(detail.into()),
            GatewayError::Unavailable(detail.into()),
            GatewayError::Protocol(detail.into()),
        ] {
            let msg = Error::from(gateway_err).to_string();
            assert!(!msg.contains("10.0.0.7"), "leaked: {msg}");
            assert!(!msg.contains("401"), "leaked: {msg}");
        }
    }
}
