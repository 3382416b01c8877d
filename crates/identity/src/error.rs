//! Error types for identity backend operations

/// Errors reported by an identity gateway.
///
/// None of these are retried by the gateway itself; the caller decides.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// A user with this username exists with different attributes.
    #[error("user conflict: {0}")]
    UserConflict(String),

    /// The backend refused the grant (bad credentials, unknown client, revoked token).
    #[error("rejected by identity provider: {0}")]
    Rejected(String),

    /// Transport failure or 5xx; the outcome on the backend is unknown.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with something we could not interpret.
    #[error("unexpected identity provider response: {0}")]
    Protocol(String),
}

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
