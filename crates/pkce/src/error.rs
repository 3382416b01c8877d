//! Error types for challenge registration and consumption

/// Errors from registry operations.
///
/// `ChallengeNotFound` deliberately carries no detail: an unknown, expired,
/// already-consumed or in-flight `code_id` all produce the same value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("challenge not found")]
    ChallengeNotFound,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for registry operations.
pub type Result<T> = std::result::Result<T, Error>;
