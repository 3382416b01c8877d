//! Identity backend abstraction
//!
//! Defines the `IdentityGateway` trait that decouples token orchestration
//! from the identity provider. `HttpIdentityGateway` talks to an OpenID
//! Connect provider (token endpoint + admin REST API); `InMemoryGateway`
//! keeps users and tokens in process for development and tests.

pub mod error;
pub mod http;
pub mod memory;

pub use error::{GatewayError, Result};
pub use http::{HttpGatewaySettings, HttpIdentityGateway};
pub use memory::InMemoryGateway;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use common::Secret;
use serde::{Deserialize, Serialize};

/// Boxed future returned by gateway operations.
pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Access/refresh token pair minted by the identity provider.
///
/// Field names match the OAuth 2.0 token response so provider responses
/// deserialize directly. Client-credential grants usually carry no refresh token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Public attributes of a user, as supplied with a redemption request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

/// Identity plus the password used to create the user and mint its tokens.
#[derive(Debug, Clone, Deserialize)]
pub struct UserCredentials {
    #[serde(flatten)]
    pub identity: UserIdentity,
    pub password: Secret<String>,
}

/// Handle to a user that exists in the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRef {
    pub id: String,
    pub username: String,
}

/// Abstraction over the identity provider.
///
/// All operations are treated as not idempotent: implementations must not
/// retry internally, and callers only retry with explicit judgment.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn IdentityGateway>`).
pub trait IdentityGateway: Send + Sync {
    /// Identifier for logging (e.g. "http", "memory")
    fn id(&self) -> &str;

    /// Return the user named in `credentials`, creating it if absent.
    ///
    /// An existing user whose attributes disagree with the supplied identity
    /// is a `UserConflict`.
    fn find_or_create_user<'a>(
        &'a self,
        credentials: &'a UserCredentials,
    ) -> GatewayFuture<'a, UserRef>;

    /// Mint user-scoped tokens with the user's password.
    fn issue_user_tokens<'a>(
        &'a self,
        user: &'a UserRef,
        password: &'a Secret<String>,
    ) -> GatewayFuture<'a, TokenPair>;

    /// Mint client-scoped tokens for `client_id`.
    fn issue_client_tokens<'a>(&'a self, client_id: &'a str) -> GatewayFuture<'a, TokenPair>;

    /// Exchange a refresh token for a new pair.
    fn refresh_tokens<'a>(&'a self, refresh_token: &'a Secret<String>)
    -> GatewayFuture<'a, TokenPair>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_pair_deserializes_oauth_response() {
        let json = r#"{"access_token":"at_abc","refresh_token":"rt_def","expires_in":300,"token_type":"Bearer"}"#;
        let pair: TokenPair = serde_json::from_str(json).unwrap();
        assert_eq!(pair.access_token, "at_abc");
        assert_eq!(pair.refresh_token.as_deref(), Some("rt_def"));
        assert_eq!(pair.expires_in, Some(300));
    }

    #[test]
    fn token_pair_without_refresh_token() {
        let pair: TokenPair = serde_json::from_str(r#"{"access_token":"at_abc"}"#).unwrap();
        assert!(pair.refresh_token.is_none());
        let json = serde_json::to_string(&pair).unwrap();
        assert_eq!(json, r#"{"access_token":"at_abc"}"#);
    }

    #[test]
    fn token_pair_debug_redacts_tokens() {
        let pair = TokenPair {
            access_token: "at_secret".into(),
            refresh_token: Some("rt_secret".into()),
            expires_in: Some(60),
        };
        let debug = format!("{pair:?}");
        assert!(!debug.contains("at_secret"));
        assert!(!debug.contains("rt_secret"));
        assert!(debug.contains("expires_in: Some(60)"));
    }

    #[test]
    fn user_credentials_deserialize_flat() {
        let json = r#"{"username":"alice","email":"alice@example.com","password":"hunter2"}"#;
        let creds: UserCredentials = serde_json::from_str(json).unwrap();
        assert_eq!(creds.identity.username, "alice");
        assert_eq!(creds.identity.email.as_deref(), Some("alice@example.com"));
        assert!(creds.identity.first_name.is_none());
        assert_eq!(creds.password.expose(), "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
