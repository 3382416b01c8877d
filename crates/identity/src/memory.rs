//! In-process identity gateway
//!
//! Users, passwords and refresh tokens live in a tokio Mutex-guarded map.
//! Tokens are opaque random strings; refresh tokens rotate on every use.
//! Intended for local development and tests, not for production identity.

use std::collections::{HashMap, HashSet};

use common::Secret;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::{GatewayFuture, IdentityGateway, TokenPair, UserCredentials, UserIdentity, UserRef};

/// Lifetime reported for minted access tokens.
const ACCESS_TOKEN_TTL_SECS: u64 = 300;

struct StoredUser {
    id: String,
    identity: UserIdentity,
    password: Secret<String>,
}

/// Who a refresh token was minted for.
#[derive(Debug, Clone)]
enum Subject {
    User(String),
    Client(String),
}

#[derive(Default)]
struct State {
    /// Keyed by username
    users: HashMap<String, StoredUser>,
    refresh_tokens: HashMap<String, Subject>,
}

/// Identity gateway backed by process memory.
pub struct InMemoryGateway {
    state: Mutex<State>,
    /// `None` accepts any client id.
    known_clients: Option<HashSet<String>>,
}

impl InMemoryGateway {
    /// Gateway that mints client tokens for any client id.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            known_clients: None,
        }
    }

    /// Gateway that only mints client tokens for the listed client ids.
    pub fn with_clients<I, S>(clients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Mutex::new(State::default()),
            known_clients: Some(clients.into_iter().map(Into::into).collect()),
        }
    }

    pub async fn user_count(&self) -> usize {
        self.state.lock().await.users.len()
    }

    fn mint(state: &mut State, subject: Subject) -> TokenPair {
        let access_token = format!("at_{}", uuid::Uuid::new_v4().as_simple());
        let refresh_token = format!("rt_{}", uuid::Uuid::new_v4().as_simple());
        state.refresh_tokens.insert(refresh_token.clone(), subject);
        TokenPair {
            access_token,
            refresh_token: Some(refresh_token),
            expires_in: Some(ACCESS_TOKEN_TTL_SECS),
        }
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityGateway for InMemoryGateway {
    fn id(&self) -> &str {
        "memory"
    }

    fn find_or_create_user<'a>(
        &'a self,
        credentials: &'a UserCredentials,
    ) -> GatewayFuture<'a, UserRef> {
        Box::pin(async move {
            let identity = &credentials.identity;
            let mut state = self.state.lock().await;

            if let Some(existing) = state.users.get(&identity.username) {
                if identity.email.is_some() && existing.identity.email != identity.email {
                    return Err(GatewayError::UserConflict(format!(
                        "user {} exists with a different email",
                        identity.username
                    )));
                }
                debug!(username = %identity.username, "user already exists");
                return Ok(UserRef {
                    id: existing.id.clone(),
                    username: identity.username.clone(),
                });
            }

            let id = uuid::Uuid::new_v4().to_string();
            state.users.insert(
                identity.username.clone(),
                StoredUser {
                    id: id.clone(),
                    identity: identity.clone(),
                    password: credentials.password.clone(),
                },
            );
            info!(username = %identity.username, "user created");
            Ok(UserRef {
                id,
                username: identity.username.clone(),
            })
        })
    }

    fn issue_user_tokens<'a>(
        &'a self,
        user: &'a UserRef,
        password: &'a Secret<String>,
    ) -> GatewayFuture<'a, TokenPair> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let authenticated = state.users.get(&user.username).is_some_and(|stored| {
                stored.id == user.id
                    && bool::from(
                        stored
                            .password
                            .expose()
                            .as_bytes()
                            .ct_eq(password.expose().as_bytes()),
                    )
            });
            if !authenticated {
                return Err(GatewayError::Rejected("invalid user credentials".into()));
            }
            Ok(Self::mint(&mut state, Subject::User(user.username.clone())))
        })
    }

    fn issue_client_tokens<'a>(&'a self, client_id: &'a str) -> GatewayFuture<'a, TokenPair> {
        Box::pin(async move {
            if self
                .known_clients
                .as_ref()
                .is_some_and(|known| !known.contains(client_id))
            {
                return Err(GatewayError::Rejected(format!("unknown client {client_id}")));
            }
            let mut state = self.state.lock().await;
            Ok(Self::mint(&mut state, Subject::Client(client_id.to_string())))
        })
    }

    fn refresh_tokens<'a>(
        &'a self,
        refresh_token: &'a Secret<String>,
    ) -> GatewayFuture<'a, TokenPair> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let subject = state
                .refresh_tokens
                .remove(refresh_token.expose())
                .ok_or_else(|| GatewayError::Rejected("invalid refresh token".into()))?;
            debug!(?subject, "refresh token rotated");
            Ok(Self::mint(&mut state, subject))
        })
    }
}
