//! OpenID Connect identity gateway
//!
//! Token grants go to the provider's token endpoint
//! (`{issuer_url}/protocol/openid-connect/token`):
//! - `client_credentials` with the registered client's own secret
//! - `password` and `refresh_token` with the service account client
//!
//! User lookup and creation use the admin REST API (`{admin_url}/users`),
//! authorised with a fresh service-account token per call.

use std::collections::HashMap;

use common::Secret;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::{GatewayFuture, IdentityGateway, TokenPair, UserCredentials, UserIdentity, UserRef};

/// Connection settings for an OpenID Connect provider.
#[derive(Debug, Clone)]
pub struct HttpGatewaySettings {
    /// Realm issuer, e.g. `https://idp.example.com/realms/main`
    pub issuer_url: String,
    /// Admin API base, e.g. `https://idp.example.com/admin/realms/main`
    pub admin_url: String,
    pub service_client_id: String,
    pub service_client_secret: Secret<String>,
    /// Secrets for the clients allowed to obtain client-scoped tokens
    pub client_secrets: HashMap<String, Secret<String>>,
}

/// User representation returned by the admin API.
#[derive(Debug, Deserialize)]
struct AdminUser {
    id: String,
    username: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewUser<'a> {
    username: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    first_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_name: Option<&'a str>,
    enabled: bool,
    credentials: [NewCredential<'a>; 1],
}

#[derive(Serialize)]
struct NewCredential<'a> {
    #[serde(rename = "type")]
    credential_type: &'static str,
    value: &'a str,
    temporary: bool,
}

/// Identity gateway backed by an OpenID Connect provider over HTTP.
pub struct HttpIdentityGateway {
    client: reqwest::Client,
    settings: HttpGatewaySettings,
}

impl HttpIdentityGateway {
    pub fn new(client: reqwest::Client, settings: HttpGatewaySettings) -> Self {
        info!(
            issuer_url = %settings.issuer_url,
            clients = settings.client_secrets.len(),
            "http identity gateway configured"
        );
        Self { client, settings }
    }

    fn token_endpoint(&self) -> String {
        format!(
            "{}/protocol/openid-connect/token",
            self.settings.issuer_url.trim_end_matches('/')
        )
    }

    fn users_endpoint(&self) -> String {
        format!("{}/users", self.settings.admin_url.trim_end_matches('/'))
    }

    /// POST a grant to the token endpoint and decode the token response.
    async fn token_grant(&self, form: &[(&str, &str)], grant: &str) -> Result<TokenPair> {
        let response = self
            .client
            .post(self.token_endpoint())
            .form(form)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("{grant} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(classify_failure(status, grant, &body));
        }

        response
            .json::<TokenPair>()
            .await
            .map_err(|e| GatewayError::Protocol(format!("invalid {grant} response: {e}")))
    }

    async fn admin_token(&self) -> Result<String> {
        let pair = self
            .token_grant(
                &[
                    ("grant_type", "client_credentials"),
                    ("client_id", self.settings.service_client_id.as_str()),
                    (
                        "client_secret",
                        self.settings.service_client_secret.expose().as_str(),
                    ),
                ],
                "service account",
            )
            .await?;
        Ok(pair.access_token)
    }

    async fn find_user(&self, admin_token: &str, username: &str) -> Result<Option<AdminUser>> {
        let response = self
            .client
            .get(self.users_endpoint())
            .bearer_auth(admin_token)
            .query(&[("username", username), ("exact", "true")])
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("user lookup failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(classify_failure(status, "user lookup", &body));
        }

        let users = response
            .json::<Vec<AdminUser>>()
            .await
            .map_err(|e| GatewayError::Protocol(format!("invalid user lookup response: {e}")))?;
        Ok(users.into_iter().find(|u| u.username == username))
    }

    /// Create the user. A 409 means someone created the same username first;
    /// the caller's re-lookup decides whether that user matches.
    async fn create_user(&self, admin_token: &str, credentials: &UserCredentials) -> Result<()> {
        let identity = &credentials.identity;
        let body = NewUser {
            username: &identity.username,
            email: identity.email.as_deref(),
            first_name: identity.first_name.as_deref(),
            last_name: identity.last_name.as_deref(),
            enabled: true,
            credentials: [NewCredential {
                credential_type: "password",
                value: credentials.password.expose(),
                temporary: false,
            }],
        };

        let response = self
            .client
            .post(self.users_endpoint())
            .bearer_auth(admin_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("user creation failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            debug!(username = %identity.username, "user created concurrently");
            return Ok(());
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(classify_failure(status, "user creation", &body));
        }
        info!(username = %identity.username, "user created in identity provider");
        Ok(())
    }
}

/// Map a non-success status to a gateway error.
///
/// 400/401/403 are refusals (bad grant, bad credentials, revoked token),
/// 429/5xx mean the provider is not answering reliably. Anything else is
/// unexpected. User creation handles its own 409 before getting here.
fn classify_failure(status: StatusCode, operation: &str, body: &str) -> GatewayError {
    let detail = format!("{operation} returned {status}: {body}");
    match status.as_u16() {
        400 | 401 | 403 => GatewayError::Rejected(detail),
        429 | 500..=599 => GatewayError::Unavailable(detail),
        _ => GatewayError::Protocol(detail),
    }
}

/// Accept a stored user only if it agrees with the supplied attributes.
fn matching_user(identity: &UserIdentity, stored: AdminUser) -> Result<UserRef> {
    if identity.email.is_some() && stored.email != identity.email {
        warn!(username = %identity.username, "existing user has a different email");
        return Err(GatewayError::UserConflict(format!(
            "user {} exists with a different email",
            identity.username
        )));
    }
    Ok(UserRef {
        id: stored.id,
        username: stored.username,
    })
}

impl IdentityGateway for HttpIdentityGateway {
    fn id(&self) -> &str {
        "http"
    }

    fn find_or_create_user<'a>(
        &'a self,
        credentials: &'a UserCredentials,
    ) -> GatewayFuture<'a, UserRef> {
        Box::pin(async move {
            let identity = &credentials.identity;
            let admin_token = self.admin_token().await?;

            if let Some(existing) = self.find_user(&admin_token, &identity.username).await? {
                debug!(username = %identity.username, "user already exists");
                return matching_user(identity, existing);
            }

            self.create_user(&admin_token, credentials).await?;

            let created = self
                .find_user(&admin_token, &identity.username)
                .await?
                .ok_or_else(|| {
                    GatewayError::Protocol(format!(
                        "user {} created but not found",
                        identity.username
                    ))
                })?;
            matching_user(identity, created)
        })
    }

    fn issue_user_tokens<'a>(
        &'a self,
        user: &'a UserRef,
        password: &'a Secret<String>,
    ) -> GatewayFuture<'a, TokenPair> {
        Box::pin(async move {
            self.token_grant(
                &[
                    ("grant_type", "password"),
                    ("client_id", self.settings.service_client_id.as_str()),
                    (
                        "client_secret",
                        self.settings.service_client_secret.expose().as_str(),
                    ),
                    ("username", user.username.as_str()),
                    ("password", password.expose().as_str()),
                ],
                "password grant",
            )
            .await
        })
    }

    fn issue_client_tokens<'a>(&'a self, client_id: &'a str) -> GatewayFuture<'a, TokenPair> {
        Box::pin(async move {
            let secret = self.settings.client_secrets.get(client_id).ok_or_else(|| {
                GatewayError::Rejected(format!("no client secret configured for {client_id}"))
            })?;
            self.token_grant(
                &[
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id),
                    ("client_secret", secret.expose().as_str()),
                ],
                "client credentials grant",
            )
            .await
        })
    }

    fn refresh_tokens<'a>(
        &'a self,
        refresh_token: &'a Secret<String>,
    ) -> GatewayFuture<'a, TokenPair> {
        Box::pin(async move {
            self.token_grant(
                &[
                    ("grant_type", "refresh_token"),
                    ("client_id", self.settings.service_client_id.as_str()),
                    (
                        "client_secret",
                        self.settings.service_client_secret.expose().as_str(),
                    ),
                    ("refresh_token", refresh_token.expose().as_str()),
                ],
                "refresh grant",
            )
            .await
        })
    }
}
