//! Redemption and refresh orchestration
//!
//! A redemption holds an exclusive [`Claim`](pkce::Claim) on the record
//! while it checks the code verifier, the exchange type guard and the OTP.
//! Any failed check drops the claim, which returns the record to pending.
//! Once every check passes the claim is committed, so the code id is spent
//! before the identity gateway is called. Gateway calls share one deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use identity::{IdentityGateway, TokenPair, UserCredentials};
use pkce::{ChallengeRecord, ChallengeRegistry, ExchangeType};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::otp::{OtpSubject, OtpVerifier};

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    /// Budget shared by all gateway calls of one redemption or refresh.
    pub gateway_timeout: Duration,
    /// Every redemption must carry an OTP.
    pub otp_required: bool,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(10),
            otp_required: false,
        }
    }
}

/// Input to [`TokenOrchestrator::redeem`].
#[derive(Debug, Clone)]
pub struct RedeemRequest {
    pub code_id: String,
    pub code_verifier: Secret<String>,
    pub exchange_type: ExchangeType,
    pub otp: Option<Secret<String>>,
    /// Required when `exchange_type` includes `user`.
    pub user_credentials: Option<UserCredentials>,
}

/// Tokens produced by one successful redemption.
///
/// A class is present exactly when it was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenBundle {
    pub client_id: String,
    #[serde(rename = "client_tokens", skip_serializing_if = "Option::is_none")]
    pub client: Option<TokenPair>,
    #[serde(rename = "user_tokens", skip_serializing_if = "Option::is_none")]
    pub user: Option<TokenPair>,
}

/// Drives redemptions from registry claim to token bundle.
pub struct TokenOrchestrator {
    registry: Arc<ChallengeRegistry>,
    gateway: Arc<dyn IdentityGateway>,
    otp: Option<Arc<dyn OtpVerifier>>,
    settings: ExchangeSettings,
}

impl TokenOrchestrator {
    pub fn new(
        registry: Arc<ChallengeRegistry>,
        gateway: Arc<dyn IdentityGateway>,
        settings: ExchangeSettings,
    ) -> Self {
        Self {
            registry,
            gateway,
            otp: None,
            settings,
        }
    }

    pub fn with_otp_verifier(mut self, verifier: Arc<dyn OtpVerifier>) -> Self {
        self.otp = Some(verifier);
        self
    }

    pub fn registry(&self) -> &Arc<ChallengeRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ExchangeSettings {
        &self.settings
    }

    /// Redeem a code id for the requested token classes.
    ///
    /// Checks run in order: verifier, exchange type guard, user credentials,
    /// OTP. On `VerificationFailed`, `OtpFailed` or `InvalidRequest` the record is
    /// left pending and can be redeemed again until it expires. Any error
    /// after verification (gateway failure, timeout) leaves the code spent.
    pub async fn redeem(&self, request: RedeemRequest) -> Result<TokenBundle> {
        let RedeemRequest {
            code_id,
            code_verifier,
            exchange_type,
            otp,
            user_credentials,
        } = request;

        if exchange_type.is_empty() {
            return Err(Error::InvalidRequest(
                "exchange type must name at least one token class".into(),
            ));
        }

        let claim = self.registry.claim(&code_id)?;
        let record = claim.record();

        if !pkce::verify(
            code_verifier.expose(),
            &record.code_challenge,
            record.code_challenge_method,
        ) {
            debug!(
                client_id = %record.client_id,
                method = %record.code_challenge_method,
                "code verifier mismatch"
            );
            return Err(Error::VerificationFailed);
        }

        if !record.requested_exchange_type.contains(exchange_type) {
            warn!(
                client_id = %record.client_id,
                registered = %record.requested_exchange_type,
                requested = %exchange_type,
                "exchange type escalation refused"
            );
            return Err(Error::InvalidRequest(format!(
                "exchange type {exchange_type} exceeds registered {}",
                record.requested_exchange_type
            )));
        }
        if exchange_type.includes_user() && user_credentials.is_none() {
            return Err(Error::InvalidRequest(
                "user tokens requested without user credentials".into(),
            ));
        }

        // OTP last: a request refused above never reaches the verifier
        let username = user_credentials
            .as_ref()
            .map(|creds| creds.identity.username.as_str());
        self.check_otp(record, username, otp.as_ref()).await?;

        let record = claim.commit();
        debug!(client_id = %record.client_id, exchange_type = %exchange_type, "challenge consumed");

        let bundle = self
            .issue(&record, exchange_type, user_credentials.as_ref())
            .await;
        match &bundle {
            Ok(_) => info!(
                client_id = %record.client_id,
                exchange_type = %exchange_type,
                gateway = self.gateway.id(),
                "tokens issued"
            ),
            Err(e) => warn!(
                client_id = %record.client_id,
                exchange_type = %exchange_type,
                gateway = self.gateway.id(),
                error = %e,
                "token issuance failed after consuming challenge"
            ),
        }
        bundle
    }

    /// Exchange a refresh token for a new pair. No registry state is involved.
    pub async fn refresh(&self, refresh_token: &Secret<String>) -> Result<TokenPair> {
        let deadline = Instant::now() + self.settings.gateway_timeout;
        let result = within(deadline, self.gateway.refresh_tokens(refresh_token)).await;
        if let Err(e) = &result {
            debug!(gateway = self.gateway.id(), error = %e, "refresh failed");
        }
        result
    }

    async fn check_otp(
        &self,
        record: &ChallengeRecord,
        username: Option<&str>,
        otp: Option<&Secret<String>>,
    ) -> Result<()> {
        let Some(otp) = otp else {
            if self.settings.otp_required {
                debug!(client_id = %record.client_id, "otp required but not supplied");
                return Err(Error::OtpFailed);
            }
            return Ok(());
        };

        let Some(verifier) = &self.otp else {
            return Err(Error::InvalidRequest(
                "otp supplied but no otp verifier is configured".into(),
            ));
        };

        let subject = OtpSubject {
            client_id: &record.client_id,
            username,
        };
        let verified =
            tokio::time::timeout(self.settings.gateway_timeout, verifier.verify(subject, otp))
                .await
                .unwrap_or_else(|_| {
                    warn!(client_id = %record.client_id, "otp verification timed out");
                    false
                });
        if verified {
            Ok(())
        } else {
            Err(Error::OtpFailed)
        }
    }

    /// Mint the requested classes, user first. Fails as a whole: tokens
    /// minted for one class are dropped if the other class fails.
    async fn issue(
        &self,
        record: &ChallengeRecord,
        exchange_type: ExchangeType,
        user_credentials: Option<&UserCredentials>,
    ) -> Result<TokenBundle> {
        let deadline = Instant::now() + self.settings.gateway_timeout;

        let user = match user_credentials.filter(|_| exchange_type.includes_user()) {
            Some(creds) => {
                let minted = within(deadline, async {
                    let user = self.gateway.find_or_create_user(creds).await?;
                    self.gateway.issue_user_tokens(&user, &creds.password).await
                })
                .await?;
                Some(minted)
            }
            None => None,
        };

        let client = if exchange_type.includes_client() {
            match within(deadline, self.gateway.issue_client_tokens(&record.client_id)).await {
                Ok(pair) => Some(pair),
                Err(e) => {
                    if user.is_some() {
                        warn!(
                            client_id = %record.client_id,
                            "discarding user tokens minted before client issuance failed"
                        );
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(TokenBundle {
            client_id: record.client_id.clone(),
            client,
            user,
        })
    }
}

/// Run a gateway call under `deadline`.
async fn within<T, F>(deadline: Instant, call: F) -> Result<T>
where
    F: Future<Output = identity::Result<T>>,
{
    match tokio::time::timeout_at(deadline, call).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::GatewayTimeout),
    }
}
