//! HTTP handlers for the challenge and token endpoints
//!
//! - `POST /challenges` registers a challenge and returns its code id
//! - `POST /token` redeems a code id for tokens
//! - `POST /token/refresh` exchanges a refresh token

use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::Secret;
use exchange::RedeemRequest;
use identity::UserCredentials;
use pkce::{ChallengeMethod, ExchangeType, RegistrationRequest};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::AppState;
use crate::error::ApiError;
use crate::metrics;

fn request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Unwrap a JSON body, turning extractor rejections into `InvalidRequest`.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError(exchange::Error::InvalidRequest(rejection.body_text())))
}

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub client_id: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub exchange_type: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub code_id: String,
    pub client_id: String,
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
pub struct TokenBody {
    pub code_id: String,
    pub code_verifier: Secret<String>,
    pub exchange_type: Vec<String>,
    #[serde(default)]
    pub otp: Option<Secret<String>>,
    #[serde(default)]
    pub user: Option<UserCredentials>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshBody {
    pub refresh_token: Secret<String>,
}

#[instrument(skip_all, fields(request_id = %request_id()))]
pub async fn register_challenge(
    State(state): State<AppState>,
    payload: Result<Json<RegisterBody>, JsonRejection>,
) -> Response {
    let result = register(&state, payload);
    metrics::record_registration(match &result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    });
    match result {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(e) => e.into_response(),
    }
}

fn register(
    state: &AppState,
    payload: Result<Json<RegisterBody>, JsonRejection>,
) -> Result<RegisterResponse, ApiError> {
    let body = body(payload)?;
    let method: ChallengeMethod = body.code_challenge_method.parse()?;
    let exchange_type = ExchangeType::from_names(&body.exchange_type)?;

    let code_id = state.registry.register(RegistrationRequest {
        client_id: body.client_id.clone(),
        code_challenge: body.code_challenge,
        code_challenge_method: method,
        requested_exchange_type: exchange_type,
    })?;
    debug!(client_id = %body.client_id, %method, %exchange_type, "challenge registered");

    Ok(RegisterResponse {
        code_id,
        client_id: body.client_id,
        expires_in: state.registry.settings().ttl.as_secs(),
    })
}

#[instrument(skip_all, fields(request_id = %request_id()))]
pub async fn redeem_token(
    State(state): State<AppState>,
    payload: Result<Json<TokenBody>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let result = redeem(&state, payload).await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    metrics::record_redemption(outcome, started.elapsed().as_secs_f64());
    match result {
        Ok(bundle) => Json(bundle).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn redeem(
    state: &AppState,
    payload: Result<Json<TokenBody>, JsonRejection>,
) -> Result<exchange::TokenBundle, ApiError> {
    let body = body(payload)?;
    let exchange_type = ExchangeType::from_names(&body.exchange_type)?;
    let bundle = state
        .orchestrator
        .redeem(RedeemRequest {
            code_id: body.code_id,
            code_verifier: body.code_verifier,
            exchange_type,
            otp: body.otp,
            user_credentials: body.user,
        })
        .await?;
    Ok(bundle)
}

#[instrument(skip_all, fields(request_id = %request_id()))]
pub async fn refresh_token(
    State(state): State<AppState>,
    payload: Result<Json<RefreshBody>, JsonRejection>,
) -> Response {
    let result = match body(payload) {
        Ok(body) => state
            .orchestrator
            .refresh(&body.refresh_token)
            .await
            .map_err(ApiError::from),
        Err(e) => Err(e),
    };
    metrics::record_refresh(match &result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    });
    match result {
        Ok(pair) => Json(pair).into_response(),
        Err(e) => e.into_response(),
    }
}
