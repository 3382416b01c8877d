//! PKCE token exchange service
//!
//! Single-binary Rust service that:
//! 1. Registers PKCE challenges and hands out single-use code ids
//! 2. Redeems a code id plus verifier for client and/or user tokens
//! 3. Forwards refresh grants to the identity provider
//! 4. Sweeps expired challenges in the background

mod api;
mod config;
mod error;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use exchange::{HttpOtpVerifier, TokenOrchestrator};
use identity::{HttpIdentityGateway, IdentityGateway, InMemoryGateway};
use metrics_exporter_prometheus::PrometheusHandle;
use pkce::ChallengeRegistry;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, IdentityMode};

/// How long in-flight requests may take to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    registry: Arc<ChallengeRegistry>,
    orchestrator: Arc<TokenOrchestrator>,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// A concurrency limit layer caps in-flight requests at `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/challenges", post(api::register_challenge))
        .route("/token", post(api::redeem_token))
        .route("/token/refresh", post(api::refresh_token))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Pick the identity gateway for the configured mode.
fn build_gateway(config: &Config, client: &reqwest::Client) -> Result<Arc<dyn IdentityGateway>> {
    let gateway: Arc<dyn IdentityGateway> = match config.identity.mode {
        IdentityMode::Http => {
            let settings = config.identity.http_settings()?;
            Arc::new(HttpIdentityGateway::new(client.clone(), settings))
        }
        IdentityMode::Memory => {
            warn!("using in-memory identity gateway; users and tokens are lost on restart");
            if config.identity.clients.is_empty() {
                Arc::new(InMemoryGateway::new())
            } else {
                Arc::new(InMemoryGateway::with_clients(config.identity.client_ids()))
            }
        }
    };
    Ok(gateway)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting pkce-service");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        ttl_secs = config.registry.ttl_secs,
        max_pending = config.registry.max_pending,
        identity_mode = ?config.identity.mode,
        otp = config.otp.is_some(),
        "configuration loaded"
    );

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.exchange.gateway_timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let registry = Arc::new(ChallengeRegistry::new(config.registry_settings()));
    let gateway = build_gateway(&config, &http_client)?;

    let mut orchestrator =
        TokenOrchestrator::new(registry.clone(), gateway, config.exchange_settings());
    if let Some(otp) = &config.otp {
        orchestrator = orchestrator.with_otp_verifier(Arc::new(HttpOtpVerifier::new(
            http_client.clone(),
            otp.verify_url.clone(),
        )));
    }

    let sweeper = pkce::spawn_sweep_task(
        registry.clone(),
        config.sweep_interval(),
        metrics::set_stored_challenges,
    );

    let app_state = AppState {
        registry,
        orchestrator: Arc::new(orchestrator),
        started_at: Instant::now(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: signal the server to drain, then race it against the timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    sweeper.abort();
    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: stored challenge count and uptime.
///
/// `stored_challenges` counts every record the registry holds: pending ones,
/// ones a redemption is evaluating, and expired ones not yet swept.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stored = state.registry.len();
    metrics::set_stored_challenges(stored);

    let body = serde_json::json!({
        "status": "healthy",
        "stored_challenges": stored,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use exchange::ExchangeSettings;
    use pkce::{ChallengeMethod, RegistrySettings, compute_challenge};
    use tower::ServiceExt;

    /// PrometheusHandle without installing a global recorder, so tests can
    /// build as many as they like in one process.
    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    fn test_state_with(gateway: Arc<dyn IdentityGateway>) -> AppState {
        let registry = Arc::new(ChallengeRegistry::new(RegistrySettings {
            ttl: Duration::from_secs(60),
            ..RegistrySettings::default()
        }));
        let orchestrator =
            TokenOrchestrator::new(registry.clone(), gateway, ExchangeSettings::default());
        AppState {
            registry,
            orchestrator: Arc::new(orchestrator),
            started_at: Instant::now(),
            prometheus: test_prometheus_handle(),
        }
    }

    fn test_state() -> AppState {
        test_state_with(Arc::new(InMemoryGateway::new()))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = build_router(state.clone(), 100)
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    async fn register_s256(state: &AppState, verifier: &str, exchange_type: &[&str]) -> String {
        let (status, json) = send(
            state,
            post_json(
                "/challenges",
                serde_json::json!({
                    "client_id": "app1",
                    "code_challenge": compute_challenge(verifier),
                    "code_challenge_method": "S256",
                    "exchange_type": exchange_type,
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "body: {json}");
        json["code_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn register_returns_code_id_and_ttl() {
        let state = test_state();
        let (status, json) = send(
            &state,
            post_json(
                "/challenges",
                serde_json::json!({
                    "client_id": "app1",
                    "code_challenge": compute_challenge("verifier-abc"),
                    "code_challenge_method": "S256",
                    "exchange_type": ["client"],
                }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert!(json["code_id"].as_str().unwrap().starts_with("c_"));
        assert_eq!(json["client_id"], "app1");
        assert_eq!(json["expires_in"], 60);
        assert_eq!(state.registry.len(), 1);
    }

    #[tokio::test]
    async fn register_rejects_unknown_method() {
        let state = test_state();
        let (status, json) = send(
            &state,
            post_json(
                "/challenges",
                serde_json::json!({
                    "client_id": "app1",
                    "code_challenge": "abc",
                    "code_challenge_method": "S512",
                    "exchange_type": ["client"],
                }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_request");
        assert_eq!(json["retryable"], false);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn malformed_json_is_invalid_request() {
        let state = test_state();
        let request = Request::builder()
            .method("POST")
            .uri("/token")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, json) = send(&state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_request");
    }

    #[tokio::test]
    async fn token_redeems_once() {
        let state = test_state();
        let code_id = register_s256(&state, "verifier-abc", &["client"]).await;
        let redeem = serde_json::json!({
            "code_id": code_id,
            "code_verifier": "verifier-abc",
            "exchange_type": ["client"],
        });

        let (status, json) = send(&state, post_json("/token", redeem.clone())).await;
        assert_eq!(status, StatusCode::OK, "body: {json}");
        assert_eq!(json["client_id"], "app1");
        assert!(json["client_tokens"]["access_token"].is_string());
        assert!(json.get("user_tokens").is_none());

        let (status, json) = send(&state, post_json("/token", redeem)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "challenge_not_found");
    }

    #[tokio::test]
    async fn wrong_verifier_is_unauthorized_and_retryable_with_right_one() {
        let state = test_state();
        let code_id = register_s256(&state, "verifier-abc", &["client"]).await;

        let (status, json) = send(
            &state,
            post_json(
                "/token",
                serde_json::json!({
                    "code_id": code_id,
                    "code_verifier": "verifier-xyz",
                    "exchange_type": ["client"],
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "verification_failed");

        let (status, _) = send(
            &state,
            post_json(
                "/token",
                serde_json::json!({
                    "code_id": code_id,
                    "code_verifier": "verifier-abc",
                    "exchange_type": ["client"],
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn token_with_user_credentials() {
        let state = test_state();
        let code_id = register_s256(&state, "verifier-abc", &["client", "user"]).await;

        let (status, json) = send(
            &state,
            post_json(
                "/token",
                serde_json::json!({
                    "code_id": code_id,
                    "code_verifier": "verifier-abc",
                    "exchange_type": ["user", "client"],
                    "user": {
                        "username": "alice",
                        "email": "alice@example.com",
                        "password": "hunter2",
                    },
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "body: {json}");
        assert!(json["client_tokens"]["access_token"].is_string());
        assert!(json["user_tokens"]["refresh_token"].is_string());
    }

    #[tokio::test]
    async fn escalation_is_bad_request() {
        let state = test_state();
        let code_id = register_s256(&state, "verifier-abc", &["client"]).await;

        let (status, json) = send(
            &state,
            post_json(
                "/token",
                serde_json::json!({
                    "code_id": code_id,
                    "code_verifier": "verifier-abc",
                    "exchange_type": ["client", "user"],
                    "user": {"username": "alice", "password": "pw"},
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_request");
        assert_eq!(state.registry.len(), 1);
    }

    #[tokio::test]
    async fn refresh_round_trip() {
        let gateway = Arc::new(InMemoryGateway::new());
        let state = test_state_with(gateway.clone());
        let issued = gateway.issue_client_tokens("app1").await.unwrap();

        let (status, json) = send(
            &state,
            post_json(
                "/token/refresh",
                serde_json::json!({"refresh_token": issued.refresh_token.unwrap()}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "body: {json}");
        assert!(json["access_token"].is_string());

        let (status, json) = send(
            &state,
            post_json(
                "/token/refresh",
                serde_json::json!({"refresh_token": "rt_unknown"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"], "token_generation_failed");
        assert_eq!(json["retryable"], true);
    }

    #[tokio::test]
    async fn refresh_failure_hides_provider_response() {
        let provider = Router::new().fallback(|| async {
            (
                StatusCode::UNAUTHORIZED,
                r#"{"error":"invalid_client","internal":"db-host=10.0.0.7"}"#,
            )
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, provider).await.unwrap();
        });

        let gateway = HttpIdentityGateway::new(
            reqwest::Client::new(),
            identity::HttpGatewaySettings {
                issuer_url: format!("http://{addr}/realms/main"),
                admin_url: format!("http://{addr}/admin/realms/main"),
                service_client_id: "svc".into(),
                service_client_secret: common::Secret::new("svc-secret".into()),
                client_secrets: Default::default(),
            },
        );
        let state = test_state_with(Arc::new(gateway));

        let (status, json) = send(
            &state,
            post_json(
                "/token/refresh",
                serde_json::json!({"refresh_token": "rt_any"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"], "token_generation_failed");
        let text = json.to_string();
        assert!(!text.contains("10.0.0.7"), "body: {text}");
        assert!(!text.contains("invalid_client"), "body: {text}");
        assert!(!text.contains(&addr.to_string()), "body: {text}");
    }

    #[tokio::test]
    async fn health_reports_stored_challenges() {
        let state = test_state();
        let register = |verifier: &str| {
            state
                .registry
                .register(pkce::RegistrationRequest {
                    client_id: "app1".into(),
                    code_challenge: verifier.into(),
                    code_challenge_method: ChallengeMethod::Plain,
                    requested_exchange_type: pkce::ExchangeType::CLIENT,
                })
                .unwrap()
        };
        register("plain-verifier-one");
        let in_flight = register("plain-verifier-two");
        let _claim = state.registry.claim(&in_flight).unwrap();

        let (status, json) = send(
            &state,
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        // Records mid-redemption are stored too
        assert_eq!(json["stored_challenges"], 2);
        assert!(json.get("pending_challenges").is_none());
        assert!(json["uptime_seconds"].is_number());
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_after_requests() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let mut state = test_state();
        state.prometheus = handle;
        let code_id = register_s256(&state, "verifier-abc", &["client"]).await;
        send(
            &state,
            post_json(
                "/token",
                serde_json::json!({
                    "code_id": code_id,
                    "code_verifier": "verifier-abc",
                    "exchange_type": ["client"],
                }),
            ),
        )
        .await;

        let response = build_router(state, 100)
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("pkce_registrations_total"), "metrics: {text}");
        assert!(text.contains("pkce_redemptions_total{outcome=\"ok\"} 1"));
    }

    #[test]
    fn memory_gateway_is_the_default() {
        let config: Config =
            toml::from_str("[server]\nlisten_addr = \"127.0.0.1:0\"\n").unwrap();
        let gateway = build_gateway(&config, &reqwest::Client::new()).unwrap();
        assert_eq!(gateway.id(), "memory");
    }

    #[test]
    fn secret_debug_in_bodies_is_redacted() {
        let body: api::TokenBody = serde_json::from_value(serde_json::json!({
            "code_id": "c_x",
            "code_verifier": "super-secret-verifier",
            "exchange_type": ["client"],
            "otp": "123456",
        }))
        .unwrap();
        let debug = format!("{body:?}");
        assert!(!debug.contains("super-secret-verifier"));
        assert!(!debug.contains("123456"));
    }
}
