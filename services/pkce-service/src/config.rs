//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Identity provider secrets are loaded from IDP_CLIENT_SECRET or
//! `client_secret_file`, and per-client secrets from `secret_file`. They are
//! never stored in the TOML directly.

use common::Secret;
use exchange::ExchangeSettings;
use identity::HttpGatewaySettings;
use pkce::{ChallengeMethod, EvictionPolicy, RegistrySettings};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub otp: Option<OtpConfig>,
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Challenge registry settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub ttl_secs: u64,
    pub max_pending: usize,
    pub eviction: EvictionPolicy,
    pub enabled_methods: Vec<ChallengeMethod>,
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_pending: 100_000,
            eviction: EvictionPolicy::Reject,
            enabled_methods: vec![ChallengeMethod::S256],
            sweep_interval_secs: 30,
        }
    }
}

/// Redemption settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub gateway_timeout_secs: u64,
    pub otp_required: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            gateway_timeout_secs: 10,
            otp_required: false,
        }
    }
}

/// External OTP verifier
#[derive(Debug, Deserialize)]
pub struct OtpConfig {
    pub verify_url: String,
}

/// Which identity gateway backs token issuance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMode {
    /// Process-local users and tokens (development only)
    #[default]
    Memory,
    /// OpenID Connect provider
    Http,
}

/// Identity provider settings
#[derive(Debug, Default, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub mode: IdentityMode,
    #[serde(default)]
    pub issuer_url: Option<String>,
    #[serde(default)]
    pub admin_url: Option<String>,
    #[serde(default)]
    pub service_client_id: Option<String>,
    /// Path to a file holding the service account secret (alternative to IDP_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Clients allowed to obtain client tokens
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

/// A registered application
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    pub client_id: String,
    /// Required in `http` mode
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
    #[serde(skip)]
    pub secret: Option<Secret<String>>,
}

fn default_max_connections() -> usize {
    1000
}

fn require_http_url(name: &str, url: &str) -> common::Result<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(common::Error::Config(format!(
            "{name} must start with http:// or https://, got: {url}"
        )));
    }
    Ok(())
}

fn read_secret_file(field: &'static str, path: &Path) -> common::Result<Option<Secret<String>>> {
    let value = std::fs::read_to_string(path).map_err(|source| common::Error::SecretFile {
        field,
        path: path.to_path_buf(),
        source,
    })?;
    let value = value.trim().to_owned();
    Ok((!value.is_empty()).then(|| Secret::new(value)))
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Service account secret resolution order:
    /// 1. IDP_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        let registry = &config.registry;
        if registry.ttl_secs == 0 {
            return Err(common::Error::Config(
                "ttl_secs must be greater than 0".into(),
            ));
        }
        if registry.max_pending == 0 {
            return Err(common::Error::Config(
                "max_pending must be greater than 0".into(),
            ));
        }
        if registry.sweep_interval_secs == 0 {
            return Err(common::Error::Config(
                "sweep_interval_secs must be greater than 0".into(),
            ));
        }
        if registry.enabled_methods.is_empty() {
            return Err(common::Error::Config(
                "enabled_methods must name at least one challenge method".into(),
            ));
        }

        if config.exchange.gateway_timeout_secs == 0 {
            return Err(common::Error::Config(
                "gateway_timeout_secs must be greater than 0".into(),
            ));
        }

        match &config.otp {
            Some(otp) => require_http_url("otp.verify_url", &otp.verify_url)?,
            None if config.exchange.otp_required => {
                return Err(common::Error::Config(
                    "otp_required is set but no [otp] verifier is configured".into(),
                ));
            }
            None => {}
        }

        config.identity.resolve_secrets()?;
        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("pkce-service.toml")
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            ttl: Duration::from_secs(self.registry.ttl_secs),
            max_pending: self.registry.max_pending,
            eviction: self.registry.eviction,
            enabled_methods: self.registry.enabled_methods.clone(),
        }
    }

    pub fn exchange_settings(&self) -> ExchangeSettings {
        ExchangeSettings {
            gateway_timeout: Duration::from_secs(self.exchange.gateway_timeout_secs),
            otp_required: self.exchange.otp_required,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.registry.sweep_interval_secs)
    }
}

impl IdentityConfig {
    /// Load secrets and check the settings the selected mode needs.
    fn resolve_secrets(&mut self) -> common::Result<()> {
        if let Ok(secret) = std::env::var("IDP_CLIENT_SECRET") {
            self.client_secret = Some(Secret::new(secret));
        } else if let Some(ref path) = self.client_secret_file {
            self.client_secret = read_secret_file("client_secret_file", path)?;
        }

        for client in &mut self.clients {
            if client.client_id.is_empty() {
                return Err(common::Error::Config(
                    "identity.clients entries need a client_id".into(),
                ));
            }
            if let Some(ref path) = client.secret_file {
                client.secret = read_secret_file("secret_file", path)?;
            }
        }

        if self.mode == IdentityMode::Http {
            let issuer_url = self.issuer_url.as_deref().ok_or_else(|| {
                common::Error::Config("identity.issuer_url is required in http mode".into())
            })?;
            require_http_url("identity.issuer_url", issuer_url)?;
            let admin_url = self.admin_url.as_deref().ok_or_else(|| {
                common::Error::Config("identity.admin_url is required in http mode".into())
            })?;
            require_http_url("identity.admin_url", admin_url)?;
            if self.service_client_id.as_deref().is_none_or(str::is_empty) {
                return Err(common::Error::Config(
                    "identity.service_client_id is required in http mode".into(),
                ));
            }
            if self.client_secret.is_none() {
                return Err(common::Error::Config(
                    "http identity mode needs IDP_CLIENT_SECRET or client_secret_file".into(),
                ));
            }
            if let Some(client) = self.clients.iter().find(|c| c.secret.is_none()) {
                return Err(common::Error::Config(format!(
                    "client {} has no secret_file",
                    client.client_id
                )));
            }
        }
        Ok(())
    }

    /// Client ids listed under `[[identity.clients]]`.
    pub fn client_ids(&self) -> impl Iterator<Item = &str> {
        self.clients.iter().map(|c| c.client_id.as_str())
    }

    /// Settings for the HTTP gateway. Only meaningful after a successful
    /// `Config::load` in `http` mode.
    pub fn http_settings(&self) -> common::Result<HttpGatewaySettings> {
        let missing = |field: &str| common::Error::Config(format!("identity.{field} is not set"));
        Ok(HttpGatewaySettings {
            issuer_url: self.issuer_url.clone().ok_or_else(|| missing("issuer_url"))?,
            admin_url: self.admin_url.clone().ok_or_else(|| missing("admin_url"))?,
            service_client_id: self
                .service_client_id
                .clone()
                .ok_or_else(|| missing("service_client_id"))?,
            service_client_secret: self
                .client_secret
                .clone()
                .ok_or_else(|| missing("client_secret"))?,
            client_secrets: self
                .clients
                .iter()
                .filter_map(|c| c.secret.clone().map(|s| (c.client_id.clone(), s)))
                .collect::<HashMap<_, _>>(),
        })
    }
}
