//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub actor: ActorConfig,
    pub store: StoreConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// The single actor served by this instance
#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    /// Bare handle; the only identifier that resolves
    #[serde(default = "default_actor_identifier")]
    pub identifier: String,
    #[serde(default = "default_actor_display_name")]
    pub display_name: String,
    #[serde(default)]
    pub summary: String,
}

fn default_actor_identifier() -> String {
    "me".to_string()
}

fn default_actor_display_name() -> String {
    "Me".to_string()
}

/// Key-value store backend selector
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Key-value store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// SQLite file, used when `backend = "sqlite"`
    pub path: Option<PathBuf>,
}

/// Federation behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Upper bound for every outbound request (key fetch, actor fetch, delivery)
    pub request_timeout_seconds: u64,
    /// RSA modulus size for generated actor keys
    pub key_bits: usize,
    /// TTL for cached peer public keys
    pub key_cache_ttl_seconds: u64,
    /// Allow fetching from and delivering to loopback/private addresses.
    ///
    /// Only meant for local development and tests.
    #[serde(default)]
    pub allow_private_addresses: bool,
    /// Concurrency limit for fan-out deliveries
    pub max_concurrent_deliveries: usize,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_seconds)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 10,
            key_bits: MIN_KEY_BITS,
            key_cache_ttl_seconds: 3600,
            allow_private_addresses: false,
            max_concurrent_deliveries: 10,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

const MIN_KEY_BITS: usize = 2048;

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (SOLOFED__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost:8080")?
            .set_default("server.protocol", "http")?
            .set_default("actor.identifier", "me")?
            .set_default("actor.display_name", "Me")?
            .set_default("actor.summary", "")?
            .set_default("store.backend", "memory")?
            .set_default("federation.request_timeout_seconds", 10)?
            .set_default("federation.key_bits", MIN_KEY_BITS as i64)?
            .set_default("federation.key_cache_ttl_seconds", 3600)?
            .set_default("federation.allow_private_addresses", false)?
            .set_default("federation.max_concurrent_deliveries", 10)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("SOLOFED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.actor.identifier.trim().is_empty() {
            return Err(AppError::Config(
                "actor.identifier must not be empty".to_string(),
            ));
        }

        if self.federation.key_bits < MIN_KEY_BITS {
            return Err(AppError::Config(format!(
                "federation.key_bits must be at least {}",
                MIN_KEY_BITS
            )));
        }

        if self.federation.request_timeout_seconds == 0 {
            return Err(AppError::Config(
                "federation.request_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.store.backend == StoreBackend::Sqlite && self.store.path.is_none() {
            return Err(AppError::Config(
                "store.path is required when store.backend=sqlite".to_string(),
            ));
        }

        if is_local_server_domain(&self.server.domain) {
            if !self.server.protocol.eq_ignore_ascii_case("https") {
                tracing::warn!(
                    domain = %self.server.domain,
                    "Serving plain http for local development"
                );
            }
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
