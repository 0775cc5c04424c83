//! Configuration module for the realtime relay
//!
//! This module handles server configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use realtime_relay::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

mod env;
mod merge;
mod validation;
mod yaml;

use crate::core::rate_limit::{DEFAULT_SWEEP_INTERVAL, RateLimitPolicy};
use crate::core::upstream::{
    DEFAULT_REALTIME_MODEL, DEFAULT_REALTIME_VOICE, DEFAULT_UPSTREAM_TIMEOUT, OPENAI_API_BASE_URL,
};

pub use yaml::YamlConfig;

/// TLS configuration for HTTPS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// Server configuration
///
/// Contains all configuration needed to run the relay, including:
/// - Server settings (host, port, TLS)
/// - Upstream provider key, base URL and defaults
/// - Per-endpoint fixed-window rate limits
/// - Security settings (CORS, global burst protection)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    // Upstream provider
    /// Long-lived provider key. Never leaves the server.
    pub openai_api_key: Option<String>,
    /// Provider REST base URL
    pub openai_base_url: String,
    /// Model used when a credential request does not name one
    pub default_model: String,
    /// Voice used when a credential request does not name one
    pub default_voice: String,
    /// Timeout applied to every upstream call
    pub upstream_timeout_seconds: u64,

    // Security configuration
    /// CORS allowed origins (comma-separated list or "*" for all)
    /// Default: None (CORS disabled, same-origin only)
    pub cors_allowed_origins: Option<String>,

    /// Maximum requests per second per IP address across all routes
    /// Default: 60
    pub rate_limit_requests_per_second: u32,
    /// Maximum burst size for the global limiter
    /// Default: 10
    pub rate_limit_burst_size: u32,
    /// Key per-endpoint limits on `X-Forwarded-For` / `X-Real-IP` instead of
    /// the socket peer. Only enable behind a proxy that overwrites them.
    /// Default: false
    pub trust_forwarded_headers: bool,

    // Per-endpoint fixed windows
    /// `POST /realtime/session`
    pub session_rate_limit: RateLimitPolicy,
    /// `POST /realtime/sessions`
    pub sessions_rate_limit: RateLimitPolicy,
    /// `POST /realtime/ws`
    pub negotiate_rate_limit: RateLimitPolicy,
    /// How often expired limiter entries are purged
    pub rate_limit_sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            tls: None,
            openai_api_key: None,
            openai_base_url: OPENAI_API_BASE_URL.to_string(),
            default_model: DEFAULT_REALTIME_MODEL.to_string(),
            default_voice: DEFAULT_REALTIME_VOICE.to_string(),
            upstream_timeout_seconds: DEFAULT_UPSTREAM_TIMEOUT.as_secs(),
            cors_allowed_origins: None,
            rate_limit_requests_per_second: 60,
            rate_limit_burst_size: 10,
            trust_forwarded_headers: false,
            session_rate_limit: RateLimitPolicy::per_five_minutes(30),
            sessions_rate_limit: RateLimitPolicy::per_five_minutes(30),
            negotiate_rate_limit: RateLimitPolicy::per_five_minutes(60),
            rate_limit_sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Zeroize the provider key when the configuration is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.openai_api_key {
            key.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables only
    ///
    /// Missing variables fall back to defaults. The provider key is optional at
    /// boot; requests that need it fail with a configuration error instead.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = merge::merge_config(None)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        // .env is loaded in main.rs, so it is already part of the process env here
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Provider key, if configured and non-empty
    pub fn api_key(&self) -> Option<&str> {
        self.openai_api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_seconds)
    }
}
