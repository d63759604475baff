//! Cart client configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Optional
//! - `CART_API_BASE_URL` - Base URL of the cart service (default: `http://localhost:8080/api/v1/ecommerce`)
//! - `CART_API_TOKEN` - Bearer credential for the cart service
//! - `CART_REQUEST_TIMEOUT_SECS` - Per-request transport timeout (default: 10)
//! - `CART_RELOAD_AFTER_COMMIT` - Load the authoritative cart after each commit (default: true)
//! - `CART_EVENT_CAPACITY` - Buffered cart events per subscriber (default: 64)
//! - `SENTRY_DSN` - Sentry error tracking DSN

use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "http://localhost:8080/api/v1/ecommerce";
const DEFAULT_TIMEOUT_SECS: &str = "10";
const DEFAULT_EVENT_CAPACITY: &str = "64";

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Cart client configuration.
#[derive(Debug, Clone)]
pub struct StorefrontConfig {
    /// Cart service connection settings
    pub cart_api: CartApiConfig,
    /// Coordinator behavior
    pub sync: SyncConfig,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
}

/// Cart service connection settings.
///
/// Implements `Debug` manually to redact the token.
#[derive(Clone)]
pub struct CartApiConfig {
    /// Base URL; `/cart` and `/cart/item/{id}` are resolved against it
    pub base_url: Url,
    /// Bearer token, if one was provisioned out of band
    pub token: Option<SecretString>,
    /// Transport timeout for a single request
    pub request_timeout: Duration,
}

impl std::fmt::Debug for CartApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartApiConfig")
            .field("base_url", &self.base_url.as_str())
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Mutation coordinator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Replace the cache with the authoritative cart after a commit
    pub reload_after_commit: bool,
    /// Capacity of the cart event broadcast channel
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reload_after_commit: true,
            event_capacity: 64,
        }
    }
}

impl StorefrontConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            cart_api: CartApiConfig::from_env()?,
            sync: SyncConfig::from_env()?,
            sentry_dsn: get_optional_env("SENTRY_DSN"),
        })
    }
}

impl CartApiConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let base_url = parse_base_url(&get_env_or_default("CART_API_BASE_URL", DEFAULT_BASE_URL))?;
        let token = get_optional_env("CART_API_TOKEN")
            .filter(|value| !value.trim().is_empty())
            .map(SecretString::from);
        let timeout_secs = get_env_or_default("CART_REQUEST_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)
            .parse::<u64>()
            .map_err(|e| {
                ConfigError::InvalidEnvVar("CART_REQUEST_TIMEOUT_SECS".to_string(), e.to_string())
            })?;

        Ok(Self {
            base_url,
            token,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Settings for a service at `base_url` with no token and the default timeout.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnvVar` if `base_url` is not an absolute
    /// http(s) URL.
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: parse_base_url(base_url)?,
            token: None,
            request_timeout: Duration::from_secs(10),
        })
    }
}

impl SyncConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let reload_after_commit = parse_bool(
            "CART_RELOAD_AFTER_COMMIT",
            &get_env_or_default("CART_RELOAD_AFTER_COMMIT", "true"),
        )?;
        let event_capacity = get_env_or_default("CART_EVENT_CAPACITY", DEFAULT_EVENT_CAPACITY)
            .parse::<usize>()
            .ok()
            .filter(|capacity| *capacity > 0)
            .ok_or_else(|| {
                ConfigError::InvalidEnvVar(
                    "CART_EVENT_CAPACITY".to_string(),
                    "must be a positive integer".to_string(),
                )
            })?;

        Ok(Self {
            reload_after_commit,
            event_capacity,
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get an optional environment variable.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Get an environment variable with a default value.
fn get_env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse the cart service base URL. Only absolute http(s) URLs are accepted.
fn parse_base_url(value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|e| {
        ConfigError::InvalidEnvVar("CART_API_BASE_URL".to_string(), e.to_string())
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(ConfigError::InvalidEnvVar(
            "CART_API_BASE_URL".to_string(),
            format!("unsupported URL: {value}"),
        ));
    }
    Ok(url)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidEnvVar(
            key.to_string(),
            format!("expected a boolean, got '{other}'"),
        )),
    }
}
