//! Configuration loading for the ingestion workers.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `INGEST_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest page HubSpot's search endpoint accepts.
pub const HUBSPOT_MAX_PAGE_LIMIT: u64 = 200;

/// Application configuration derived from `INGEST_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hubspot_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hubspot_client_secret: Option<String>,
    #[serde(default = "default_hubspot_api_base")]
    pub hubspot_api_base: String,
    #[serde(default = "default_hubspot_oauth_base")]
    pub hubspot_oauth_base: String,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub retry: RetryPolicyConfig,
    #[serde(default)]
    pub token_refresh: TokenRefreshConfig,
}

/// Vendor search pagination limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SearchConfig {
    /// Highest cumulative offset the search endpoint serves (default: 10000)
    ///
    /// Environment variable: `INGEST_SEARCH_MAX_OFFSET`
    #[serde(default = "default_search_max_offset")]
    pub max_offset: u64,

    /// Rows requested per page (default: 100)
    ///
    /// Environment variable: `INGEST_SEARCH_PAGE_LIMIT`
    #[serde(default = "default_search_page_limit")]
    pub page_limit: u64,
}

impl SearchConfig {
    /// Validate search pagination bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_limit == 0 || self.page_limit > HUBSPOT_MAX_PAGE_LIMIT {
            return Err(ConfigError::InvalidSearchPageLimit {
                value: self.page_limit,
            });
        }

        if self.max_offset <= self.page_limit {
            return Err(ConfigError::InvalidSearchMaxOffset {
                max_offset: self.max_offset,
                page_limit: self.page_limit,
            });
        }

        Ok(())
    }
}

/// Backoff policy applied by the retry decorator around vendor calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RetryPolicyConfig {
    /// Base retry interval in milliseconds (default: 500)
    ///
    /// Subsequent retries use exponential backoff: base_millis * 2^attempt.
    ///
    /// Environment variable: `INGEST_RETRY_BASE_MILLIS`
    #[serde(default = "default_retry_base_millis")]
    pub base_millis: u64,

    /// Maximum retry interval in milliseconds (default: 30000)
    ///
    /// Environment variable: `INGEST_RETRY_MAX_MILLIS`
    #[serde(default = "default_retry_max_millis")]
    pub max_millis: u64,

    /// Jitter factor (default: 0.1, range: 0.0-1.0)
    ///
    /// Formula: backoff * (1 ± jitter_factor)
    ///
    /// Environment variable: `INGEST_RETRY_JITTER_FACTOR`
    #[serde(default = "default_retry_jitter_factor")]
    pub jitter_factor: f64,

    /// Total attempts including the first call (default: 5)
    ///
    /// Environment variable: `INGEST_RETRY_MAX_ATTEMPTS`
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
}

impl RetryPolicyConfig {
    /// Validate retry policy bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_millis > self.max_millis {
            return Err(ConfigError::InvalidRetryBounds {
                base: self.base_millis,
                max: self.max_millis,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidRetryJitter {
                value: self.jitter_factor,
            });
        }

        if self.max_attempts == 0 || self.max_attempts > 20 {
            return Err(ConfigError::InvalidRetryAttempts {
                value: self.max_attempts,
            });
        }

        Ok(())
    }
}

/// Token refresh coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TokenRefreshConfig {
    /// Refresh proactively when the token expires within this many seconds (default: 300)
    ///
    /// Environment variable: `INGEST_TOKEN_REFRESH_SAFETY_MARGIN_SECONDS`
    #[serde(default = "default_token_refresh_safety_margin_seconds")]
    pub safety_margin_seconds: u64,

    /// Give up waiting for another worker's refresh after this many milliseconds.
    /// Unset means wait until the holder commits, rolls back or dies.
    ///
    /// Environment variable: `INGEST_TOKEN_REFRESH_LOCK_WAIT_TIMEOUT_MS`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_wait_timeout_ms: Option<u64>,
}

impl TokenRefreshConfig {
    /// Validate token refresh configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.safety_margin_seconds == 0 || self.safety_margin_seconds > 3600 {
            return Err(ConfigError::InvalidTokenRefreshSafetyMargin {
                value: self.safety_margin_seconds,
            });
        }

        if self.lock_wait_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidTokenRefreshLockWait);
        }

        Ok(())
    }

    pub fn safety_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.safety_margin_seconds as i64)
    }

    pub fn lock_wait_timeout(&self) -> Option<Duration> {
        self.lock_wait_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            crypto_key: None,
            hubspot_client_id: None,
            hubspot_client_secret: None,
            hubspot_api_base: default_hubspot_api_base(),
            hubspot_oauth_base: default_hubspot_oauth_base(),
            search: SearchConfig::default(),
            retry: RetryPolicyConfig::default(),
            token_refresh: TokenRefreshConfig::default(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_offset: default_search_max_offset(),
            page_limit: default_search_page_limit(),
        }
    }
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            base_millis: default_retry_base_millis(),
            max_millis: default_retry_max_millis(),
            jitter_factor: default_retry_jitter_factor(),
            max_attempts: default_retry_max_attempts(),
        }
    }
}

impl Default for TokenRefreshConfig {
    fn default() -> Self {
        Self {
            safety_margin_seconds: default_token_refresh_safety_margin_seconds(),
            lock_wait_timeout_ms: None,
        }
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.crypto_key.is_some() {
            config.crypto_key = Some(b"[REDACTED]".to_vec());
        }
        if config.hubspot_client_id.is_some() {
            config.hubspot_client_id = Some("[REDACTED]".to_string());
        }
        if config.hubspot_client_secret.is_some() {
            config.hubspot_client_secret = Some("[REDACTED]".to_string());
        }
        if let Some(at) = config.database_url.find('@') {
            // keep scheme and host, drop credentials
            let scheme_end = config.database_url.find("://").map(|i| i + 3).unwrap_or(0);
            if scheme_end < at {
                config
                    .database_url
                    .replace_range(scheme_end..at, "[REDACTED]");
            }
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref key) = self.crypto_key {
            if key.len() != 32 {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
        } else {
            return Err(ConfigError::MissingCryptoKey);
        }

        // HubSpot app credentials are only optional for local and test profiles
        if !matches!(self.profile.as_str(), "local" | "test") {
            if self.hubspot_client_id.is_none() {
                return Err(ConfigError::MissingHubSpotClientId);
            }
            if self.hubspot_client_secret.is_none() {
                return Err(ConfigError::MissingHubSpotClientSecret);
            }
        }

        for (name, value) in [
            ("HUBSPOT_API_BASE", &self.hubspot_api_base),
            ("HUBSPOT_OAUTH_BASE", &self.hubspot_oauth_base),
        ] {
            url::Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
                name: name.to_string(),
                value: value.clone(),
                source,
            })?;
        }

        self.search.validate()?;
        self.retry.validate()?;
        self.token_refresh.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://ingestion.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_hubspot_api_base() -> String {
    "https://api.hubapi.com".to_string()
}

fn default_hubspot_oauth_base() -> String {
    "https://api.hubapi.com".to_string()
}

fn default_search_max_offset() -> u64 {
    10_000 // HubSpot search offset ceiling
}

fn default_search_page_limit() -> u64 {
    100
}

fn default_retry_base_millis() -> u64 {
    500
}

fn default_retry_max_millis() -> u64 {
    30_000 // 30 seconds
}

fn default_retry_jitter_factor() -> f64 {
    0.1 // 10% jitter
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_token_refresh_safety_margin_seconds() -> u64 {
    300 // 5 minutes
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("crypto key is missing; set INGEST_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("HubSpot client ID is missing; set INGEST_HUBSPOT_CLIENT_ID environment variable")]
    MissingHubSpotClientId,
    #[error(
        "HubSpot client secret is missing; set INGEST_HUBSPOT_CLIENT_SECRET environment variable"
    )]
    MissingHubSpotClientSecret,
    #[error("invalid {name} '{value}': {source}")]
    InvalidUrl {
        name: String,
        value: String,
        source: url::ParseError,
    },
    #[error("invalid value '{value}' for {name}")]
    InvalidNumber { name: String, value: String },
    #[error("search page limit must be between 1 and 200, got {value}")]
    InvalidSearchPageLimit { value: u64 },
    #[error("search max offset ({max_offset}) must exceed the page limit ({page_limit})")]
    InvalidSearchMaxOffset { max_offset: u64, page_limit: u64 },
    #[error("retry base millis ({base}) cannot be greater than max millis ({max})")]
    InvalidRetryBounds { base: u64, max: u64 },
    #[error("retry jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidRetryJitter { value: f64 },
    #[error("retry max attempts must be between 1 and 20, got {value}")]
    InvalidRetryAttempts { value: u32 },
    #[error("token refresh safety margin must be between 1 and 3600 seconds, got {value}")]
    InvalidTokenRefreshSafetyMargin { value: u64 },
    #[error("token refresh lock wait timeout must be positive when set")]
    InvalidTokenRefreshLockWait,
}

/// Loads configuration using layered `.env` files and `INGEST_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.{profile}`, `.env.{profile}.local`,
    /// then the process environment, and validates the result.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("INGEST_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take_parsed(&mut layered, "DB_MAX_CONNECTIONS")?
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")?
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let crypto_key = match layered.remove("CRYPTO_KEY") {
            Some(key_str) if !key_str.trim().is_empty() => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(key_str.trim()).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            _ => None,
        };

        let hubspot_client_id = take_string(&mut layered, "HUBSPOT_CLIENT_ID");
        let hubspot_client_secret = take_string(&mut layered, "HUBSPOT_CLIENT_SECRET");
        let hubspot_api_base =
            take_string(&mut layered, "HUBSPOT_API_BASE").unwrap_or_else(default_hubspot_api_base);
        let hubspot_oauth_base = take_string(&mut layered, "HUBSPOT_OAUTH_BASE")
            .unwrap_or_else(default_hubspot_oauth_base);

        let search = SearchConfig {
            max_offset: take_parsed(&mut layered, "SEARCH_MAX_OFFSET")?
                .unwrap_or_else(default_search_max_offset),
            page_limit: take_parsed(&mut layered, "SEARCH_PAGE_LIMIT")?
                .unwrap_or_else(default_search_page_limit),
        };

        let retry = RetryPolicyConfig {
            base_millis: take_parsed(&mut layered, "RETRY_BASE_MILLIS")?
                .unwrap_or_else(default_retry_base_millis),
            max_millis: take_parsed(&mut layered, "RETRY_MAX_MILLIS")?
                .unwrap_or_else(default_retry_max_millis),
            jitter_factor: take_parsed(&mut layered, "RETRY_JITTER_FACTOR")?
                .unwrap_or_else(default_retry_jitter_factor),
            max_attempts: take_parsed(&mut layered, "RETRY_MAX_ATTEMPTS")?
                .unwrap_or_else(default_retry_max_attempts),
        };

        let token_refresh = TokenRefreshConfig {
            safety_margin_seconds: take_parsed(
                &mut layered,
                "TOKEN_REFRESH_SAFETY_MARGIN_SECONDS",
            )?
            .unwrap_or_else(default_token_refresh_safety_margin_seconds),
            lock_wait_timeout_ms: take_parsed(&mut layered, "TOKEN_REFRESH_LOCK_WAIT_TIMEOUT_MS")?,
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            crypto_key,
            hubspot_client_id,
            hubspot_client_secret,
            hubspot_api_base,
            hubspot_oauth_base,
            search,
            retry,
            token_refresh,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("INGEST_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix("INGEST_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, name: &str) -> Option<String> {
    layered
        .remove(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn take_parsed<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match take_string(layered, name) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber {
                name: format!("INGEST_{name}"),
                value,
            }),
    }
}
