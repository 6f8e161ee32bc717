//! Configuration management for Bindery.
//!
//! Settings are read from an optional `config.yaml` and overridden by
//! `BINDERY_`-prefixed environment variables (`__` separates nested keys,
//! e.g. `BINDERY_TELEMETRY__LEVEL=debug`).

use std::time::Duration;

use serde::Deserialize;

/// Application configuration settings.
#[derive(Clone, Deserialize)]
pub struct Settings {
    /// Port number the server will listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// HMAC secret used to sign and verify download tokens.
    /// Never logged.
    pub signing_secret: String,
    /// Lifetime of an issued download token, in minutes.
    #[serde(default = "default_token_ttl_minutes")]
    pub token_ttl_minutes: u64,
    /// Reject a second redemption of the same token within its lifetime.
    #[serde(default)]
    pub single_use_tokens: bool,
    /// Hosted identity provider that issues session tokens.
    pub identity: IdentityConfig,
    /// Hosted data store holding products, subscriptions and the audit table.
    pub datastore: DatastoreConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Where session tokens come from and how strictly they are checked.
#[derive(Clone, Deserialize)]
pub struct IdentityConfig {
    /// JWKS endpoint of the identity provider.
    pub jwks_url: String,
    /// Whether to validate the session token signature against the JWKS.
    /// If false, the token is decoded without signature verification.
    #[serde(default = "default_true")]
    pub validate_token: bool,
    /// Expected `aud` of session tokens, if the provider sets one.
    #[serde(default)]
    pub audience: Option<String>,
}

/// PostgREST-style REST endpoint of the hosted database.
#[derive(Clone, Deserialize)]
pub struct DatastoreConfig {
    /// Base URL, without the `/rest/v1` suffix.
    pub url: String,
    /// Service key sent as both `apikey` and bearer token.
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFormat {
    Json,
    Pretty,
}

/// Logging and trace export settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub level: LogLevel,
    /// Level applied to the `axum` target.
    pub axum_level: LogLevel,
    pub format: LoggingFormat,
    /// Export spans over OTLP (gRPC). Endpoint comes from the standard
    /// `OTEL_EXPORTER_OTLP_*` variables.
    pub otlp_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "bindery".to_string(),
            level: LogLevel::Info,
            axum_level: LogLevel::Info,
            format: LoggingFormat::Json,
            otlp_enabled: false,
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_token_ttl_minutes() -> u64 {
    15
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

/// Longest accepted download token lifetime: one day.
pub const MAX_TOKEN_TTL_MINUTES: u64 = 24 * 60;

impl Settings {
    /// Lifetime applied to every issued download token, capped at
    /// [`MAX_TOKEN_TTL_MINUTES`].
    pub fn token_ttl(&self) -> Duration {
        let minutes = self.token_ttl_minutes.min(MAX_TOKEN_TTL_MINUTES);
        Duration::from_secs(minutes * 60)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.signing_secret.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "signing_secret must not be empty".to_string(),
            ));
        }
        if self.token_ttl_minutes == 0 {
            return Err(config::ConfigError::Message(
                "token_ttl_minutes must be at least 1".to_string(),
            ));
        }
        if self.token_ttl_minutes > MAX_TOKEN_TTL_MINUTES {
            return Err(config::ConfigError::Message(format!(
                "token_ttl_minutes must be at most {MAX_TOKEN_TTL_MINUTES}"
            )));
        }
        Ok(())
    }
}

/// Loads configuration from `config.yaml` (if present) and the environment.
#[tracing::instrument]
pub fn load_config() -> Result<Settings, config::ConfigError> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(
            config::Environment::with_prefix("BINDERY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .inspect_err(|e| tracing::error!("Failed to build configuration: {}", e))?;

    let settings = cfg
        .try_deserialize::<Settings>()
        .inspect_err(|e| tracing::error!("Failed to deserialize configuration: {}", e))?;

    settings.validate()?;
    Ok(settings)
}
