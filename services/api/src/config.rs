//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    /// Base URL of the compute pool's HTTP submission surface.
    pub worker_base_url: String,
    /// Base URL of the blob storage service that issues signed URLs.
    pub storage_base_url: String,
    pub storage_service_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub tts_voice: String,
    /// Cadence of the client job-status poll loop.
    pub poll_interval: Duration,
    /// Quiet period before a playback-position update is persisted.
    pub position_debounce: Duration,
    /// Lifetime of issued artifact access URLs, in seconds.
    pub signed_url_ttl_secs: u64,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Load Server and Database Settings ---
        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Load External Service Settings ---
        let worker_base_url = std::env::var("WORKER_BASE_URL")
            .map_err(|_| ConfigError::MissingVar("WORKER_BASE_URL".to_string()))?;

        let storage_base_url = std::env::var("STORAGE_BASE_URL")
            .map_err(|_| ConfigError::MissingVar("STORAGE_BASE_URL".to_string()))?;
        let storage_service_key = std::env::var("STORAGE_SERVICE_KEY").ok();

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let tts_voice = std::env::var("TTS_VOICE").unwrap_or_else(|_| "alloy".to_string());

        // --- Load Tuning Knobs ---
        let poll_interval = Duration::from_secs(parse_var_or("POLL_INTERVAL_SECS", 3)?);
        let position_debounce = Duration::from_millis(parse_var_or("POSITION_DEBOUNCE_MS", 500)?);
        let signed_url_ttl_secs = parse_var_or("SIGNED_URL_TTL_SECS", 3600)?;

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            worker_base_url,
            storage_base_url,
            storage_service_key,
            openai_api_key,
            tts_voice,
            poll_interval,
            position_debounce,
            signed_url_ttl_secs,
        })
    }
}

fn parse_var_or(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
