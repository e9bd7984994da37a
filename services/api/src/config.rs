//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use study_core::extraction::ExtractionConfig;
use study_core::generation::GenerationConfig;
use study_core::ingestion::IngestionConfig;
use study_core::worker::WorkerConfig;
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
    pub openai_api_key: Option<String>,
    pub generation_model: String,
    pub ocr_model: String,
    pub blob_base_url: String,
    pub blob_bucket: String,
    pub blob_service_key: Option<String>,
    pub fulfillment_secret: Option<String>,

    // --- Ingestion ---
    pub ingest_max_files: usize,
    pub ingest_max_images: usize,
    pub ingest_text_cap: usize,
    pub ingest_processing_lease: Duration,
    pub ingest_failed_cooldown: Duration,
    pub ocr_timeout: Duration,
    pub worker_enabled: bool,
    pub worker_interval: Duration,

    // --- Generation ---
    pub generation_timeout: Duration,
    pub generation_max_prompt_chars: usize,
    pub generation_max_files: usize,
    pub generation_base_cost: i64,
    pub generation_images_per_extra_credit: usize,
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
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // --- Load Server and Database Settings ---
        let bind_address: SocketAddr = parse_or(&lookup, "BIND_ADDRESS", "0.0.0.0:3000".parse().ok())?;

        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Load Capability Settings (key is optional) ---
        let openai_api_key = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty());
        let generation_model = lookup("GENERATION_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
        let ocr_model = lookup("OCR_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());

        let blob_base_url =
            lookup("BLOB_BASE_URL").ok_or_else(|| ConfigError::MissingVar("BLOB_BASE_URL".to_string()))?;
        let blob_bucket = lookup("BLOB_BUCKET").unwrap_or_else(|| "materials".to_string());
        let blob_service_key = lookup("BLOB_SERVICE_KEY").filter(|k| !k.trim().is_empty());
        let fulfillment_secret = lookup("FULFILLMENT_SECRET").filter(|k| !k.trim().is_empty());

        // --- Load Pipeline Limits ---
        let ingest_max_files = parse_or(&lookup, "INGEST_MAX_FILES", Some(10))?;
        let ingest_max_images = parse_or(&lookup, "INGEST_MAX_IMAGES", Some(6))?;
        let ingest_text_cap = parse_or(&lookup, "INGEST_TEXT_CAP", Some(60_000))?;
        let ingest_processing_lease =
            Duration::from_secs(parse_or(&lookup, "INGEST_PROCESSING_LEASE_SECS", Some(600))?);
        let ingest_failed_cooldown =
            Duration::from_secs(parse_or(&lookup, "INGEST_FAILED_COOLDOWN_SECS", Some(60))?);
        let ocr_timeout = Duration::from_secs(parse_or(&lookup, "OCR_TIMEOUT_SECS", Some(45))?);
        let worker_enabled = parse_or(&lookup, "INGEST_WORKER_ENABLED", Some(true))?;
        let worker_interval = Duration::from_millis(parse_or(&lookup, "INGEST_WORKER_INTERVAL_MS", Some(2000))?);

        let generation_timeout = Duration::from_secs(parse_or(&lookup, "GENERATION_TIMEOUT_SECS", Some(60))?);
        let generation_max_prompt_chars = parse_or(&lookup, "GENERATION_MAX_PROMPT_CHARS", Some(4000))?;
        let generation_max_files = parse_or(&lookup, "GENERATION_MAX_FILES", Some(10))?;
        let generation_base_cost: i64 = parse_or(&lookup, "GENERATION_BASE_COST", Some(1))?;
        if generation_base_cost < 1 {
            return Err(ConfigError::InvalidValue(
                "GENERATION_BASE_COST".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let generation_images_per_extra_credit =
            parse_or(&lookup, "GENERATION_IMAGES_PER_EXTRA_CREDIT", Some(3))?;

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            openai_api_key,
            generation_model,
            ocr_model,
            blob_base_url,
            blob_bucket,
            blob_service_key,
            fulfillment_secret,
            ingest_max_files,
            ingest_max_images,
            ingest_text_cap,
            ingest_processing_lease,
            ingest_failed_cooldown,
            ocr_timeout,
            worker_enabled,
            worker_interval,
            generation_timeout,
            generation_max_prompt_chars,
            generation_max_files,
            generation_base_cost,
            generation_images_per_extra_credit,
        })
    }

    pub fn ingestion(&self) -> IngestionConfig {
        IngestionConfig::default()
            .with_limits(self.ingest_max_files, self.ingest_max_images)
            .with_text_cap(self.ingest_text_cap)
            .with_processing_lease(self.ingest_processing_lease)
            .with_failed_cooldown(self.ingest_failed_cooldown)
    }

    pub fn extraction(&self) -> ExtractionConfig {
        ExtractionConfig::default().with_ocr_timeout(self.ocr_timeout)
    }

    pub fn generation(&self) -> GenerationConfig {
        GenerationConfig::default()
            .with_timeout(self.generation_timeout)
            .with_limits(self.generation_max_prompt_chars, self.generation_max_files)
            .with_pricing(self.generation_base_cost, self.generation_images_per_extra_credit)
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_enabled(self.worker_enabled)
            .with_interval(self.worker_interval)
    }
}

/// Parses `key` if set, otherwise falls back to `default`.
fn parse_or<T, F>(lookup: &F, key: &str, default: Option<T>) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        None => default.ok_or_else(|| ConfigError::MissingVar(key.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("DATABASE_URL", "postgres://localhost/study"),
        ("BLOB_BASE_URL", "http://localhost:54321/storage/v1"),
    ];

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let config = Config::from_lookup(lookup(&REQUIRED)).unwrap();

        assert_eq!(config.bind_address.port(), 3000);
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.openai_api_key, None);
        assert_eq!(config.ingest_max_files, 10);
        assert_eq!(config.ingest_max_images, 6);
        assert_eq!(config.ingest_processing_lease, Duration::from_secs(600));
        assert_eq!(config.generation_base_cost, 1);
        assert!(config.worker_enabled);
        assert_eq!(config.generation().cost_for(3), 2);
    }

    #[test]
    fn missing_database_url_is_reported() {
        let err = Config::from_lookup(lookup(&[("BLOB_BASE_URL", "http://x")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(var) if var == "DATABASE_URL"));
    }

    #[test]
    fn invalid_numbers_name_the_variable() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("INGEST_MAX_FILES", "lots"));
        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(var, _) if var == "INGEST_MAX_FILES"));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("GENERATION_BASE_COST", "0"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn blank_key_counts_as_unset() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("OPENAI_API_KEY", "  "));
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.openai_api_key, None);
    }
}
