use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cache::DEFAULT_TTL;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse bot configuration: {0}")]
    BotConfig(#[from] toml::de::Error),
    #[error("invalid URL pattern in bot configuration: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Process settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Dedup cache
    pub database_path: PathBuf,
    pub cache_ttl: Duration,
    pub redelivery_grace: Duration,

    // Router
    pub worker_concurrency: usize,

    // Bot configuration source
    pub bot_config_path: PathBuf,
    pub config_bucket: Option<String>,
    pub config_key: String,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,

    // Collaborators
    pub social_api_url: String,
    pub reshare_endpoint: String,
    pub post_endpoint: String,
    pub image_similarity_url: Option<String>,
    pub page_text_url: Option<String>,
    pub http_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Dedup cache
            database_path: PathBuf::from(env_or_default("DATABASE_PATH", "./data/cache.sqlite")),
            cache_ttl: Duration::from_secs(parse_env_u64("CACHE_TTL_SECS", DEFAULT_TTL.as_secs())?),
            redelivery_grace: Duration::from_secs(parse_env_u64("REDELIVERY_GRACE_SECS", 300)?),

            // Router
            worker_concurrency: parse_env_usize("WORKER_CONCURRENCY", 4)?,

            // Bot configuration source
            bot_config_path: PathBuf::from(env_or_default("BOT_CONFIG_PATH", "./config.toml")),
            config_bucket: optional_env("CONFIG_BUCKET"),
            config_key: env_or_default("CONFIG_KEY", "config.toml"),
            s3_region: env_or_default("S3_REGION", "us-east-1"),
            s3_endpoint: optional_env("S3_ENDPOINT"),

            // Collaborators
            social_api_url: required_env("SOCIAL_API_URL")?,
            reshare_endpoint: required_env("RESHARE_ENDPOINT")?,
            post_endpoint: required_env("POST_ENDPOINT")?,
            image_similarity_url: optional_env("IMAGE_SIMILARITY_URL"),
            page_text_url: optional_env("PAGE_TEXT_URL"),
            http_timeout: Duration::from_secs(parse_env_u64("HTTP_TIMEOUT_SECS", 30)?),
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "WORKER_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.cache_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "CACHE_TTL_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        validate_url("SOCIAL_API_URL", &self.social_api_url)?;
        validate_url("RESHARE_ENDPOINT", &self.reshare_endpoint)?;
        validate_url("POST_ENDPOINT", &self.post_endpoint)?;
        if let Some(url) = &self.image_similarity_url {
            validate_url("IMAGE_SIMILARITY_URL", url)?;
        }
        if let Some(url) = &self.page_text_url {
            validate_url("PAGE_TEXT_URL", url)?;
        }
        if self.config_bucket.is_some() && self.config_key.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "CONFIG_KEY".to_string(),
                message: "cannot be empty when CONFIG_BUCKET is set".to_string(),
            });
        }
        Ok(())
    }

    /// Configuration pointing at local placeholders, for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            database_path: PathBuf::from("./data/test-cache.sqlite"),
            cache_ttl: DEFAULT_TTL,
            redelivery_grace: Duration::ZERO,
            worker_concurrency: 4,
            bot_config_path: PathBuf::from("./config.toml"),
            config_bucket: None,
            config_key: "config.toml".to_string(),
            s3_region: "us-east-1".to_string(),
            s3_endpoint: None,
            social_api_url: "http://127.0.0.1:9/api".to_string(),
            reshare_endpoint: "http://127.0.0.1:9/reshare".to_string(),
            post_endpoint: "http://127.0.0.1:9/post".to_string(),
            image_similarity_url: None,
            page_text_url: None,
            http_timeout: Duration::from_secs(5),
        }
    }
}

fn validate_url(name: &str, value: &str) -> Result<(), ConfigError> {
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        Ok(parsed) => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("unsupported scheme '{}'", parsed.scheme()),
        }),
        Err(e) => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: e.to_string(),
        }),
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}
