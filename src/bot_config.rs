//! TOML bot configuration: monitored lists, keywords and detector settings.
//!
//! Unlike [`crate::config::Config`], which comes from the environment, this
//! file is owned by the bot operator and may live in object storage.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::keywords::{KeywordDetector, KeywordRules};
use crate::page_text::{SelectorRule, SelectorRules};
use crate::post::HandlingOptions;
use crate::s3::S3Client;

/// Posts fetched per list when `count` is not configured.
pub const DEFAULT_LIST_COUNT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub log_level: String,
    /// Minimum similarity (percent) for the image check to fire.
    pub detect_face_similarity_threshold: f64,
    pub detect_face_source_image_url: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            detect_face_similarity_threshold: 99.0,
            detect_face_source_image_url: None,
        }
    }
}

/// Status templates posted after a secondary check fires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageTemplates {
    pub image_detection_message_template: Option<String>,
    pub url_detection_message_template: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectUrlConfig {
    /// Ordered `pattern -> CSS selector` rules.
    pub selectors: Vec<SelectorRule>,
    pub ignored_urls: Vec<String>,
}

/// A monitored list and how its posts are handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetList {
    pub slug: String,
    pub owner_screen_name: String,
    pub count: u32,
    pub options: HandlingOptions,
}

impl TargetList {
    #[must_use]
    pub fn new(owner_screen_name: &str, slug: &str, options: HandlingOptions) -> Self {
        Self {
            slug: slug.to_string(),
            owner_screen_name: owner_screen_name.to_string(),
            count: DEFAULT_LIST_COUNT,
            options,
        }
    }

    /// `owner/slug`, used as the source name in logs and reports.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}", self.owner_screen_name, self.slug)
    }
}

/// A `[[target_lists]]` entry as written. It is kept untyped so a bad entry
/// can be skipped rather than failing the whole file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawTargetList(pub toml::Table);

impl RawTargetList {
    fn text(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(toml::Value::as_str).map(str::to_string)
    }

    /// Check the entry and turn it into a [`TargetList`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the offending key.
    pub fn resolve(&self) -> Result<TargetList, ConfigError> {
        let invalid = |name: &str, message: String| ConfigError::InvalidValue {
            name: name.to_string(),
            message,
        };

        let slug = self
            .text("slug")
            .ok_or_else(|| invalid("slug", "missing".to_string()))?;
        let owner_screen_name = self
            .text("owner_screen_name")
            .ok_or_else(|| invalid("owner_screen_name", "missing".to_string()))?;
        let count = match self.0.get("count") {
            None => DEFAULT_LIST_COUNT,
            Some(value) => value
                .as_integer()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    invalid("count", format!("expected a non-negative integer, got {value}"))
                })?,
        };
        let options: HandlingOptions = toml::Value::Table(self.0.clone())
            .try_into()
            .map_err(|e: toml::de::Error| invalid("options", e.message().to_string()))?;

        Ok(TargetList {
            slug,
            owner_screen_name,
            count,
            options,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub global_config: GlobalConfig,
    pub detect_related_post: MessageTemplates,
    pub target_lists: Vec<RawTargetList>,
    pub keyword_config: KeywordRules,
    pub detect_url: DetectUrlConfig,
}

impl BotConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML or has wrongly
    /// typed values.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Load from object storage when `CONFIG_BUCKET` is set, otherwise from
    /// `BOT_CONFIG_PATH`.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be fetched or parsed.
    pub async fn load(config: &Config) -> Result<Self> {
        let raw = if let Some(bucket) = &config.config_bucket {
            let client = S3Client::new(config, bucket)?;
            let bytes = client
                .get_object(&config.config_key)
                .await?
                .with_context(|| {
                    format!("Bot configuration s3://{bucket}/{} not found", config.config_key)
                })?;
            info!(bucket = %bucket, key = %config.config_key, "Loaded bot configuration from S3");
            String::from_utf8(bytes).context("Bot configuration is not valid UTF-8")?
        } else {
            let raw = tokio::fs::read_to_string(&config.bot_config_path)
                .await
                .with_context(|| {
                    format!(
                        "Failed to read bot configuration: {}",
                        config.bot_config_path.display()
                    )
                })?;
            info!(path = %config.bot_config_path.display(), "Loaded bot configuration");
            raw
        };

        Self::from_toml_str(&raw).context("Invalid bot configuration")
    }

    /// The usable monitored lists, in configuration order.
    #[must_use]
    pub fn target_lists(&self) -> Vec<TargetList> {
        self.target_lists
            .iter()
            .enumerate()
            .filter_map(|(index, raw)| match raw.resolve() {
                Ok(list) => Some(list),
                Err(e) => {
                    warn!(index, "Skipping target list: {e}");
                    None
                }
            })
            .collect()
    }

    #[must_use]
    pub fn keyword_detector(&self) -> KeywordDetector {
        KeywordDetector::new(self.keyword_config.clone())
    }

    /// Compile the `[detect_url]` rules.
    ///
    /// # Errors
    ///
    /// Returns an error if any pattern is not a valid regex.
    pub fn selector_rules(&self) -> Result<SelectorRules, ConfigError> {
        Ok(SelectorRules::new(
            &self.detect_url.selectors,
            &self.detect_url.ignored_urls,
        )?)
    }
}
