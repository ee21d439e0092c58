//! Linked-page text extraction used by the URL check.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Selector used when no configured pattern matches.
pub const DEFAULT_SELECTOR: &str = "body";

/// One `pattern -> selector` pair from the bot configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRule {
    pub pattern: String,
    pub selector: String,
}

/// Picks the CSS selector whose text should be scanned for a given URL.
///
/// Patterns are anchored at the start of the URL and tried in order.
#[derive(Debug, Clone, Default)]
pub struct SelectorRules {
    selectors: Vec<(Regex, String)>,
    ignored: Vec<Regex>,
}

impl SelectorRules {
    /// Compile the configured rules.
    ///
    /// # Errors
    ///
    /// Returns the first pattern that is not a valid regex.
    pub fn new(selectors: &[SelectorRule], ignored_urls: &[String]) -> Result<Self, regex::Error> {
        let selectors = selectors
            .iter()
            .map(|rule| Ok((anchored(&rule.pattern)?, rule.selector.clone())))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        let ignored = ignored_urls
            .iter()
            .map(|p| anchored(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { selectors, ignored })
    }

    /// `None` for ignored URLs, otherwise the first matching selector or
    /// [`DEFAULT_SELECTOR`].
    #[must_use]
    pub fn selector_for(&self, url: &str) -> Option<&str> {
        if self.ignored.iter().any(|re| re.is_match(url)) {
            return None;
        }
        Some(
            self.selectors
                .iter()
                .find(|(re, _)| re.is_match(url))
                .map_or(DEFAULT_SELECTOR, |(_, selector)| selector.as_str()),
        )
    }
}

fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})"))
}

/// Renders a page and returns the text of the first element matching a
/// CSS selector.
#[async_trait]
pub trait PageText: Send + Sync {
    /// `None` when the element never appeared (e.g. the render timed out).
    async fn selected_text(&self, url: &str, selector: &str) -> Result<Option<String>>;
}

#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    url: &'a str,
    selector: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    text: Option<String>,
}

/// [`PageText`] backed by an HTTP rendering service.
#[derive(Clone)]
pub struct HttpPageText {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpPageText {
    #[must_use]
    pub fn new(http: reqwest::Client, endpoint: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl PageText for HttpPageText {
    async fn selected_text(&self, url: &str, selector: &str) -> Result<Option<String>> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&ExtractRequest { url, selector })
            .send()
            .await
            .context("Failed to call page text service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            anyhow::bail!("Page text request failed: {} - {}", status, body);
        }

        let parsed: ExtractResponse = response
            .json()
            .await
            .context("Failed to parse page text response")?;
        debug!(url, selector, found = parsed.text.is_some(), "Page text extracted");
        Ok(parsed.text)
    }
}
