//! Social API collaborators: list retrieval and reaction publishing.
//!
//! The bot never talks to the social network's own protocol. Retrieval goes
//! through a list-statuses endpoint returning raw status JSON, and reshare /
//! status requests are handed to webhook endpoints that own the API client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::bot_config::TargetList;
use crate::events::{PostRequest, ReshareRequest};

/// Retrieves the latest posts of a monitored list.
#[async_trait]
pub trait PostSource: Send + Sync {
    /// Raw status objects, newest first, at most `list.count` of them.
    async fn fetch(&self, list: &TargetList) -> Result<Vec<Value>>;
}

/// Publishes reaction requests for the social client to act on.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_reshare(&self, request: &ReshareRequest) -> Result<()>;
    async fn publish_post(&self, request: &PostRequest) -> Result<()>;
}

/// [`PostSource`] backed by an HTTP list-statuses endpoint.
#[derive(Clone)]
pub struct HttpPostSource {
    http: reqwest::Client,
    base_url: String,
}

impl HttpPostSource {
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PostSource for HttpPostSource {
    async fn fetch(&self, list: &TargetList) -> Result<Vec<Value>> {
        let url = format!("{}/lists/statuses", self.base_url);
        debug!(url = %url, source = %list.label(), count = list.count, "Fetching list statuses");

        let count = list.count.to_string();
        let response = self
            .http
            .get(&url)
            .query(&[
                ("owner_screen_name", list.owner_screen_name.as_str()),
                ("slug", list.slug.as_str()),
                ("count", count.as_str()),
                ("tweet_mode", "extended"),
            ])
            .send()
            .await
            .context("Failed to fetch list statuses")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            anyhow::bail!("List statuses request failed: {} - {}", status, body);
        }

        response
            .json::<Vec<Value>>()
            .await
            .context("Failed to parse list statuses response")
    }
}

/// [`EventPublisher`] that POSTs JSON to one endpoint per request kind.
#[derive(Clone)]
pub struct WebhookPublisher {
    http: reqwest::Client,
    reshare_url: String,
    post_url: String,
}

impl WebhookPublisher {
    #[must_use]
    pub fn new(http: reqwest::Client, reshare_url: &str, post_url: &str) -> Self {
        Self {
            http,
            reshare_url: reshare_url.to_string(),
            post_url: post_url.to_string(),
        }
    }

    async fn send<T: Serialize + Sync>(&self, url: &str, body: &T) -> Result<()> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to publish to {url}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            anyhow::bail!("Publish to {} failed: {} - {}", url, status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for WebhookPublisher {
    async fn publish_reshare(&self, request: &ReshareRequest) -> Result<()> {
        self.send(&self.reshare_url, request).await?;
        info!(
            canonical_id = %request.canonical_id,
            detector = request.reason.detector_name(),
            "Published reshare request"
        );
        Ok(())
    }

    async fn publish_post(&self, request: &PostRequest) -> Result<()> {
        self.send(&self.post_url, request).await?;
        info!(status = %request.status, "Published post request");
        Ok(())
    }
}
