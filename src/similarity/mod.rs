//! Face-similarity collaborator used by the image check.
//!
//! The comparison itself runs elsewhere. The reference image URL is fixed when
//! the client is built and is never refreshed for the life of the process.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Scores how closely an image matches the configured reference face.
#[async_trait]
pub trait ImageSimilarity: Send + Sync {
    /// Similarity in percent (0-100). Zero when no face matched.
    async fn similarity(&self, image_url: &str) -> Result<f64>;
}

#[derive(Debug, Serialize)]
struct CompareRequest<'a> {
    source_image_url: &'a str,
    target_image_url: &'a str,
    similarity_threshold: f64,
}

#[derive(Debug, Deserialize)]
struct CompareResponse {
    #[serde(default)]
    similarity: Option<f64>,
}

/// [`ImageSimilarity`] backed by an HTTP comparison service.
#[derive(Clone)]
pub struct HttpImageSimilarity {
    http: reqwest::Client,
    endpoint: String,
    reference_url: String,
    threshold: f64,
}

impl HttpImageSimilarity {
    #[must_use]
    pub fn new(http: reqwest::Client, endpoint: &str, reference_url: &str, threshold: f64) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
            reference_url: reference_url.to_string(),
            threshold,
        }
    }

    #[must_use]
    pub fn reference_url(&self) -> &str {
        &self.reference_url
    }
}

#[async_trait]
impl ImageSimilarity for HttpImageSimilarity {
    async fn similarity(&self, image_url: &str) -> Result<f64> {
        let request = CompareRequest {
            source_image_url: &self.reference_url,
            target_image_url: image_url,
            similarity_threshold: self.threshold,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .context("Failed to call image similarity service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            anyhow::bail!("Image similarity request failed: {} - {}", status, body);
        }

        let parsed: CompareResponse = response
            .json()
            .await
            .context("Failed to parse image similarity response")?;
        let similarity = parsed.similarity.unwrap_or(0.0);
        debug!(image_url, similarity, "Image similarity");
        Ok(similarity)
    }
}
