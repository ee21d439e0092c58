//! Side effects taken once a post has been triaged.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::bot_config::MessageTemplates;
use crate::events::{PostRequest, ReshareReason, ReshareRequest};
use crate::keywords::KeywordDetector;
use crate::page_text::{PageText, SelectorRules};
use crate::post::Post;
use crate::social::EventPublisher;
use crate::similarity::ImageSimilarity;

/// What the triage stage can do with a post.
///
/// Errors returned from these methods mean the reaction could not be
/// delivered and the item should be retried later. The checks run after the
/// keyword reshare, so they must not fail once they have published anything.
#[async_trait]
pub trait Reactions: Send + Sync {
    async fn reshare(&self, post: &Post, matched_keyword: Option<&str>) -> Result<()>;
    async fn post_message(&self, status: &str) -> Result<()>;
    /// Reshare the post if one of its images matches the reference face.
    async fn check_image(&self, post: &Post) -> Result<()>;
    /// Reshare the post if one of its linked pages mentions a keyword.
    async fn check_url(&self, post: &Post) -> Result<()>;
}

/// [`Reactions`] that publishes requests and consults the image and page
/// collaborators.
pub struct Reactor {
    publisher: Arc<dyn EventPublisher>,
    keywords: KeywordDetector,
    images: Option<Arc<dyn ImageSimilarity>>,
    reference_image_url: Option<String>,
    similarity_threshold: f64,
    pages: Option<Arc<dyn PageText>>,
    selectors: SelectorRules,
    templates: MessageTemplates,
}

impl Reactor {
    #[must_use]
    pub fn new(publisher: Arc<dyn EventPublisher>, keywords: KeywordDetector) -> Self {
        Self {
            publisher,
            keywords,
            images: None,
            reference_image_url: None,
            similarity_threshold: 99.0,
            pages: None,
            selectors: SelectorRules::default(),
            templates: MessageTemplates::default(),
        }
    }

    /// Enable the image check. Without a reference URL the check only warns.
    #[must_use]
    pub fn with_image_check(
        mut self,
        images: Arc<dyn ImageSimilarity>,
        reference_image_url: Option<String>,
        similarity_threshold: f64,
    ) -> Self {
        self.images = Some(images);
        self.reference_image_url = reference_image_url;
        self.similarity_threshold = similarity_threshold;
        self
    }

    #[must_use]
    pub fn with_url_check(mut self, pages: Arc<dyn PageText>, selectors: SelectorRules) -> Self {
        self.pages = Some(pages);
        self.selectors = selectors;
        self
    }

    #[must_use]
    pub fn with_templates(mut self, templates: MessageTemplates) -> Self {
        self.templates = templates;
        self
    }

    /// Post the rendered template, if one is configured. Render and publish
    /// failures are logged; the reshare that preceded the post still counts.
    async fn post_templated(&self, template: Option<&str>, vars: &[(&str, String)]) {
        let Some(template) = template else {
            return;
        };
        let status = match crate::template::render(template, vars) {
            Ok(status) => status,
            Err(e) => {
                error!(template, "Failed to render message template: {e}");
                return;
            }
        };
        if let Err(e) = self.post_message(&status).await {
            error!(status = %status, "Failed to publish detection message: {e:#}");
        }
    }
}

#[async_trait]
impl Reactions for Reactor {
    async fn reshare(&self, post: &Post, matched_keyword: Option<&str>) -> Result<()> {
        let request = ReshareRequest {
            canonical_id: post.canonical_id.clone(),
            reason: ReshareReason::Keyword {
                matched_keyword: matched_keyword.map(str::to_string),
            },
        };
        self.publisher.publish_reshare(&request).await
    }

    async fn post_message(&self, status: &str) -> Result<()> {
        self.publisher
            .publish_post(&PostRequest {
                status: status.to_string(),
            })
            .await
    }

    async fn check_image(&self, post: &Post) -> Result<()> {
        let Some(reference) = &self.reference_image_url else {
            warn!(status_id = %post.id, "Image check skipped, no reference image configured");
            return Ok(());
        };
        let Some(images) = &self.images else {
            warn!(status_id = %post.id, "Image check skipped, no similarity service configured");
            return Ok(());
        };

        for image_url in &post.media_urls {
            let similarity = match images.similarity(image_url).await {
                Ok(similarity) => similarity,
                Err(e) => {
                    error!(status_id = %post.id, image_url = %image_url, "Image similarity failed: {e:#}");
                    continue;
                }
            };
            debug!(
                status_id = %post.id,
                image_url = %image_url,
                reference = %reference,
                similarity,
                "Image compared"
            );
            if similarity < self.similarity_threshold {
                continue;
            }

            info!(canonical_id = %post.canonical_id, image_url = %image_url, similarity, "Related image detected");
            let request = ReshareRequest {
                canonical_id: post.canonical_id.clone(),
                reason: ReshareReason::Image {
                    image_url: image_url.clone(),
                    similarity,
                },
            };
            if let Err(e) = self.publisher.publish_reshare(&request).await {
                error!(canonical_id = %post.canonical_id, image_url = %image_url, "Image reshare failed: {e:#}");
                continue;
            }
            let vars = [
                ("status_id", post.id.clone()),
                ("image_url", image_url.clone()),
                ("similarity", format!("{similarity:.2}")),
                ("status_url", post.status_url()),
            ];
            self.post_templated(
                self.templates.image_detection_message_template.as_deref(),
                &vars,
            )
            .await;
            return Ok(());
        }
        Ok(())
    }

    async fn check_url(&self, post: &Post) -> Result<()> {
        let Some(pages) = &self.pages else {
            warn!(status_id = %post.id, "URL check skipped, no page text service configured");
            return Ok(());
        };

        for url in &post.link_urls {
            let Some(selector) = self.selectors.selector_for(url) else {
                debug!(status_id = %post.id, url = %url, "Ignored URL");
                continue;
            };
            let text = match pages.selected_text(url, selector).await {
                Ok(Some(text)) => text,
                Ok(None) => {
                    debug!(status_id = %post.id, url = %url, selector, "Selector not found on page");
                    continue;
                }
                Err(e) => {
                    error!(status_id = %post.id, url = %url, "Page text extraction failed: {e:#}");
                    continue;
                }
            };
            let Some(detected_text) = self.keywords.find(&text, "") else {
                debug!(status_id = %post.id, url = %url, selector, "No keyword on linked page");
                continue;
            };

            info!(canonical_id = %post.canonical_id, url = %url, detected_text, "Related URL detected");
            let request = ReshareRequest {
                canonical_id: post.canonical_id.clone(),
                reason: ReshareReason::Url {
                    url: url.clone(),
                    detected_text: detected_text.to_string(),
                },
            };
            if let Err(e) = self.publisher.publish_reshare(&request).await {
                error!(canonical_id = %post.canonical_id, url = %url, "URL reshare failed: {e:#}");
                continue;
            }
            let vars = [
                ("status_id", post.id.clone()),
                ("url", url.clone()),
                ("detected_text", detected_text.to_string()),
                ("selector", selector.to_string()),
                ("status_url", post.status_url()),
            ];
            self.post_templated(
                self.templates.url_detection_message_template.as_deref(),
                &vars,
            )
            .await;
            return Ok(());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("reference_image_url", &self.reference_image_url)
            .field("similarity_threshold", &self.similarity_threshold)
            .finish_non_exhaustive()
    }
}
