//! Process-wide wiring, built once per invocation.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::bot_config::BotConfig;
use crate::cache::{DedupCache, SqliteStore};
use crate::config::Config;
use crate::detector::RelatedPostDetector;
use crate::page_text::HttpPageText;
use crate::reactions::Reactor;
use crate::router::{BatchReport, IngestionRouter};
use crate::similarity::HttpImageSimilarity;
use crate::social::{HttpPostSource, PostSource, WebhookPublisher};
use crate::triage::TriageStage;

/// Everything a batch run needs, shared by reference.
pub struct AppContext {
    pub config: Config,
    pub bot: BotConfig,
    pub cache: Arc<DedupCache>,
    pub source: Arc<dyn PostSource>,
    http: reqwest::Client,
}

impl AppContext {
    /// Open the cache database and build the HTTP collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the HTTP client
    /// cannot be built.
    pub async fn new(config: Config, bot: BotConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
        let store = SqliteStore::open(&config.database_path)
            .await
            .context("Failed to initialize dedup cache")?;
        let cache = Arc::new(DedupCache::new(Arc::new(store), config.cache_ttl));

        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let source: Arc<dyn PostSource> =
            Arc::new(HttpPostSource::new(http.clone(), &config.social_api_url));

        Ok(Self::with_parts(config, bot, cache, source, http))
    }

    /// Assemble a context from pre-built parts.
    #[must_use]
    pub fn with_parts(
        config: Config,
        bot: BotConfig,
        cache: Arc<DedupCache>,
        source: Arc<dyn PostSource>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            bot,
            cache,
            source,
            http,
        }
    }

    /// Reactions wired to the configured webhooks and optional services.
    ///
    /// # Errors
    ///
    /// Returns an error if a `[detect_url]` pattern is not a valid regex.
    pub fn reactor(&self) -> Result<Reactor> {
        let publisher = Arc::new(WebhookPublisher::new(
            self.http.clone(),
            &self.config.reshare_endpoint,
            &self.config.post_endpoint,
        ));
        let global = &self.bot.global_config;
        let mut reactor = Reactor::new(publisher, self.bot.keyword_detector())
            .with_templates(self.bot.detect_related_post.clone());

        if let Some(endpoint) = &self.config.image_similarity_url {
            // The reference image is fixed for the life of the process.
            let reference = global.detect_face_source_image_url.clone();
            let images = HttpImageSimilarity::new(
                self.http.clone(),
                endpoint,
                reference.as_deref().unwrap_or_default(),
                global.detect_face_similarity_threshold,
            );
            reactor = reactor.with_image_check(
                Arc::new(images),
                reference,
                global.detect_face_similarity_threshold,
            );
        }

        if let Some(endpoint) = &self.config.page_text_url {
            let selectors = self
                .bot
                .selector_rules()
                .context("Invalid [detect_url] configuration")?;
            reactor = reactor
                .with_url_check(Arc::new(HttpPageText::new(self.http.clone(), endpoint)), selectors);
        }

        Ok(reactor)
    }

    /// Router over the configured source, cache and triage stage.
    ///
    /// # Errors
    ///
    /// See [`AppContext::reactor`].
    pub fn router(&self) -> Result<IngestionRouter> {
        let triage = TriageStage::new(
            RelatedPostDetector::new(self.bot.keyword_detector()),
            Arc::new(self.reactor()?),
        );
        info!(
            concurrency = self.config.worker_concurrency,
            image_check = self.config.image_similarity_url.is_some(),
            url_check = self.config.page_text_url.is_some(),
            "Router ready"
        );
        Ok(IngestionRouter::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.source),
            triage,
            self.config.worker_concurrency,
        ))
    }

    /// One full invocation: re-deliver leftovers from earlier runs, reap
    /// expired cache rows, then process every configured list.
    ///
    /// # Errors
    ///
    /// Returns an error if the router cannot be built or the pending rows
    /// cannot be read. Per-source failures are reported, not returned.
    pub async fn run_batch(&self) -> Result<BatchReport> {
        let router = self.router()?;

        let redelivered = router
            .redeliver_pending(self.config.redelivery_grace)
            .await?;
        if redelivered > 0 {
            info!(count = redelivered, "Re-delivered pending posts");
        }

        match self.cache.reap_expired().await {
            Ok(0) => {}
            Ok(count) => info!(count, "Reaped expired cache entries"),
            Err(e) => warn!("Failed to reap expired cache entries: {e}"),
        }

        let lists = self.bot.target_lists();
        info!(sources = lists.len(), "Starting batch");
        router.run_once(&lists).await
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
