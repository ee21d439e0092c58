//! Batch ingestion: fetch every monitored list, deduplicate, hand new posts
//! to triage.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::bot_config::TargetList;
use crate::cache::{CacheEntry, DedupCache};
use crate::events::NewItem;
use crate::post::Post;
use crate::social::PostSource;
use crate::triage::TriageStage;

/// Upper bound on rows re-delivered per invocation. Rows with fewer failed
/// attempts are picked first.
const REDELIVERY_LIMIT: u32 = 100;

/// Counters for one source that was fetched successfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub total: usize,
    pub new: usize,
    pub duplicates: usize,
    pub invalid: usize,
    /// Posts whose cache write or triage failed.
    pub failed_items: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Completed(SourceStats),
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub source: String,
    pub outcome: SourceOutcome,
}

/// Outcome of one [`IngestionRouter::run_once`], in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub sources: Vec<SourceReport>,
}

impl BatchReport {
    /// Posts emitted to triage across all sources.
    #[must_use]
    pub fn new_items(&self) -> usize {
        self.sources
            .iter()
            .map(|s| match &s.outcome {
                SourceOutcome::Completed(stats) => stats.new,
                SourceOutcome::Failed { .. } => 0,
            })
            .sum()
    }

    #[must_use]
    pub fn failed_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|s| matches!(s.outcome, SourceOutcome::Failed { .. }))
            .map(|s| s.source.as_str())
            .collect()
    }
}

struct RouterInner {
    cache: Arc<DedupCache>,
    source: Arc<dyn PostSource>,
    triage: TriageStage,
}

/// Runs sources concurrently, up to a fixed limit. Posts within one source
/// are handled sequentially in retrieval order.
#[derive(Clone)]
pub struct IngestionRouter {
    inner: Arc<RouterInner>,
    semaphore: Arc<Semaphore>,
}

impl IngestionRouter {
    #[must_use]
    pub fn new(
        cache: Arc<DedupCache>,
        source: Arc<dyn PostSource>,
        triage: TriageStage,
        concurrency: usize,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                cache,
                source,
                triage,
            }),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Process every list once and report per-source outcomes.
    ///
    /// A failing source does not stop the others.
    ///
    /// # Errors
    ///
    /// Returns an error only if the worker pool is unusable.
    pub async fn run_once(&self, lists: &[TargetList]) -> Result<BatchReport> {
        let mut handles = Vec::with_capacity(lists.len());

        for list in lists {
            let permit = self.semaphore.clone().acquire_owned().await?;
            let inner = Arc::clone(&self.inner);
            let label = list.label();
            let list = list.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                inner.process_source(&list).await
            });
            handles.push((label, handle));
        }

        let mut report = BatchReport::default();
        for (source, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(stats)) => {
                    info!(
                        source = %source,
                        new = stats.new,
                        total = stats.total,
                        duplicates = stats.duplicates,
                        invalid = stats.invalid,
                        failed = stats.failed_items,
                        "Source processed"
                    );
                    SourceOutcome::Completed(stats)
                }
                Ok(Err(e)) => {
                    error!(source = %source, "Source failed: {e:#}");
                    SourceOutcome::Failed {
                        error: format!("{e:#}"),
                    }
                }
                Err(e) => {
                    error!(source = %source, "Source task panicked: {e}");
                    SourceOutcome::Failed {
                        error: format!("task panicked: {e}"),
                    }
                }
            };
            report.sources.push(SourceReport { source, outcome });
        }

        Ok(report)
    }

    /// Re-deliver posts that were committed to the cache but whose triage
    /// never completed, e.g. because an earlier run crashed in between.
    ///
    /// Only rows older than `grace` are considered, so posts still in
    /// flight in a concurrent run are left alone. Returns how many were
    /// delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the pending rows cannot be read.
    pub async fn redeliver_pending(&self, grace: Duration) -> Result<usize> {
        let pending = self
            .inner
            .cache
            .undelivered(grace, REDELIVERY_LIMIT)
            .await
            .context("Failed to read undelivered cache entries")?;

        if pending.is_empty() {
            return Ok(0);
        }
        info!(count = pending.len(), "Re-delivering undelivered posts");

        let mut delivered = 0;
        for entry in pending {
            let CacheEntry {
                canonical_id,
                post,
                options,
                ..
            } = entry;
            if self.inner.deliver(NewItem { post, options }).await {
                delivered += 1;
            } else {
                warn!(canonical_id = %canonical_id, "Re-delivery failed, will retry next run");
            }
        }
        Ok(delivered)
    }
}

impl RouterInner {
    async fn process_source(&self, list: &TargetList) -> Result<SourceStats> {
        let statuses = self
            .source
            .fetch(list)
            .await
            .with_context(|| format!("Failed to fetch {}", list.label()))?;

        let mut stats = SourceStats {
            total: statuses.len(),
            ..SourceStats::default()
        };

        for status in statuses {
            let post = match Post::from_status(status) {
                Ok(post) => post,
                Err(e) => {
                    warn!(source = %list.label(), "Skipping invalid status: {e}");
                    stats.invalid += 1;
                    continue;
                }
            };

            match self.cache.get(&post.canonical_id).await {
                Ok(Some(_)) => {
                    debug!(canonical_id = %post.canonical_id, "Already seen");
                    stats.duplicates += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(canonical_id = %post.canonical_id, "Cache lookup failed: {e}");
                    stats.failed_items += 1;
                    continue;
                }
            }

            let item = NewItem {
                post,
                options: list.options,
            };
            match self
                .cache
                .put(CacheEntry::new(item.post.clone(), item.options))
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    // Claimed by a sibling source or another process in the meantime.
                    stats.duplicates += 1;
                    continue;
                }
                Err(e) => {
                    error!(canonical_id = %item.post.canonical_id, "Cache write failed: {e}");
                    stats.failed_items += 1;
                    continue;
                }
            }

            stats.new += 1;
            if !self.deliver(item).await {
                stats.failed_items += 1;
            }
        }

        Ok(stats)
    }

    /// Triage a committed post and mark it delivered. Returns whether triage
    /// succeeded.
    async fn deliver(&self, item: NewItem) -> bool {
        let canonical_id = item.post.canonical_id.clone();
        if let Err(e) = self.triage.handle(&item).await {
            error!(canonical_id = %canonical_id, "Triage failed: {e:#}");
            if let Err(e) = self.cache.record_failed_delivery(&canonical_id).await {
                warn!(canonical_id = %canonical_id, "Failed to record delivery attempt: {e}");
            }
            return false;
        }
        if let Err(e) = self.cache.mark_notified(&canonical_id).await {
            // Worst case the post is triaged again next run.
            warn!(canonical_id = %canonical_id, "Failed to mark post delivered: {e}");
        }
        true
    }
}

impl std::fmt::Debug for IngestionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionRouter")
            .field("available_permits", &self.semaphore.available_permits())
            .finish_non_exhaustive()
    }
}
