//! Two-tier deduplication cache keyed by canonical post id.
//!
//! The in-process tier is a plain map scoped to the process lifetime. The
//! durable tier is the cross-process authority and expires entries after a
//! TTL. [`DedupCache::put`] returning `true` is the single signal that a post
//! is being seen for the first time.

mod key_lock;
mod sqlite;

pub use key_lock::{KeyGuard, KeyedLocks};
pub use sqlite::SqliteStore;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::post::{HandlingOptions, Post};

/// Default lifetime of a durable entry (14 days).
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 14);

#[derive(Debug, Error)]
pub enum CacheError {
    /// The durable namespace does not exist (e.g. the table was never created).
    #[error("durable cache table does not exist")]
    NotFound,
    #[error("durable cache operation failed: {0}")]
    Durable(#[source] sqlx::Error),
    #[error("failed to (de)serialize cache payload: {0}")]
    Codec(#[from] serde_json::Error),
}

/// One deduplicated post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub canonical_id: String,
    pub post: Post,
    /// Options of the source the post was first collected from.
    pub options: HandlingOptions,
    /// Absolute expiry in epoch seconds. Stamped by [`DedupCache::put`].
    pub expires_at: i64,
}

impl CacheEntry {
    #[must_use]
    pub fn new(post: Post, options: HandlingOptions) -> Self {
        Self {
            canonical_id: post.canonical_id.clone(),
            post,
            options,
            expires_at: 0,
        }
    }
}

/// Durable tier with a conditional write.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn fetch(&self, canonical_id: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Insert only if the key is absent. Returns whether a row was created.
    async fn insert_if_absent(&self, entry: &CacheEntry) -> Result<bool, CacheError>;

    /// Record that the new-item notification for this key was delivered.
    async fn mark_notified(&self, canonical_id: &str) -> Result<(), CacheError>;

    /// Count one failed delivery attempt for an unmarked key.
    async fn record_failed_delivery(&self, canonical_id: &str) -> Result<(), CacheError>;

    /// Entries committed at or before `committed_before` whose notification
    /// was never marked delivered. Fewest failed attempts first, then oldest.
    async fn undelivered(
        &self,
        committed_before: i64,
        limit: u32,
    ) -> Result<Vec<CacheEntry>, CacheError>;

    /// Delete entries that expired at or before `now`. Returns the count.
    async fn reap_expired(&self, now: i64) -> Result<u64, CacheError>;
}

#[derive(Debug, Default)]
struct MemoryTier {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryTier {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(key).cloned()
    }

    async fn insert(&self, entry: CacheEntry) {
        self.entries
            .write()
            .await
            .entry(entry.canonical_id.clone())
            .or_insert(entry);
    }
}

/// The two-tier cache.
pub struct DedupCache {
    memory: MemoryTier,
    durable: Arc<dyn DurableStore>,
    locks: KeyedLocks,
    ttl: Duration,
}

impl DedupCache {
    #[must_use]
    pub fn new(durable: Arc<dyn DurableStore>, ttl: Duration) -> Self {
        Self {
            memory: MemoryTier::default(),
            durable,
            locks: KeyedLocks::new(),
            ttl,
        }
    }

    /// Look up an entry, in-process tier first.
    ///
    /// A durable hit is copied into the in-process tier. A missing durable
    /// table reads as absent.
    ///
    /// # Errors
    ///
    /// Returns any other durable-tier fault unchanged.
    pub async fn get(&self, canonical_id: &str) -> Result<Option<CacheEntry>, CacheError> {
        if let Some(entry) = self.memory.get(canonical_id).await {
            debug!(canonical_id, local_cache = true, remote_cache = false, "Cache get");
            return Ok(Some(entry));
        }

        match self.durable.fetch(canonical_id).await {
            Ok(Some(entry)) => {
                debug!(canonical_id, local_cache = false, remote_cache = true, "Cache get");
                self.memory.insert(entry.clone()).await;
                Ok(Some(entry))
            }
            Ok(None) | Err(CacheError::NotFound) => {
                debug!(canonical_id, local_cache = false, remote_cache = false, "Cache get");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Insert with the cache's configured TTL.
    ///
    /// # Errors
    ///
    /// See [`DedupCache::put_with_ttl`].
    pub async fn put(&self, entry: CacheEntry) -> Result<bool, CacheError> {
        self.put_with_ttl(entry, self.ttl).await
    }

    /// Insert if absent. Returns `true` only when a new entry was created.
    ///
    /// Concurrent calls for the same key are serialised, so exactly one of
    /// them can return `true`. Existing entries are never overwritten.
    ///
    /// # Errors
    ///
    /// Returns durable-tier faults unchanged. A failed put leaves neither
    /// tier modified.
    pub async fn put_with_ttl(
        &self,
        mut entry: CacheEntry,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let _guard = self.locks.lock(&entry.canonical_id).await;

        if self.get(&entry.canonical_id).await?.is_some() {
            debug!(canonical_id = %entry.canonical_id, "Cache put skipped, entry exists");
            return Ok(false);
        }

        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        entry.expires_at = Utc::now().timestamp().saturating_add(ttl_secs);

        if !self.durable.insert_if_absent(&entry).await? {
            // Another process committed the key between our read and write.
            debug!(canonical_id = %entry.canonical_id, "Durable insert lost the race");
            if let Some(winner) = self.durable.fetch(&entry.canonical_id).await? {
                self.memory.insert(winner).await;
            }
            return Ok(false);
        }

        debug!(canonical_id = %entry.canonical_id, expires_at = entry.expires_at, "Cache put");
        self.memory.insert(entry).await;
        Ok(true)
    }

    /// Record that the new-item notification for `canonical_id` was delivered.
    ///
    /// # Errors
    ///
    /// Returns durable-tier faults.
    pub async fn mark_notified(&self, canonical_id: &str) -> Result<(), CacheError> {
        self.durable.mark_notified(canonical_id).await
    }

    /// Count a failed delivery so the entry yields to others in
    /// [`DedupCache::undelivered`].
    ///
    /// # Errors
    ///
    /// Returns durable-tier faults.
    pub async fn record_failed_delivery(&self, canonical_id: &str) -> Result<(), CacheError> {
        self.durable.record_failed_delivery(canonical_id).await
    }

    /// Committed entries whose notification was never confirmed and that are
    /// older than `grace`. Entries that failed fewer times come first, so
    /// posts that always fail cannot crowd out the rest.
    ///
    /// # Errors
    ///
    /// Returns durable-tier faults; a missing table yields no entries.
    pub async fn undelivered(
        &self,
        grace: Duration,
        limit: u32,
    ) -> Result<Vec<CacheEntry>, CacheError> {
        let grace_secs = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp().saturating_sub(grace_secs);
        match self.durable.undelivered(cutoff, limit).await {
            Err(CacheError::NotFound) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Remove expired entries from the durable tier.
    ///
    /// # Errors
    ///
    /// Returns durable-tier faults; a missing table reaps nothing.
    pub async fn reap_expired(&self) -> Result<u64, CacheError> {
        match self.durable.reap_expired(Utc::now().timestamp()).await {
            Err(CacheError::NotFound) => Ok(0),
            other => other,
        }
    }
}

impl std::fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
