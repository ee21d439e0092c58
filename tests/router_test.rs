//! Integration tests for batch ingestion over a real SQLite cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use curation_bot::bot_config::{MessageTemplates, TargetList};
use curation_bot::cache::{DedupCache, SqliteStore, DEFAULT_TTL};
use curation_bot::detector::RelatedPostDetector;
use curation_bot::events::{PostRequest, ReshareReason, ReshareRequest};
use curation_bot::keywords::{KeywordDetector, KeywordRules};
use curation_bot::page_text::{PageText, SelectorRules};
use curation_bot::post::{EvaluationMode, HandlingOptions, Post};
use curation_bot::reactions::{Reactions, Reactor};
use curation_bot::router::{IngestionRouter, SourceOutcome, SourceStats};
use curation_bot::similarity::ImageSimilarity;
use curation_bot::social::{EventPublisher, PostSource};
use curation_bot::triage::TriageStage;
use serde_json::{json, Value};
use tempfile::TempDir;

/// Serves canned statuses per list label; labels mapped to `None` fail.
struct FakeSource {
    lists: HashMap<String, Option<Vec<Value>>>,
}

#[async_trait]
impl PostSource for FakeSource {
    async fn fetch(&self, list: &TargetList) -> Result<Vec<Value>> {
        match self.lists.get(&list.label()) {
            Some(Some(statuses)) => Ok(statuses.clone()),
            Some(None) => anyhow::bail!("list statuses request failed: 503"),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Default)]
struct RecordingReactions {
    reshares: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingReactions {
    fn reshared(&self) -> Vec<String> {
        self.reshares.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reactions for RecordingReactions {
    async fn reshare(&self, post: &Post, _matched_keyword: Option<&str>) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("reshare endpoint unavailable");
        }
        self.reshares.lock().unwrap().push(post.canonical_id.clone());
        Ok(())
    }

    async fn post_message(&self, _status: &str) -> Result<()> {
        Ok(())
    }

    async fn check_image(&self, _post: &Post) -> Result<()> {
        Ok(())
    }

    async fn check_url(&self, _post: &Post) -> Result<()> {
        Ok(())
    }
}

fn status(id: u64, author: &str, text: &str) -> Value {
    json!({
        "id": id,
        "full_text": text,
        "user": {"screen_name": author},
        "in_reply_to_status_id": null,
        "retweeted": false
    })
}

fn reshare_status(id: u64, author: &str, original_id: u64, original_author: &str) -> Value {
    json!({
        "id": id,
        "full_text": "RT launch",
        "user": {"screen_name": author},
        "retweeted_status": {"id": original_id, "user": {"screen_name": original_author}},
        "retweeted": false
    })
}

fn list(slug: &str, options: HandlingOptions) -> TargetList {
    TargetList::new("curator", slug, options)
}

fn always() -> HandlingOptions {
    HandlingOptions {
        always_reshare: true,
        include_reshares: true,
        ..HandlingOptions::default()
    }
}

fn keywords() -> KeywordDetector {
    KeywordDetector::new(KeywordRules {
        global_keywords: vec!["launch".to_string()],
        ..KeywordRules::default()
    })
}

struct Harness<R> {
    router: IngestionRouter,
    cache: Arc<DedupCache>,
    reactions: Arc<R>,
    _temp_dir: TempDir,
}

async fn harness_with<R: Reactions + 'static>(
    lists: Vec<(&str, Option<Vec<Value>>)>,
    reactions: Arc<R>,
) -> Harness<R> {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = SqliteStore::open(&temp_dir.path().join("cache.sqlite"))
        .await
        .expect("Failed to open cache database");
    let cache = Arc::new(DedupCache::new(Arc::new(store), DEFAULT_TTL));

    let source = FakeSource {
        lists: lists
            .into_iter()
            .map(|(slug, statuses)| (format!("curator/{slug}"), statuses))
            .collect(),
    };
    let triage = TriageStage::new(RelatedPostDetector::new(keywords()), reactions.clone());
    let router = IngestionRouter::new(Arc::clone(&cache), Arc::new(source), triage, 2);

    Harness {
        router,
        cache,
        reactions,
        _temp_dir: temp_dir,
    }
}

async fn harness(lists: Vec<(&str, Option<Vec<Value>>)>) -> Harness<RecordingReactions> {
    harness_with(lists, Arc::new(RecordingReactions::default())).await
}

#[tokio::test]
async fn test_new_posts_are_triaged_in_order_and_duplicates_skipped() {
    let h = harness(vec![(
        "news",
        Some(vec![
            status(1, "alice", "hello world"),
            status(2, "bob", "second"),
            status(1, "alice", "hello world"),
        ]),
    )])
    .await;

    let report = h.router.run_once(&[list("news", always())]).await.unwrap();

    assert_eq!(
        report.sources[0].outcome,
        SourceOutcome::Completed(SourceStats {
            total: 3,
            new: 2,
            duplicates: 1,
            invalid: 0,
            failed_items: 0,
        })
    );
    assert_eq!(h.reactions.reshared(), vec!["1", "2"]);

    // Next invocation sees nothing new.
    let report = h.router.run_once(&[list("news", always())]).await.unwrap();
    assert_eq!(report.new_items(), 0);
    assert_eq!(h.reactions.reshared().len(), 2);
}

#[tokio::test]
async fn test_only_related_posts_are_reshared() {
    let h = harness(vec![(
        "members",
        Some(vec![
            status(10, "alice", "rocket launch at noon"),
            status(11, "bob", "lunch at noon"),
        ]),
    )])
    .await;

    let report = h
        .router
        .run_once(&[list("members", HandlingOptions::default())])
        .await
        .unwrap();

    assert_eq!(report.new_items(), 2);
    assert_eq!(h.reactions.reshared(), vec!["10"]);
}

#[tokio::test]
async fn test_reshare_and_original_share_one_cache_key() {
    let h = harness(vec![
        ("a", Some(vec![reshare_status(200, "bob", 100, "alice")])),
        ("b", Some(vec![status(100, "alice", "launch")])),
    ])
    .await;

    let report = h
        .router
        .run_once(&[list("a", always()), list("b", always())])
        .await
        .unwrap();

    assert_eq!(report.new_items(), 1);
    assert_eq!(h.reactions.reshared(), vec!["100"]);
}

#[tokio::test]
async fn test_failing_source_does_not_stop_siblings() {
    let h = harness(vec![
        ("broken", None),
        ("ok", Some(vec![status(5, "carol", "hi")])),
    ])
    .await;

    let report = h
        .router
        .run_once(&[list("broken", always()), list("ok", always())])
        .await
        .unwrap();

    assert_eq!(report.failed_sources(), vec!["curator/broken"]);
    assert!(matches!(
        &report.sources[0].outcome,
        SourceOutcome::Failed { error } if error.contains("503")
    ));
    assert_eq!(report.new_items(), 1);
    assert_eq!(h.reactions.reshared(), vec!["5"]);
}

#[tokio::test]
async fn test_invalid_status_is_skipped() {
    let h = harness(vec![(
        "news",
        Some(vec![
            json!({"id": 1, "full_text": "no author"}),
            json!("not an object"),
            status(2, "bob", "fine"),
        ]),
    )])
    .await;

    let report = h.router.run_once(&[list("news", always())]).await.unwrap();

    let SourceOutcome::Completed(stats) = report.sources[0].outcome else {
        panic!("source should complete");
    };
    assert_eq!(stats.invalid, 2);
    assert_eq!(stats.new, 1);
    assert_eq!(h.reactions.reshared(), vec!["2"]);
}

#[tokio::test]
async fn test_failed_triage_is_redelivered() {
    let h = harness(vec![("news", Some(vec![status(9, "dave", "launch")]))]).await;
    h.reactions.fail.store(true, Ordering::SeqCst);

    let report = h.router.run_once(&[list("news", always())]).await.unwrap();
    let SourceOutcome::Completed(stats) = report.sources[0].outcome else {
        panic!("source should complete");
    };
    assert_eq!(stats.new, 1);
    assert_eq!(stats.failed_items, 1);
    assert!(h.reactions.reshared().is_empty());

    // The key is claimed, so a plain rerun does not retry it.
    let report = h.router.run_once(&[list("news", always())]).await.unwrap();
    assert_eq!(report.new_items(), 0);

    h.reactions.fail.store(false, Ordering::SeqCst);
    assert_eq!(h.router.redeliver_pending(Duration::ZERO).await.unwrap(), 1);
    assert_eq!(h.reactions.reshared(), vec!["9"]);

    // Delivered rows are not picked up again.
    assert_eq!(h.router.redeliver_pending(Duration::ZERO).await.unwrap(), 0);
    assert!(h
        .cache
        .undelivered(Duration::ZERO, 10)
        .await
        .unwrap()
        .is_empty());
}

/// Publisher that records what went out; selected kinds of reshare fail.
#[derive(Default)]
struct FlakyPublisher {
    reshares: Mutex<Vec<ReshareRequest>>,
    posts: Mutex<Vec<String>>,
    fail_keyword: AtomicBool,
    fail_url: AtomicBool,
}

impl FlakyPublisher {
    fn detectors(&self) -> Vec<&'static str> {
        self.reshares
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.reason.detector_name())
            .collect()
    }

    fn posts(&self) -> Vec<String> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for FlakyPublisher {
    async fn publish_reshare(&self, request: &ReshareRequest) -> Result<()> {
        let failing = match request.reason {
            ReshareReason::Keyword { .. } => self.fail_keyword.load(Ordering::SeqCst),
            ReshareReason::Url { .. } => self.fail_url.load(Ordering::SeqCst),
            ReshareReason::Image { .. } => false,
        };
        if failing {
            anyhow::bail!("reshare endpoint returned 503");
        }
        self.reshares.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn publish_post(&self, request: &PostRequest) -> Result<()> {
        self.posts.lock().unwrap().push(request.status.clone());
        Ok(())
    }
}

struct MatchingImages;

#[async_trait]
impl ImageSimilarity for MatchingImages {
    async fn similarity(&self, _image_url: &str) -> Result<f64> {
        Ok(100.0)
    }
}

struct KeywordPages;

#[async_trait]
impl PageText for KeywordPages {
    async fn selected_text(&self, _url: &str, _selector: &str) -> Result<Option<String>> {
        Ok(Some("launch coverage".to_string()))
    }
}

fn reactor(publisher: Arc<FlakyPublisher>) -> Arc<Reactor> {
    Arc::new(
        Reactor::new(publisher, keywords())
            .with_image_check(
                Arc::new(MatchingImages),
                Some("https://img.example.com/ref.jpg".to_string()),
                99.0,
            )
            .with_url_check(Arc::new(KeywordPages), SelectorRules::default())
            .with_templates(MessageTemplates {
                image_detection_message_template: Some("Face spotted: $status_url".to_string()),
                url_detection_message_template: Some("Link spotted: $url".to_string()),
            }),
    )
}

fn status_with_media_and_link(id: u64) -> Value {
    json!({
        "id": id,
        "full_text": "photo and link",
        "user": {"screen_name": "erin"},
        "extended_entities": {"media": [{"media_url_https": "https://img.example.com/a.jpg"}]},
        "entities": {"urls": [{"expanded_url": "https://news.example.com/story"}]}
    })
}

fn check_everything() -> HandlingOptions {
    HandlingOptions {
        image_evaluation: EvaluationMode::Always,
        url_evaluation: EvaluationMode::Always,
        ..always()
    }
}

#[tokio::test]
async fn test_failing_url_reshare_does_not_repeat_earlier_reactions() {
    let publisher = Arc::new(FlakyPublisher::default());
    publisher.fail_url.store(true, Ordering::SeqCst);
    let h = harness_with(
        vec![("news", Some(vec![status_with_media_and_link(40)]))],
        reactor(publisher.clone()),
    )
    .await;

    let report = h
        .router
        .run_once(&[list("news", check_everything())])
        .await
        .unwrap();
    let SourceOutcome::Completed(stats) = report.sources[0].outcome else {
        panic!("source should complete");
    };
    assert_eq!(stats.new, 1);
    assert_eq!(stats.failed_items, 0);

    // Later invocations find nothing left to deliver.
    assert_eq!(h.router.redeliver_pending(Duration::ZERO).await.unwrap(), 0);
    assert_eq!(h.router.redeliver_pending(Duration::ZERO).await.unwrap(), 0);

    assert_eq!(
        publisher.detectors(),
        vec!["detect_related_post", "detect_related_image"]
    );
    assert_eq!(
        publisher.posts(),
        vec!["Face spotted: https://twitter.com/erin/status/40"]
    );
    assert!(h
        .cache
        .undelivered(Duration::ZERO, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_failing_keyword_reshare_defers_every_reaction() {
    let publisher = Arc::new(FlakyPublisher::default());
    publisher.fail_keyword.store(true, Ordering::SeqCst);
    let h = harness_with(
        vec![("news", Some(vec![status_with_media_and_link(41)]))],
        reactor(publisher.clone()),
    )
    .await;

    let report = h
        .router
        .run_once(&[list("news", check_everything())])
        .await
        .unwrap();
    let SourceOutcome::Completed(stats) = report.sources[0].outcome else {
        panic!("source should complete");
    };
    assert_eq!(stats.failed_items, 1);
    // Nothing went out before the failure, so a retry cannot duplicate it.
    assert!(publisher.detectors().is_empty());
    assert!(publisher.posts().is_empty());

    // Still failing: the row stays pending.
    assert_eq!(h.router.redeliver_pending(Duration::ZERO).await.unwrap(), 0);
    assert!(publisher.detectors().is_empty());

    publisher.fail_keyword.store(false, Ordering::SeqCst);
    assert_eq!(h.router.redeliver_pending(Duration::ZERO).await.unwrap(), 1);
    assert_eq!(h.router.redeliver_pending(Duration::ZERO).await.unwrap(), 0);

    assert_eq!(
        publisher.detectors(),
        vec!["detect_related_post", "detect_related_image", "detect_related_url"]
    );
    assert_eq!(
        publisher.posts(),
        vec![
            "Face spotted: https://twitter.com/erin/status/41",
            "Link spotted: https://news.example.com/story"
        ]
    );
}
