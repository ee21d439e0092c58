//! Consumer of [`NewItem`]s: decide, then react.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::detector::{Decision, RelatedPostDetector};
use crate::events::NewItem;
use crate::reactions::Reactions;

pub struct TriageStage {
    detector: RelatedPostDetector,
    reactions: Arc<dyn Reactions>,
}

impl TriageStage {
    #[must_use]
    pub fn new(detector: RelatedPostDetector, reactions: Arc<dyn Reactions>) -> Self {
        Self {
            detector,
            reactions,
        }
    }

    /// Run the detector on a newly seen post and trigger the reactions it
    /// asks for, reshare first.
    ///
    /// # Errors
    ///
    /// Returns the first reaction that could not be delivered. Reactions
    /// after it are not attempted.
    pub async fn handle(&self, item: &NewItem) -> Result<Decision> {
        let decision = self.detector.decide(&item.post, &item.options);
        info!(
            status_id = %item.post.id,
            canonical_id = %item.post.canonical_id,
            matched_keyword = decision.matched_keyword.as_deref(),
            reshare_needed = decision.reshare_needed,
            image_check_needed = decision.image_check_needed,
            url_check_needed = decision.url_check_needed,
            "Post triaged"
        );

        if decision.reshare_needed {
            self.reactions
                .reshare(&item.post, decision.matched_keyword.as_deref())
                .await?;
        }
        if decision.image_check_needed {
            self.reactions.check_image(&item.post).await?;
        }
        if decision.url_check_needed {
            self.reactions.check_url(&item.post).await?;
        }
        Ok(decision)
    }
}

impl std::fmt::Debug for TriageStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriageStage")
            .field("detector", &self.detector)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::keywords::{KeywordDetector, KeywordRules};
    use crate::post::{EvaluationMode, HandlingOptions, Post};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Reactions for Recorder {
        async fn reshare(&self, post: &Post, matched_keyword: Option<&str>) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("reshare {} {matched_keyword:?}", post.canonical_id));
            Ok(())
        }

        async fn post_message(&self, status: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("post {status}"));
            Ok(())
        }

        async fn check_image(&self, post: &Post) -> Result<()> {
            self.calls.lock().unwrap().push(format!("image {}", post.id));
            Ok(())
        }

        async fn check_url(&self, post: &Post) -> Result<()> {
            self.calls.lock().unwrap().push(format!("url {}", post.id));
            Ok(())
        }
    }

    fn stage(reactions: Arc<Recorder>) -> TriageStage {
        let keywords = KeywordDetector::new(KeywordRules {
            global_keywords: vec!["launch".to_string()],
            ..KeywordRules::default()
        });
        TriageStage::new(RelatedPostDetector::new(keywords), reactions)
    }

    #[tokio::test]
    async fn test_keyword_reshare_then_image_check_under_always() {
        let recorder = Arc::new(Recorder::default());
        let item = NewItem {
            post: Post {
                media_urls: vec!["https://img/1.jpg".to_string()],
                ..Post::new("5", "alice", "launch day")
            },
            options: HandlingOptions {
                image_evaluation: EvaluationMode::Always,
                ..HandlingOptions::default()
            },
        };

        let decision = stage(recorder.clone()).handle(&item).await.unwrap();
        assert_eq!(decision.matched_keyword.as_deref(), Some("launch"));
        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec![
                "reshare 5 Some(\"launch\")".to_string(),
                "image 5".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_unrelated_post_triggers_nothing() {
        let recorder = Arc::new(Recorder::default());
        let item = NewItem {
            post: Post::new("6", "alice", "lunch"),
            options: HandlingOptions::default(),
        };

        let decision = stage(recorder.clone()).handle(&item).await.unwrap();
        assert_eq!(decision, Decision::default());
        assert!(recorder.calls.lock().unwrap().is_empty());
    }
}
