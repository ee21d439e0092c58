//! Decide what to do with a post from a monitored list.

use serde::{Deserialize, Serialize};

use crate::keywords::KeywordDetector;
use crate::post::{EvaluationMode, HandlingOptions, Post};

/// Routing decision for one post.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Keyword that triggered the reshare. Always `None` when the source
    /// reshares unconditionally.
    pub matched_keyword: Option<String>,
    pub reshare_needed: bool,
    pub image_check_needed: bool,
    pub url_check_needed: bool,
}

/// Turns a post and its source's [`HandlingOptions`] into a [`Decision`].
#[derive(Debug, Clone, Default)]
pub struct RelatedPostDetector {
    keywords: KeywordDetector,
}

impl RelatedPostDetector {
    #[must_use]
    pub fn new(keywords: KeywordDetector) -> Self {
        Self { keywords }
    }

    #[must_use]
    pub fn decide(&self, post: &Post, options: &HandlingOptions) -> Decision {
        if !self.meets_preconditions(post, options) {
            return Decision::default();
        }

        let (matched_keyword, reshare_needed) = if options.always_reshare {
            (None, true)
        } else {
            let keyword = self.related_keyword(post, options);
            let found = keyword.is_some();
            (keyword, found)
        };

        Decision {
            matched_keyword,
            reshare_needed,
            image_check_needed: check_needed(
                !post.media_urls.is_empty(),
                options.image_evaluation,
                reshare_needed,
            ),
            url_check_needed: check_needed(
                !post.link_urls.is_empty(),
                options.url_evaluation,
                reshare_needed,
            ),
        }
    }

    fn meets_preconditions(&self, post: &Post, options: &HandlingOptions) -> bool {
        if post.already_reshared_by_self {
            return false;
        }
        if self.keywords.is_ignored(&post.text, &post.original_author) {
            return false;
        }
        if post.is_quoted
            && self.keywords.is_ignored(
                post.quoted_text.as_deref().unwrap_or_default(),
                &post.original_author,
            )
        {
            return false;
        }
        (!post.is_reshare || options.include_reshares) && (!post.is_reply || options.include_replies)
    }

    fn related_keyword(&self, post: &Post, options: &HandlingOptions) -> Option<String> {
        self.keywords
            .find(&post.text, &post.author)
            .or_else(|| {
                if post.is_quoted && options.include_quoted_text {
                    // The author key stays the poster's, not the quoted author's.
                    self.keywords
                        .find(post.quoted_text.as_deref().unwrap_or_default(), &post.author)
                } else {
                    None
                }
            })
            .map(ToString::to_string)
    }
}

fn check_needed(has_targets: bool, mode: EvaluationMode, reshare_needed: bool) -> bool {
    if !has_targets {
        return false;
    }
    match mode {
        EvaluationMode::Never => false,
        EvaluationMode::Evaluate => !reshare_needed,
        EvaluationMode::Always => true,
    }
}
