//! Keyword and ignore-list matching.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Configured keyword and ignore lists.
///
/// Keyword lists are ordered: the first matching entry wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordRules {
    #[serde(rename = "keywords")]
    pub global_keywords: Vec<String>,
    #[serde(rename = "user_related_keywords")]
    pub author_keywords: HashMap<String, Vec<String>>,
    #[serde(rename = "ignored_keywords")]
    pub ignore_keywords: Vec<String>,
    #[serde(rename = "ignored_users")]
    pub ignore_authors: HashSet<String>,
}

/// Plain substring matcher over [`KeywordRules`].
///
/// Matching is case-sensitive containment, not tokenized.
#[derive(Debug, Clone, Default)]
pub struct KeywordDetector {
    rules: KeywordRules,
}

impl KeywordDetector {
    #[must_use]
    pub fn new(rules: KeywordRules) -> Self {
        Self { rules }
    }

    #[must_use]
    pub fn rules(&self) -> &KeywordRules {
        &self.rules
    }

    /// Whether the author is ignored or the text contains an ignore keyword.
    #[must_use]
    pub fn is_ignored(&self, text: &str, author: &str) -> bool {
        self.rules.ignore_authors.contains(author)
            || self
                .rules
                .ignore_keywords
                .iter()
                .any(|k| text.contains(k.as_str()))
    }

    /// Find the first related keyword in `text`.
    ///
    /// Global keywords are scanned before the author's own keywords. Nothing
    /// matches once an ignore condition fires.
    #[must_use]
    pub fn find(&self, text: &str, author: &str) -> Option<&str> {
        if self.is_ignored(text, author) {
            return None;
        }
        let author_keywords = self
            .rules
            .author_keywords
            .get(author)
            .map(Vec::as_slice)
            .unwrap_or_default();

        self.rules
            .global_keywords
            .iter()
            .chain(author_keywords)
            .find(|k| text.contains(k.as_str()))
            .map(String::as_str)
    }

    #[must_use]
    pub fn matches(&self, text: &str, author: &str) -> bool {
        self.find(text, author).is_some()
    }
}
