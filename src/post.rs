//! Typed social posts and per-source handling options.
//!
//! Posts arrive from the social API as loosely shaped status JSON. They are
//! converted into [`Post`] exactly once, at ingestion, which is also where the
//! canonical id used for deduplication is derived.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Prefix of links that point back at the social site itself (quoted-post
/// permalinks and the like). These are never treated as outbound links.
const SOCIAL_PERMALINK_PREFIX: &str = "https://twitter.com/";

/// A status payload that cannot be turned into a [`Post`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFault {
    #[error("malformed status payload: {0}")]
    Malformed(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// A post retrieved from a monitored list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    /// Id of the reshared post for reshares, otherwise the post's own id.
    pub canonical_id: String,
    /// Screen name of the account that published this post.
    pub author: String,
    /// Screen name of the original author for reshares, otherwise `author`.
    pub original_author: String,
    pub text: String,
    pub quoted_text: Option<String>,
    pub quoted_author: Option<String>,
    pub is_reshare: bool,
    pub is_reply: bool,
    pub is_quoted: bool,
    pub already_reshared_by_self: bool,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub link_urls: Vec<String>,
}

impl Post {
    /// Create a plain (non-reshare, non-reply) post.
    #[must_use]
    pub fn new(id: &str, author: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            canonical_id: id.to_string(),
            author: author.to_string(),
            original_author: author.to_string(),
            text: text.to_string(),
            ..Self::default()
        }
    }

    /// Parse a social-API status object.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationFault`] if the payload does not have the status
    /// shape or lacks the id, text or author.
    pub fn from_status(status: Value) -> Result<Self, ValidationFault> {
        let raw: RawStatus =
            serde_json::from_value(status).map_err(|e| ValidationFault::Malformed(e.to_string()))?;

        let id = raw
            .id
            .as_ref()
            .and_then(id_string)
            .ok_or(ValidationFault::MissingField("id"))?;
        let author = raw
            .user
            .and_then(|u| u.screen_name)
            .ok_or(ValidationFault::MissingField("user.screen_name"))?;
        let text = raw
            .full_text
            .ok_or(ValidationFault::MissingField("full_text"))?;

        let (canonical_id, original_author, is_reshare) = match raw.retweeted_status {
            Some(original) => {
                let original_id = original
                    .id
                    .as_ref()
                    .and_then(id_string)
                    .ok_or(ValidationFault::MissingField("retweeted_status.id"))?;
                let original_author = original
                    .user
                    .and_then(|u| u.screen_name)
                    .ok_or(ValidationFault::MissingField("retweeted_status.user.screen_name"))?;
                (original_id, original_author, true)
            }
            None => (id.clone(), author.clone(), false),
        };

        let is_quoted = raw.quoted_status.is_some();
        let (quoted_text, quoted_author) = raw
            .quoted_status
            .map(|q| (q.full_text, q.user.and_then(|u| u.screen_name)))
            .unwrap_or_default();

        // Only an integer id marks a reply; `null` is sent for regular posts.
        let is_reply = raw.in_reply_to_status_id.as_ref().is_some_and(|v| {
            v.as_u64().is_some() || v.as_i64().is_some()
        });

        let media_urls = raw
            .extended_entities
            .map(|e| {
                e.media
                    .into_iter()
                    .filter_map(|m| m.media_url_https)
                    .collect()
            })
            .unwrap_or_default();

        let link_urls = raw
            .entities
            .map(|e| {
                e.urls
                    .into_iter()
                    .filter_map(|u| u.expanded_url)
                    .filter(|u| !u.starts_with(SOCIAL_PERMALINK_PREFIX))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id,
            canonical_id,
            author,
            original_author,
            text,
            quoted_text,
            quoted_author,
            is_reshare,
            is_reply,
            is_quoted,
            already_reshared_by_self: raw.retweeted.unwrap_or(false),
            media_urls,
            link_urls,
        })
    }

    /// Public permalink of the original post.
    #[must_use]
    pub fn status_url(&self) -> String {
        format!(
            "{SOCIAL_PERMALINK_PREFIX}{}/status/{}",
            self.original_author, self.canonical_id
        )
    }
}

/// Ids are numbers in the API payload, but strings are accepted too.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    id: Option<Value>,
    full_text: Option<String>,
    user: Option<RawUser>,
    retweeted_status: Option<RawEmbeddedStatus>,
    quoted_status: Option<RawEmbeddedStatus>,
    in_reply_to_status_id: Option<Value>,
    retweeted: Option<bool>,
    entities: Option<RawEntities>,
    extended_entities: Option<RawEntities>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    screen_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEmbeddedStatus {
    id: Option<Value>,
    full_text: Option<String>,
    user: Option<RawUser>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEntities {
    #[serde(default)]
    media: Vec<RawMedia>,
    #[serde(default)]
    urls: Vec<RawUrl>,
}

#[derive(Debug, Deserialize)]
struct RawMedia {
    media_url_https: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUrl {
    expanded_url: Option<String>,
}

/// Policy for a secondary (image or URL) check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationMode {
    /// Never run the check.
    #[default]
    #[serde(rename = "NONE")]
    Never,
    /// Run the check only when no keyword triggered a reshare.
    #[serde(rename = "EVALUATE")]
    Evaluate,
    /// Run the check unconditionally.
    #[serde(rename = "ALWAYS")]
    Always,
}

/// How posts from one monitored source are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct HandlingOptions {
    #[serde(alias = "always_retweet")]
    pub always_reshare: bool,
    #[serde(alias = "include_retweet")]
    pub include_reshares: bool,
    #[serde(alias = "include_reply")]
    pub include_replies: bool,
    pub include_quoted_text: bool,
    #[serde(alias = "evaluate_image")]
    pub image_evaluation: EvaluationMode,
    #[serde(alias = "evaluate_url")]
    pub url_evaluation: EvaluationMode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plain_status() -> Value {
        json!({
            "id": 1_234_567_890_u64,
            "full_text": "テストツイート",
            "user": {"screen_name": "gomi_ningen"},
            "in_reply_to_status_id": null,
            "retweeted": false,
            "entities": {"urls": []}
        })
    }

    #[test]
    fn test_plain_status() {
        let post = Post::from_status(plain_status()).unwrap();
        assert_eq!(post.id, "1234567890");
        assert_eq!(post.canonical_id, "1234567890");
        assert_eq!(post.author, "gomi_ningen");
        assert_eq!(post.original_author, "gomi_ningen");
        assert!(!post.is_reshare);
        assert!(!post.is_reply);
        assert!(!post.is_quoted);
        assert!(!post.already_reshared_by_self);
        assert!(post.media_urls.is_empty());
        assert!(post.link_urls.is_empty());
    }

    #[test]
    fn test_reshare_uses_original_id_and_author() {
        let status = json!({
            "id": 200,
            "full_text": "RT @someone: hello",
            "user": {"screen_name": "curator"},
            "retweeted_status": {
                "id": 100,
                "full_text": "hello",
                "user": {"screen_name": "someone"}
            }
        });
        let post = Post::from_status(status).unwrap();
        assert_eq!(post.id, "200");
        assert_eq!(post.canonical_id, "100");
        assert_eq!(post.author, "curator");
        assert_eq!(post.original_author, "someone");
        assert!(post.is_reshare);
        assert_eq!(post.status_url(), "https://twitter.com/someone/status/100");
    }

    #[test]
    fn test_reply_requires_integer_id() {
        let mut status = plain_status();
        status["in_reply_to_status_id"] = json!(42);
        assert!(Post::from_status(status).unwrap().is_reply);

        let mut status = plain_status();
        status["in_reply_to_status_id"] = json!("42");
        assert!(!Post::from_status(status).unwrap().is_reply);
    }

    #[test]
    fn test_quoted_status() {
        let mut status = plain_status();
        status["quoted_status"] = json!({
            "id": 7,
            "full_text": "quoted words",
            "user": {"screen_name": "quoted_user"}
        });
        let post = Post::from_status(status).unwrap();
        assert!(post.is_quoted);
        assert_eq!(post.quoted_text.as_deref(), Some("quoted words"));
        assert_eq!(post.quoted_author.as_deref(), Some("quoted_user"));
    }

    #[test]
    fn test_media_and_links() {
        let mut status = plain_status();
        status["extended_entities"] = json!({
            "media": [
                {"media_url_https": "https://pbs.example.com/a.jpg"},
                {"media_url_https": "https://pbs.example.com/b.jpg"}
            ]
        });
        status["entities"] = json!({
            "urls": [
                {"expanded_url": "https://news.example.com/article"},
                {"expanded_url": "https://twitter.com/other/status/1"}
            ]
        });
        let post = Post::from_status(status).unwrap();
        assert_eq!(
            post.media_urls,
            vec!["https://pbs.example.com/a.jpg", "https://pbs.example.com/b.jpg"]
        );
        assert_eq!(post.link_urls, vec!["https://news.example.com/article"]);
    }

    #[test]
    fn test_missing_fields_are_validation_faults() {
        let mut status = plain_status();
        status.as_object_mut().unwrap().remove("full_text");
        assert_eq!(
            Post::from_status(status),
            Err(ValidationFault::MissingField("full_text"))
        );

        let mut status = plain_status();
        status.as_object_mut().unwrap().remove("user");
        assert_eq!(
            Post::from_status(status),
            Err(ValidationFault::MissingField("user.screen_name"))
        );

        assert!(matches!(
            Post::from_status(json!("not an object")),
            Err(ValidationFault::Malformed(_))
        ));
    }

    #[test]
    fn test_handling_options_accept_legacy_keys() {
        let options: HandlingOptions = serde_json::from_value(json!({
            "always_retweet": true,
            "include_reply": true,
            "evaluate_image": "ALWAYS",
            "url_evaluation": "EVALUATE"
        }))
        .unwrap();
        assert!(options.always_reshare);
        assert!(options.include_replies);
        assert!(!options.include_reshares);
        assert_eq!(options.image_evaluation, EvaluationMode::Always);
        assert_eq!(options.url_evaluation, EvaluationMode::Evaluate);
    }

    #[test]
    fn test_unknown_evaluation_mode_is_rejected() {
        let result: Result<HandlingOptions, _> =
            serde_json::from_value(json!({"evaluate_image": "SOMETIMES"}));
        assert!(result.is_err());
    }
}
