//! Payloads exchanged with downstream collaborators.

use serde::{Deserialize, Serialize};

use crate::post::{HandlingOptions, Post};

/// Emitted once per newly seen canonical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
    pub post: Post,
    pub options: HandlingOptions,
}

/// Ask the social client to reshare a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReshareRequest {
    pub canonical_id: String,
    pub reason: ReshareReason,
}

/// Which detector asked for the reshare, and what it found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "detector")]
pub enum ReshareReason {
    #[serde(rename = "detect_related_post")]
    Keyword { matched_keyword: Option<String> },
    #[serde(rename = "detect_related_image")]
    Image { image_url: String, similarity: f64 },
    #[serde(rename = "detect_related_url")]
    Url { url: String, detected_text: String },
}

impl ReshareReason {
    #[must_use]
    pub fn detector_name(&self) -> &'static str {
        match self {
            Self::Keyword { .. } => "detect_related_post",
            Self::Image { .. } => "detect_related_image",
            Self::Url { .. } => "detect_related_url",
        }
    }
}

/// Ask the social client to publish a status update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRequest {
    pub status: String,
}
