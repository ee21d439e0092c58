//! Curation bot library.
//!
//! Polls curated social-media lists, deduplicates posts across runs and
//! processes, and triages new posts into reshare and auto-post requests.

// Allow raw string hashes for safety - they're harmless and prevent issues if content changes
#![allow(clippy::needless_raw_string_hashes)]

pub mod bot_config;
pub mod cache;
pub mod config;
pub mod context;
pub mod detector;
pub mod events;
pub mod keywords;
pub mod page_text;
pub mod post;
pub mod reactions;
pub mod router;
pub mod s3;
pub mod similarity;
pub mod social;
pub mod template;
pub mod triage;
