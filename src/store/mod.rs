//! Storage interface consumed by the engine.
//!
//! Durable persistence lives outside this crate; the engine only needs the
//! operations below. Implementations must be safe for concurrent use from
//! many workers; both pools share one handle with no extra locking here.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Opaque storage failure. The engine never inspects these beyond logging.
#[derive(Debug, Error)]
#[error("store error: {0}")]
pub struct StoreError(String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// One subscribed feed's persistent fetch state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedRecord {
    /// Feed URL; the primary key.
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// ETag validator from the last successful fetch.
    pub etag: Option<String>,
    /// Last-Modified validator from the last successful fetch.
    pub last_modified: Option<String>,
    /// When the feed was last attempted, success or not.
    pub last_fetched_at: Option<DateTime<Utc>>,
    /// When the feed last yielded a usable response (parsed body or 304).
    pub last_success_at: Option<DateTime<Utc>>,
    /// Reset to zero only by a successfully parsed fetch; a 304 cache hit
    /// leaves it untouched.
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Advances only when a fetch produces newly first-seen items. A feed
    /// that edits items in place without changing GUIDs will not move this
    /// forward.
    pub latest_item_at: Option<DateTime<Utc>>,
    /// Opaque parsed payload for the caller's own use.
    pub payload: Option<serde_json::Value>,
}

impl FeedRecord {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// One feed item, keyed by (feed URL, normalized GUID).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemRecord {
    pub feed_url: String,
    /// Normalized GUID (see [`crate::feed::parser::normalize_guid`]).
    pub guid: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    /// Write-once: implementations must keep the first non-`None` value even
    /// when a later upsert supplies a different one.
    pub published_at: Option<DateTime<Utc>>,
    /// Write-once: set the instant the GUID was first observed, immutable
    /// thereafter.
    pub first_seen_at: DateTime<Utc>,
    /// True once the item stops appearing in fetches of its feed.
    pub archived: bool,
    pub payload: Option<serde_json::Value>,
}

/// Extracted preview metadata for one page URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UrlMetadataRecord {
    /// Page URL; the primary key.
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub favicon_url: Option<String>,
    /// Free-form metadata (og:/twitter: properties).
    pub extra: BTreeMap<String, String>,
    pub fetched_at: Option<DateTime<Utc>>,
    /// Status of the last fetch attempt. `None` when no response arrived
    /// (transport failure or robots denial) and counts as non-2xx for retry
    /// eligibility.
    pub status: Option<u16>,
    pub last_error: Option<String>,
}

impl UrlMetadataRecord {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Was the last fetch of this URL a success?
    pub fn is_success(&self) -> bool {
        self.status.is_some_and(|s| (200..300).contains(&s))
    }
}

/// Storage operations the engine depends on.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_feed(&self, url: &str) -> Result<Option<FeedRecord>, StoreError>;

    async fn upsert_feed(&self, feed: &FeedRecord) -> Result<(), StoreError>;

    async fn item_exists(&self, feed_url: &str, guid: &str) -> Result<bool, StoreError>;

    /// First-seen timestamp for the item, or `None` if the GUID has never
    /// been observed for this feed.
    async fn item_first_seen(
        &self,
        feed_url: &str,
        guid: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Insert or update an item. `published_at` and `first_seen_at` are
    /// write-once: values already stored win over the ones supplied here.
    async fn upsert_item(&self, item: &ItemRecord) -> Result<(), StoreError>;

    /// Archive every item of `feed_url` whose GUID is not in `active_guids`,
    /// and only those. An empty set archives all items of the feed.
    async fn archive_items(
        &self,
        feed_url: &str,
        active_guids: &HashSet<String>,
    ) -> Result<(), StoreError>;

    async fn get_metadata(&self, url: &str) -> Result<Option<UrlMetadataRecord>, StoreError>;

    async fn upsert_metadata(&self, metadata: &UrlMetadataRecord) -> Result<(), StoreError>;

    /// Which of `urls` already have a metadata record, in one round trip.
    async fn has_metadata_batch(&self, urls: &[String]) -> Result<HashSet<String>, StoreError>;
}
