//! In-memory [`Store`] used by tests and small embedders.

use super::{FeedRecord, ItemRecord, Store, StoreError, UrlMetadataRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Hash-map backed store. All methods are lock-per-call; no lock is held
/// across an await point.
#[derive(Default)]
pub struct MemoryStore {
    feeds: RwLock<HashMap<String, FeedRecord>>,
    items: RwLock<HashMap<(String, String), ItemRecord>>,
    metadata: RwLock<HashMap<String, UrlMetadataRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-archived GUIDs currently stored for a feed. Test helper.
    pub fn active_guids(&self, feed_url: &str) -> HashSet<String> {
        self.items
            .read()
            .expect("items lock poisoned")
            .values()
            .filter(|item| item.feed_url == feed_url && !item.archived)
            .map(|item| item.guid.clone())
            .collect()
    }

    /// Snapshot of one stored item. Test helper.
    pub fn item(&self, feed_url: &str, guid: &str) -> Option<ItemRecord> {
        self.items
            .read()
            .expect("items lock poisoned")
            .get(&(feed_url.to_string(), guid.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_feed(&self, url: &str) -> Result<Option<FeedRecord>, StoreError> {
        Ok(self
            .feeds
            .read()
            .expect("feeds lock poisoned")
            .get(url)
            .cloned())
    }

    async fn upsert_feed(&self, feed: &FeedRecord) -> Result<(), StoreError> {
        self.feeds
            .write()
            .expect("feeds lock poisoned")
            .insert(feed.url.clone(), feed.clone());
        Ok(())
    }

    async fn item_exists(&self, feed_url: &str, guid: &str) -> Result<bool, StoreError> {
        Ok(self
            .items
            .read()
            .expect("items lock poisoned")
            .contains_key(&(feed_url.to_string(), guid.to_string())))
    }

    async fn item_first_seen(
        &self,
        feed_url: &str,
        guid: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .items
            .read()
            .expect("items lock poisoned")
            .get(&(feed_url.to_string(), guid.to_string()))
            .map(|item| item.first_seen_at))
    }

    async fn upsert_item(&self, item: &ItemRecord) -> Result<(), StoreError> {
        let mut items = self.items.write().expect("items lock poisoned");
        let key = (item.feed_url.clone(), item.guid.clone());
        let mut record = item.clone();
        if let Some(existing) = items.get(&key) {
            // Write-once fields keep their stored values.
            record.first_seen_at = existing.first_seen_at;
            if existing.published_at.is_some() {
                record.published_at = existing.published_at;
            }
        }
        items.insert(key, record);
        Ok(())
    }

    async fn archive_items(
        &self,
        feed_url: &str,
        active_guids: &HashSet<String>,
    ) -> Result<(), StoreError> {
        let mut items = self.items.write().expect("items lock poisoned");
        for item in items.values_mut() {
            if item.feed_url == feed_url && !active_guids.contains(&item.guid) {
                item.archived = true;
            }
        }
        Ok(())
    }

    async fn get_metadata(&self, url: &str) -> Result<Option<UrlMetadataRecord>, StoreError> {
        Ok(self
            .metadata
            .read()
            .expect("metadata lock poisoned")
            .get(url)
            .cloned())
    }

    async fn upsert_metadata(&self, metadata: &UrlMetadataRecord) -> Result<(), StoreError> {
        self.metadata
            .write()
            .expect("metadata lock poisoned")
            .insert(metadata.url.clone(), metadata.clone());
        Ok(())
    }

    async fn has_metadata_batch(&self, urls: &[String]) -> Result<HashSet<String>, StoreError> {
        let metadata = self.metadata.read().expect("metadata lock poisoned");
        Ok(urls
            .iter()
            .filter(|url| metadata.contains_key(*url))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(feed: &str, guid: &str, first_seen: DateTime<Utc>) -> ItemRecord {
        ItemRecord {
            feed_url: feed.to_string(),
            guid: guid.to_string(),
            first_seen_at: first_seen,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_published_date_write_once() {
        let store = MemoryStore::new();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        let mut record = item("f", "a", t1);
        record.published_at = Some(t1);
        store.upsert_item(&record).await.unwrap();

        record.published_at = Some(t2);
        store.upsert_item(&record).await.unwrap();

        assert_eq!(store.item("f", "a").unwrap().published_at, Some(t1));
    }

    #[tokio::test]
    async fn test_first_seen_immutable() {
        let store = MemoryStore::new();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        store.upsert_item(&item("f", "a", t1)).await.unwrap();
        store.upsert_item(&item("f", "a", t2)).await.unwrap();

        assert_eq!(store.item("f", "a").unwrap().first_seen_at, t1);
        assert_eq!(store.item_first_seen("f", "a").await.unwrap(), Some(t1));
    }

    #[tokio::test]
    async fn test_archive_empty_set_archives_all() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_item(&item("f", "a", now)).await.unwrap();
        store.upsert_item(&item("f", "b", now)).await.unwrap();

        store.archive_items("f", &HashSet::new()).await.unwrap();
        assert!(store.active_guids("f").is_empty());
    }

    #[tokio::test]
    async fn test_archive_scoped_to_feed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_item(&item("f1", "a", now)).await.unwrap();
        store.upsert_item(&item("f2", "a", now)).await.unwrap();

        store.archive_items("f1", &HashSet::new()).await.unwrap();
        assert!(store.active_guids("f1").is_empty());
        assert_eq!(store.active_guids("f2").len(), 1);
    }

    #[tokio::test]
    async fn test_reappearing_item_unarchived_by_upsert() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_item(&item("f", "a", now)).await.unwrap();
        store.archive_items("f", &HashSet::new()).await.unwrap();

        store.upsert_item(&item("f", "a", now)).await.unwrap();
        assert_eq!(store.active_guids("f").len(), 1);
    }

    #[tokio::test]
    async fn test_has_metadata_batch() {
        let store = MemoryStore::new();
        store
            .upsert_metadata(&UrlMetadataRecord::new("https://a.example/1"))
            .await
            .unwrap();

        let have = store
            .has_metadata_batch(&[
                "https://a.example/1".to_string(),
                "https://a.example/2".to_string(),
            ])
            .await
            .unwrap();
        assert!(have.contains("https://a.example/1"));
        assert!(!have.contains("https://a.example/2"));
    }
}
