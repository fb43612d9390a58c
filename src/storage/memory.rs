use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::types::{PodcastId, PodcastStore, StoreError, StoredPodcast};

/// Process-local store. Used by tests and by the CLI's `preview` path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    podcasts: RwLock<BTreeMap<PodcastId, StoredPodcast>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.podcasts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.podcasts.read().await.is_empty()
    }
}

#[async_trait]
impl PodcastStore for MemoryStore {
    async fn save(&self, podcast: &StoredPodcast) -> Result<StoredPodcast, StoreError> {
        let mut podcasts = self.podcasts.write().await;

        if let Some(other) = podcasts
            .values()
            .find(|p| p.id != podcast.id && p.rss_feed_url == podcast.rss_feed_url)
        {
            return Err(StoreError::Rejected(format!(
                "feed URL {} already belongs to podcast {}",
                podcast.rss_feed_url, other.id
            )));
        }

        podcasts.insert(podcast.id, podcast.clone());
        Ok(podcast.clone())
    }

    async fn insert(&self, podcast: &StoredPodcast) -> Result<StoredPodcast, StoreError> {
        let mut podcasts = self.podcasts.write().await;

        if let Some(other) = podcasts
            .values()
            .find(|p| p.id == podcast.id || p.rss_feed_url == podcast.rss_feed_url)
        {
            return Err(StoreError::Rejected(format!(
                "podcast {} ({}) already exists",
                other.id, other.rss_feed_url
            )));
        }

        podcasts.insert(podcast.id, podcast.clone());
        Ok(podcast.clone())
    }

    async fn load(&self, id: PodcastId) -> Result<StoredPodcast, StoreError> {
        self.podcasts
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list(&self) -> Result<Vec<StoredPodcast>, StoreError> {
        Ok(self.podcasts.read().await.values().cloned().collect())
    }

    async fn find_by_feed_url(&self, url: &str) -> Result<Option<StoredPodcast>, StoreError> {
        Ok(self
            .podcasts
            .read()
            .await
            .values()
            .find(|p| p.rss_feed_url == url)
            .cloned())
    }
}
