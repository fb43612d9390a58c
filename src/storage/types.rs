use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feed::Podcast;

/// Identity assigned to a podcast when it is first imported.
pub type PodcastId = i64;

// ============================================================================
// Error Types
// ============================================================================

/// Storage failures with user-friendly messages
#[derive(Debug, Error)]
pub enum StoreError {
    /// No podcast with this id
    #[error("Podcast {0} not found")]
    NotFound(PodcastId),

    /// The store refused the record (constraint violation and the like)
    #[error("Storage rejected podcast: {0}")]
    Rejected(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ============================================================================
// Data Structures
// ============================================================================

/// A podcast as persisted: the feed data plus what the importing system owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPodcast {
    pub id: PodcastId,
    /// Feed the podcast was imported from. Required for re-ingestion.
    pub rss_feed_url: String,
    pub auto_update: bool,
    pub import_date: DateTime<Utc>,
    /// Set on every successful update from the feed
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub podcast: Podcast,
}

// ============================================================================
// Storage Collaborator
// ============================================================================

/// Persistence used by the ingestion pipeline.
///
/// `save` is an upsert keyed by [`StoredPodcast::id`] and returns what was
/// stored. `insert` only ever creates. Implementations must keep at most one
/// podcast per feed URL.
#[async_trait]
pub trait PodcastStore: Send + Sync {
    async fn save(&self, podcast: &StoredPodcast) -> Result<StoredPodcast, StoreError>;

    /// Stores a podcast under an id that must not exist yet.
    ///
    /// # Errors
    ///
    /// [`StoreError::Rejected`] when the id or the feed URL is already taken.
    async fn insert(&self, podcast: &StoredPodcast) -> Result<StoredPodcast, StoreError>;

    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no podcast has this id.
    async fn load(&self, id: PodcastId) -> Result<StoredPodcast, StoreError>;

    /// All podcasts ordered by id.
    async fn list(&self) -> Result<Vec<StoredPodcast>, StoreError>;

    async fn find_by_feed_url(&self, url: &str) -> Result<Option<StoredPodcast>, StoreError>;
}
