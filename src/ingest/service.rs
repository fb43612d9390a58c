use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use super::merge::{reconcile, MergeStats};
use crate::feed::{parse_feed, FeedSource, FetchError, ParseError, Podcast};
use crate::storage::{PodcastId, PodcastStore, StoreError, StoredPodcast};

/// Errors surfaced by the ingestion operations.
///
/// Fetch and parse failures carry the feed URL so callers can report them
/// without extra bookkeeping.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The feed could not be downloaded
    #[error(transparent)]
    FetchFailed(#[from] FetchError),

    /// The feed was downloaded but is not a usable podcast feed
    #[error("Failed to parse feed {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: ParseError,
    },

    /// The podcast has no feed URL to ingest from
    #[error("Podcast has no RSS feed URL")]
    MissingFeedUrl,

    /// The store refused to save the podcast
    #[error("Failed to persist podcast: {0}")]
    PersistenceFailed(#[from] StoreError),
}

impl IngestError {
    /// Feed URL involved in the failure, when there is one.
    pub fn url(&self) -> Option<&str> {
        match self {
            IngestError::FetchFailed(e) => Some(&e.url),
            IngestError::Parse { url, .. } => Some(url),
            IngestError::MissingFeedUrl | IngestError::PersistenceFailed(_) => None,
        }
    }
}

/// Fetch → parse → import/update pipeline over an injected feed source and store.
///
/// Writes to the same podcast are serialised: an import or update holds that
/// podcast's lock from the moment it starts building the new record until the
/// store has accepted it.
pub struct FeedIngestionService {
    source: Arc<dyn FeedSource>,
    store: Arc<dyn PodcastStore>,
    locks: EntityLocks,
    ids: IdGenerator,
}

impl FeedIngestionService {
    pub fn new(source: Arc<dyn FeedSource>, store: Arc<dyn PodcastStore>) -> Self {
        Self {
            source,
            store,
            locks: EntityLocks::default(),
            ids: IdGenerator::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PodcastStore> {
        &self.store
    }

    /// Downloads and parses `url` without persisting anything.
    ///
    /// # Errors
    ///
    /// - [`IngestError::FetchFailed`] - network error or non-2xx response
    /// - [`IngestError::Parse`] - malformed XML or missing `rss`/`channel`
    pub async fn fetch_and_parse(&self, url: &str) -> Result<Podcast, IngestError> {
        let text = self.source.fetch_text(url).await.inspect_err(|e| {
            tracing::warn!(url = %url, error = %e, "Feed fetch failed");
        })?;

        let podcast = parse_feed(&text).map_err(|source| {
            tracing::warn!(url = %url, error = %source, "Feed parse failed");
            IngestError::Parse {
                url: url.to_string(),
                source,
            }
        })?;

        tracing::info!(
            url = %url,
            title = %podcast.title,
            episodes = podcast.episodes.len(),
            "Parsed feed"
        );
        Ok(podcast)
    }

    /// Persists parsed feed data as a podcast.
    ///
    /// A feed URL that was imported before keeps its identity and original
    /// import date; its episodes are merged exactly as an update would.
    /// Otherwise a new id is assigned and `import_date` is now.
    ///
    /// # Errors
    ///
    /// - [`IngestError::MissingFeedUrl`] - `feed_url` is blank
    /// - [`IngestError::PersistenceFailed`] - the store rejected the record
    pub async fn import_podcast(
        &self,
        feed_url: &str,
        podcast: Podcast,
        auto_update: bool,
    ) -> Result<StoredPodcast, IngestError> {
        let feed_url = feed_url.trim();
        if feed_url.is_empty() {
            return Err(IngestError::MissingFeedUrl);
        }

        let record = match self.store.find_by_feed_url(feed_url).await? {
            Some(known) => {
                let _guard = self.locks.lock(known.id).await;
                // Re-read under the lock so writes that landed meanwhile are merged, not reverted
                let current = self
                    .store
                    .find_by_feed_url(feed_url)
                    .await?
                    .filter(|c| c.id == known.id)
                    .ok_or(StoreError::NotFound(known.id))?;

                let (merged, stats) = reconcile(current.podcast, podcast);
                log_merge(current.id, &stats);
                tracing::info!(podcast_id = current.id, url = %feed_url, "Re-importing known feed");

                let record = StoredPodcast {
                    auto_update,
                    podcast: merged,
                    ..current
                };
                self.persist(&record, SaveMode::Replace).await?
            }
            None => {
                let id = self.ids.next();
                let _guard = self.locks.lock(id).await;
                let record = StoredPodcast {
                    id,
                    rss_feed_url: feed_url.to_string(),
                    auto_update,
                    import_date: Utc::now(),
                    last_updated: None,
                    podcast,
                };
                self.persist(&record, SaveMode::Create).await?
            }
        };

        tracing::info!(
            podcast_id = record.id,
            title = %record.podcast.title,
            episodes = record.podcast.episodes.len(),
            auto_update = record.auto_update,
            "Imported podcast"
        );
        Ok(record)
    }

    /// Re-ingests a stored podcast from its feed.
    ///
    /// Podcast-level fields are overwritten by the fetched values, episodes are
    /// merged by guid, and `last_updated` is stamped. On any error nothing is
    /// written, so the previously persisted record stays as it was.
    ///
    /// # Errors
    ///
    /// - [`IngestError::MissingFeedUrl`] - blank `rss_feed_url`; nothing is fetched
    /// - [`IngestError::FetchFailed`] / [`IngestError::Parse`] - see [`Self::fetch_and_parse`]
    /// - [`IngestError::PersistenceFailed`] - the store rejected the record
    pub async fn update_podcast_from_feed(
        &self,
        existing: &StoredPodcast,
    ) -> Result<StoredPodcast, IngestError> {
        let url = existing.rss_feed_url.trim();
        if url.is_empty() {
            tracing::warn!(podcast_id = existing.id, "Update requested for podcast without feed URL");
            return Err(IngestError::MissingFeedUrl);
        }

        let _guard = self.locks.lock(existing.id).await;

        // The caller's copy may be stale; merge onto what is stored now
        let current = match self.store.load(existing.id).await {
            Ok(current) => current,
            Err(StoreError::NotFound(_)) => existing.clone(),
            Err(e) => return Err(persistence_failed(existing.id, e)),
        };

        let fetched = self.fetch_and_parse(url).await?;
        let (merged, stats) = reconcile(current.podcast, fetched);
        log_merge(current.id, &stats);

        let record = StoredPodcast {
            last_updated: Some(Utc::now()),
            podcast: merged,
            ..current
        };
        let saved = self.persist(&record, SaveMode::Replace).await?;

        tracing::info!(
            podcast_id = saved.id,
            added = stats.added,
            episodes = saved.podcast.episodes.len(),
            "Updated podcast from feed"
        );
        Ok(saved)
    }

    async fn persist(
        &self,
        record: &StoredPodcast,
        mode: SaveMode,
    ) -> Result<StoredPodcast, IngestError> {
        let result = match mode {
            SaveMode::Create => self.store.insert(record).await,
            SaveMode::Replace => self.store.save(record).await,
        };
        result.map_err(|e| persistence_failed(record.id, e))
    }
}

fn persistence_failed(podcast_id: PodcastId, e: StoreError) -> IngestError {
    tracing::error!(podcast_id = podcast_id, error = %e, "Storage rejected podcast");
    IngestError::PersistenceFailed(e)
}

/// New ids must never overwrite an existing podcast.
#[derive(Debug, Clone, Copy)]
enum SaveMode {
    Create,
    Replace,
}

fn log_merge(podcast_id: PodcastId, stats: &MergeStats) {
    if stats.without_guid > 0 {
        tracing::warn!(
            podcast_id = podcast_id,
            count = stats.without_guid,
            "Episodes without guid, deduplicating by exact field match"
        );
    }
    if stats.duplicates > 0 {
        tracing::warn!(
            podcast_id = podcast_id,
            count = stats.duplicates,
            "Feed repeats episodes, keeping first occurrence"
        );
    }
    tracing::debug!(
        podcast_id = podcast_id,
        added = stats.added,
        refreshed = stats.refreshed,
        retained = stats.retained,
        "Merged episodes"
    );
}

// ============================================================================
// Helpers
// ============================================================================

/// One async mutex per podcast id. Entries live only while someone holds or
/// waits for them.
#[derive(Debug, Default)]
struct EntityLocks {
    locks: Mutex<HashMap<PodcastId, Arc<tokio::sync::Mutex<()>>>>,
}

impl EntityLocks {
    async fn lock(&self, id: PodcastId) -> EntityGuard<'_> {
        let lock = {
            let mut locks = self.map();
            Arc::clone(locks.entry(id).or_default())
        };
        EntityGuard {
            owner: self,
            id,
            guard: Some(lock.lock_owned().await),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<PodcastId, Arc<tokio::sync::Mutex<()>>>> {
        // Poisoning only means another task panicked mid-insert; the map is still usable
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct EntityGuard<'a> {
    owner: &'a EntityLocks,
    id: PodcastId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        // Release first so the guard's own reference is gone before counting
        drop(self.guard.take());
        let mut locks = self.owner.map();
        if locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.id);
        }
    }
}

/// Millisecond-timestamp ids, bumped when two imports land in the same millisecond.
#[derive(Debug, Default)]
struct IdGenerator {
    last: AtomicI64,
}

impl IdGenerator {
    fn next(&self) -> PodcastId {
        let now = Utc::now().timestamp_millis();
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}
