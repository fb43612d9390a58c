//! Periodic and on-demand re-ingestion of auto-updating podcasts.
//!
//! An [`UpdateScheduler`] owns all of its state (last run, busy flag), so any
//! number of independent schedulers can coexist. Batches never overlap: a
//! check or manual trigger arriving while a batch runs is skipped, not queued.
//! Within a batch podcasts are updated one after another and a failure only
//! affects that podcast.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::ingest::{FeedIngestionService, IngestError};
use crate::storage::{PodcastId, PodcastStore, StoredPodcast};

/// Default time between batch runs.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default time between "is a batch due?" checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Manual trigger with nothing to update
    #[error("No podcasts provided for update")]
    EmptyPodcastSet,

    /// Built without anything to run updates through
    #[error("Invalid update callback: no podcast updater configured")]
    InvalidCallback,

    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Whatever performs the per-podcast update. [`FeedIngestionService`] in production.
#[async_trait]
pub trait PodcastUpdater: Send + Sync {
    async fn update(&self, podcast: &StoredPodcast) -> Result<StoredPodcast, IngestError>;
}

#[async_trait]
impl PodcastUpdater for FeedIngestionService {
    async fn update(&self, podcast: &StoredPodcast) -> Result<StoredPodcast, IngestError> {
        self.update_podcast_from_feed(podcast).await
    }
}

/// Outcome of one attempted sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub updated: Vec<PodcastId>,
    /// Podcast id and the error message, in batch order
    pub failed: Vec<(PodcastId, String)>,
}

impl BatchReport {
    pub fn attempted(&self) -> usize {
        self.updated.len() + self.failed.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The update interval has not elapsed since the last run
    NotDue,
    /// Another batch is in progress
    AlreadyRunning,
    /// No podcast has auto-update enabled
    NothingToUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed(BatchReport),
    Skipped(SkipReason),
}

/// Snapshot of scheduler state for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub is_updating: bool,
    pub last_run_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Builder
// ============================================================================

pub struct SchedulerBuilder {
    update_interval: Duration,
    check_interval: Duration,
    updater: Option<Arc<dyn PodcastUpdater>>,
}

impl SchedulerBuilder {
    /// Minimum time between two scheduled batches.
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// How often the running loop checks whether a batch is due.
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn updater(mut self, updater: Arc<dyn PodcastUpdater>) -> Self {
        self.updater = Some(updater);
        self
    }

    /// # Errors
    ///
    /// - [`SchedulerError::InvalidCallback`] - no updater was given
    /// - [`SchedulerError::InvalidConfig`] - an interval is zero
    pub fn build(self) -> Result<UpdateScheduler, SchedulerError> {
        let updater = self.updater.ok_or(SchedulerError::InvalidCallback)?;
        if self.update_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig("update interval must be non-zero"));
        }
        if self.check_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig("check interval must be non-zero"));
        }

        Ok(UpdateScheduler {
            update_interval: self.update_interval,
            check_interval: self.check_interval,
            updater,
            busy: AtomicBool::new(false),
            last_run: Mutex::new(None),
        })
    }
}

// ============================================================================
// UpdateScheduler
// ============================================================================

pub struct UpdateScheduler {
    update_interval: Duration,
    check_interval: Duration,
    updater: Arc<dyn PodcastUpdater>,
    busy: AtomicBool,
    /// Start of the last scheduled sweep: monotonic for the due check, wall clock for display
    last_run: Mutex<Option<(Instant, DateTime<Utc>)>>,
}

impl std::fmt::Debug for UpdateScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateScheduler")
            .field("update_interval", &self.update_interval)
            .field("check_interval", &self.check_interval)
            .field("busy", &self.busy)
            .field("last_run", &self.last_run)
            .finish_non_exhaustive()
    }
}

impl UpdateScheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            check_interval: DEFAULT_CHECK_INTERVAL,
            updater: None,
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            is_updating: self.busy.load(Ordering::Acquire),
            last_run_at: self.last_run_snapshot().map(|(_, at)| at),
        }
    }

    /// The podcasts a scheduled sweep would touch.
    pub fn select_for_update(podcasts: &[StoredPodcast]) -> Vec<&StoredPodcast> {
        podcasts.iter().filter(|p| p.auto_update).collect()
    }

    /// True when no sweep has run yet or the update interval has elapsed.
    pub fn is_due(&self) -> bool {
        match self.last_run_snapshot() {
            None => true,
            Some((started, _)) => started.elapsed() >= self.update_interval,
        }
    }

    /// One cadence check: runs a batch over the auto-update podcasts if due.
    ///
    /// The last-run marker advances once the sweep has been attempted, even if
    /// some podcasts failed.
    pub async fn check_and_update(&self, podcasts: &[StoredPodcast]) -> BatchOutcome {
        let selected = Self::select_for_update(podcasts);
        if selected.is_empty() {
            tracing::debug!("No podcasts with auto-update enabled");
            return BatchOutcome::Skipped(SkipReason::NothingToUpdate);
        }
        if !self.is_due() {
            tracing::debug!("Scheduled update not due yet");
            return BatchOutcome::Skipped(SkipReason::NotDue);
        }

        self.run_batch(&selected, true).await
    }

    /// Immediately updates every given podcast, regardless of cadence or flag.
    ///
    /// Does not move the scheduled last-run marker.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::EmptyPodcastSet`] when `podcasts` is empty.
    pub async fn trigger_manual_update(
        &self,
        podcasts: &[StoredPodcast],
    ) -> Result<BatchOutcome, SchedulerError> {
        if podcasts.is_empty() {
            return Err(SchedulerError::EmptyPodcastSet);
        }
        let all: Vec<&StoredPodcast> = podcasts.iter().collect();
        Ok(self.run_batch(&all, false).await)
    }

    /// Spawns the periodic check loop. The first check happens immediately.
    ///
    /// Each check reads the current podcast collection from `store`. The loop
    /// ends when [`SchedulerHandle::stop`] is called or the handle is dropped;
    /// a batch already running is allowed to finish first.
    pub fn start(self: &Arc<Self>, store: Arc<dyn PodcastStore>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(scheduler.check_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                update_interval_secs = scheduler.update_interval.as_secs(),
                check_interval_secs = scheduler.check_interval.as_secs(),
                "Update scheduler started"
            );

            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                match store.list().await {
                    Ok(podcasts) => {
                        scheduler.check_and_update(&podcasts).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to load podcasts for scheduled update");
                    }
                }
            }

            tracing::info!("Update scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run_batch(&self, podcasts: &[&StoredPodcast], scheduled: bool) -> BatchOutcome {
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            tracing::debug!(scheduled = scheduled, "Update already in progress, skipping");
            return BatchOutcome::Skipped(SkipReason::AlreadyRunning);
        };

        let started = (Instant::now(), Utc::now());
        tracing::info!(
            podcasts = podcasts.len(),
            scheduled = scheduled,
            "Starting podcast update batch"
        );

        let mut report = BatchReport::default();
        for podcast in podcasts {
            match self.updater.update(podcast).await {
                Ok(updated) => {
                    tracing::info!(
                        podcast_id = updated.id,
                        title = %updated.podcast.title,
                        "Podcast updated from feed"
                    );
                    report.updated.push(updated.id);
                }
                Err(e) => {
                    tracing::error!(
                        podcast_id = podcast.id,
                        url = %podcast.rss_feed_url,
                        error = %e,
                        "Podcast update failed"
                    );
                    report.failed.push((podcast.id, e.to_string()));
                }
            }
        }

        if scheduled {
            *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(started);
        }

        tracing::info!(
            updated = report.updated.len(),
            failed = report.failed.len(),
            "Podcast update batch finished"
        );
        BatchOutcome::Completed(report)
    }

    fn last_run_snapshot(&self) -> Option<(Instant, DateTime<Utc>)> {
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Clears the busy flag when the batch ends, including on panic or cancellation.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Running check loop. Stop it to tear the timer down.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signals the loop and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Update scheduler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FetchCause, FetchError, Podcast};
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Counts calls; fails for ids in `failing`.
    #[derive(Default)]
    struct CountingUpdater {
        calls: AtomicUsize,
        failing: HashSet<PodcastId>,
    }

    #[async_trait]
    impl PodcastUpdater for CountingUpdater {
        async fn update(&self, podcast: &StoredPodcast) -> Result<StoredPodcast, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(&podcast.id) {
                return Err(IngestError::FetchFailed(FetchError {
                    url: podcast.rss_feed_url.clone(),
                    cause: FetchCause::HttpStatus(503),
                }));
            }
            Ok(StoredPodcast {
                last_updated: Some(Utc::now()),
                ..podcast.clone()
            })
        }
    }

    /// Blocks inside `update` until released.
    struct BlockingUpdater {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PodcastUpdater for BlockingUpdater {
        async fn update(&self, podcast: &StoredPodcast) -> Result<StoredPodcast, IngestError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(podcast.clone())
        }
    }

    fn podcast(id: PodcastId, auto_update: bool) -> StoredPodcast {
        StoredPodcast {
            id,
            rss_feed_url: format!("https://example.com/{id}.xml"),
            auto_update,
            import_date: Utc::now(),
            last_updated: None,
            podcast: Podcast::default(),
        }
    }

    fn scheduler(updater: Arc<dyn PodcastUpdater>) -> UpdateScheduler {
        UpdateScheduler::builder().updater(updater).build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_check_runs_second_check_within_interval_does_not() {
        let updater = Arc::new(CountingUpdater::default());
        let scheduler = scheduler(updater.clone());
        let podcasts = vec![podcast(1, true)];

        let outcome = scheduler.check_and_update(&podcasts).await;
        assert_eq!(
            outcome,
            BatchOutcome::Completed(BatchReport {
                updated: vec![1],
                failed: vec![],
            })
        );
        assert_eq!(updater.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        let outcome = scheduler.check_and_update(&podcasts).await;
        assert_eq!(outcome, BatchOutcome::Skipped(SkipReason::NotDue));
        assert_eq!(updater.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_runs_again_once_interval_elapsed() {
        let updater = Arc::new(CountingUpdater::default());
        let scheduler = scheduler(updater.clone());
        let podcasts = vec![podcast(1, true)];

        scheduler.check_and_update(&podcasts).await;
        tokio::time::advance(DEFAULT_UPDATE_INTERVAL).await;
        assert!(scheduler.is_due());
        scheduler.check_and_update(&podcasts).await;

        assert_eq!(updater.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_only_auto_update_podcasts_selected() {
        let updater = Arc::new(CountingUpdater::default());
        let scheduler = scheduler(updater.clone());
        let podcasts = vec![podcast(1, false), podcast(2, true), podcast(3, false)];

        let outcome = scheduler.check_and_update(&podcasts).await;
        match outcome {
            BatchOutcome::Completed(report) => assert_eq!(report.updated, vec![2]),
            other => panic!("Expected a completed batch, got {:?}", other),
        }
        assert_eq!(updater.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_auto_update_podcasts_is_skipped_without_marking_run() {
        let updater = Arc::new(CountingUpdater::default());
        let scheduler = scheduler(updater.clone());

        let outcome = scheduler.check_and_update(&[podcast(1, false)]).await;
        assert_eq!(outcome, BatchOutcome::Skipped(SkipReason::NothingToUpdate));
        assert!(scheduler.status().last_run_at.is_none());
        assert_eq!(updater.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_batch_and_marker_advances() {
        let updater = Arc::new(CountingUpdater {
            failing: HashSet::from([1]),
            ..CountingUpdater::default()
        });
        let scheduler = scheduler(updater.clone());
        let podcasts = vec![podcast(1, true), podcast(2, true)];

        let outcome = scheduler.check_and_update(&podcasts).await;
        let BatchOutcome::Completed(report) = outcome else {
            panic!("Expected a completed batch");
        };
        assert_eq!(report.updated, vec![2]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 1);
        assert!(report.failed[0].1.contains("503"));
        assert_eq!(report.attempted(), 2);

        assert!(scheduler.status().last_run_at.is_some());
        assert!(!scheduler.is_due());
    }

    #[tokio::test]
    async fn test_manual_trigger_requires_podcasts() {
        let scheduler = scheduler(Arc::new(CountingUpdater::default()));
        let err = scheduler.trigger_manual_update(&[]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::EmptyPodcastSet));
    }

    #[tokio::test]
    async fn test_manual_trigger_updates_all_and_keeps_cadence() {
        let updater = Arc::new(CountingUpdater::default());
        let scheduler = scheduler(updater.clone());

        let outcome = scheduler
            .trigger_manual_update(&[podcast(1, false), podcast(2, true)])
            .await
            .unwrap();
        match outcome {
            BatchOutcome::Completed(report) => assert_eq!(report.updated, vec![1, 2]),
            other => panic!("Expected a completed batch, got {:?}", other),
        }
        assert!(scheduler.status().last_run_at.is_none());
        assert!(scheduler.is_due());
    }

    #[tokio::test]
    async fn test_overlapping_runs_are_skipped() {
        let updater = Arc::new(BlockingUpdater {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let scheduler = Arc::new(scheduler(updater.clone()));

        let running = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.check_and_update(&[podcast(1, true)]).await })
        };
        updater.entered.notified().await;
        assert!(scheduler.status().is_updating);

        let manual = scheduler
            .trigger_manual_update(&[podcast(2, true)])
            .await
            .unwrap();
        assert_eq!(manual, BatchOutcome::Skipped(SkipReason::AlreadyRunning));

        updater.release.notify_one();
        let first = running.await.unwrap();
        assert!(matches!(first, BatchOutcome::Completed(_)));
        assert!(!scheduler.status().is_updating);
    }

    #[test]
    fn test_builder_requires_updater() {
        let err = UpdateScheduler::builder().build().unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCallback));
    }

    #[test]
    fn test_builder_rejects_zero_intervals() {
        let updater: Arc<dyn PodcastUpdater> = Arc::new(CountingUpdater::default());
        let err = UpdateScheduler::builder()
            .updater(updater.clone())
            .update_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));

        let err = UpdateScheduler::builder()
            .updater(updater)
            .check_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_independent_schedulers_do_not_share_state() {
        let a = scheduler(Arc::new(CountingUpdater::default()));
        let b = scheduler(Arc::new(CountingUpdater::default()));

        a.check_and_update(&[podcast(1, true)]).await;
        assert!(!a.is_due());
        assert!(b.is_due());
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_loop_follows_cadence_and_stops() {
        let store = Arc::new(MemoryStore::new());
        store.save(&podcast(1, true)).await.unwrap();
        store.save(&podcast(2, false)).await.unwrap();

        let updater = Arc::new(CountingUpdater::default());
        let scheduler = Arc::new(scheduler(updater.clone()));
        let handle = scheduler.start(store);

        // Initial check fires immediately
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(updater.calls.load(Ordering::SeqCst), 1);

        // Hourly checks before the interval elapses do nothing
        tokio::time::sleep(Duration::from_secs(5 * 60 * 60)).await;
        assert_eq!(updater.calls.load(Ordering::SeqCst), 1);

        // The check at 24h runs the next batch
        tokio::time::sleep(Duration::from_secs(19 * 60 * 60)).await;
        assert_eq!(updater.calls.load(Ordering::SeqCst), 2);

        handle.stop().await;
        tokio::time::sleep(DEFAULT_UPDATE_INTERVAL * 2).await;
        assert_eq!(updater.calls.load(Ordering::SeqCst), 2);
    }
}
