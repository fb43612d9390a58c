//! Integration tests for scheduled and manual batch updates driven through the
//! real ingestion service, fetcher and store.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use podfeed::feed::{FeedFetcher, Podcast};
use podfeed::ingest::FeedIngestionService;
use podfeed::scheduler::{BatchOutcome, SkipReason, UpdateScheduler};
use podfeed::storage::{MemoryStore, PodcastStore, StoredPodcast};

const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
  <channel>
    <title>Weekly Show</title>
    <item>
      <title>Pilot</title>
      <guid>weekly-1</guid>
      <enclosure url="https://cdn.example.com/weekly-1.mp3" type="audio/mpeg" length="10"/>
    </item>
  </channel>
</rss>"#;

struct Fixture {
    server: MockServer,
    store: Arc<MemoryStore>,
    service: Arc<FeedIngestionService>,
}

async fn fixture() -> Fixture {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.xml"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(FeedIngestionService::new(
        Arc::new(FeedFetcher::default()),
        store.clone(),
    ));
    Fixture {
        server,
        store,
        service,
    }
}

async fn import_placeholder(fx: &Fixture, route: &str, auto_update: bool) -> StoredPodcast {
    let podcast = Podcast {
        title: format!("Placeholder {route}"),
        ..Podcast::default()
    };
    fx.service
        .import_podcast(&format!("{}{}", fx.server.uri(), route), podcast, auto_update)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_batch_continues_past_failing_podcast() {
    let fx = fixture().await;
    let a = import_placeholder(&fx, "/a.xml", true).await;
    let b = import_placeholder(&fx, "/b.xml", true).await;

    let scheduler = UpdateScheduler::builder()
        .updater(fx.service.clone())
        .build()
        .unwrap();
    let podcasts = fx.store.list().await.unwrap();

    let BatchOutcome::Completed(report) = scheduler.check_and_update(&podcasts).await else {
        panic!("Expected the first check to run a batch");
    };
    assert_eq!(report.updated, vec![b.id]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, a.id);
    assert!(report.failed[0].1.contains("500"));

    // A is untouched, B carries the feed's content
    assert_eq!(fx.store.load(a.id).await.unwrap(), a);
    let b_after = fx.store.load(b.id).await.unwrap();
    assert_eq!(b_after.podcast.title, "Weekly Show");
    assert_eq!(b_after.podcast.episodes.len(), 1);
    assert!(b_after.last_updated.is_some());

    // The sweep counts as a run even though A failed
    assert_eq!(
        scheduler.check_and_update(&podcasts).await,
        BatchOutcome::Skipped(SkipReason::NotDue)
    );
}

#[tokio::test]
async fn test_manual_update_includes_podcasts_without_auto_update() {
    let fx = fixture().await;
    let b = import_placeholder(&fx, "/b.xml", false).await;

    let scheduler = UpdateScheduler::builder()
        .updater(fx.service.clone())
        .build()
        .unwrap();
    let podcasts = fx.store.list().await.unwrap();

    assert_eq!(
        scheduler.check_and_update(&podcasts).await,
        BatchOutcome::Skipped(SkipReason::NothingToUpdate)
    );

    let outcome = scheduler.trigger_manual_update(&podcasts).await.unwrap();
    let BatchOutcome::Completed(report) = outcome else {
        panic!("Expected the manual trigger to run a batch");
    };
    assert_eq!(report.updated, vec![b.id]);
    assert_eq!(
        fx.store.load(b.id).await.unwrap().podcast.title,
        "Weekly Show"
    );
}
