//! Persistence of imported podcasts.
//!
//! The ingestion pipeline only talks to [`PodcastStore`]; [`SqliteStore`] backs
//! the CLI and [`MemoryStore`] backs tests and one-off runs.
mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{PodcastId, PodcastStore, StoreError, StoredPodcast};
