mod merge;
mod service;

pub use merge::{reconcile, MergeStats};
pub use service::{FeedIngestionService, IngestError};
