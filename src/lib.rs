//! Podcast RSS ingestion: fetch a feed, parse it into a normalized podcast,
//! persist it, and keep auto-updating podcasts fresh on a schedule.
pub mod config;
pub mod feed;
pub mod ingest;
pub mod scheduler;
pub mod storage;
