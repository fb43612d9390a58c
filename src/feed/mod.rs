//! Podcast feed retrieval and parsing.
//!
//! - [`parser`] - RSS 2.0 + iTunes extension text into a normalized [`Podcast`]
//! - [`fetcher`] - HTTP retrieval of feed text
//! - `xml` - the generic element tree the parser walks
//! - [`types`] - the normalized podcast/episode model
//!
//! # Example
//!
//! ```ignore
//! use podfeed::feed::{parse_feed, FeedFetcher, FeedSource};
//!
//! let text = FeedFetcher::default().fetch_text("https://example.com/feed.xml").await?;
//! let podcast = parse_feed(&text)?;
//! ```

pub mod fetcher;
pub mod parser;
pub mod types;
mod xml;

pub use fetcher::{FeedFetcher, FeedSource, FetchCause, FetchError, DEFAULT_MAX_FEED_SIZE};
pub use parser::{parse_feed, ParseError};
pub use types::{Episode, Owner, Podcast};
pub use xml::XmlError;
