//! Feed fetching and reconciliation.
//!
//! - [`parser`] - RSS/Atom parsing and GUID normalization on top of `feed-rs`
//! - [`fetcher`] - conditional fetch of one feed plus item reconciliation
//! - [`orchestrator`] - bounded-concurrency refresh across many feeds

pub mod fetcher;
pub mod orchestrator;
pub mod parser;

pub use fetcher::{FetchError, FetchResult};
pub use orchestrator::refresh_feeds;
pub use parser::{normalize_guid, parse_feed, ParsedFeed, ParsedItem};
