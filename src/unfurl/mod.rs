//! Link-preview enrichment.
//!
//! - [`extract`] - OpenGraph/Twitter-card/plain-HTML metadata extraction
//! - [`queue`] - the bounded worker pool draining item-URL jobs

pub mod extract;
pub mod queue;

pub use extract::{extract as extract_metadata, PageMetadata};
pub use queue::{QueueStats, UnfurlQueue};
