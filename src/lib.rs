//! Ingestion engine for a feed aggregator.
//!
//! `trawl` pulls RSS/Atom feeds from many independent servers, reconciles
//! their items against prior state, and enriches newly discovered item
//! links with page metadata while respecting per-site crawl policy.
//!
//! # Architecture
//!
//! Two bounded worker pools connected one way by a job queue:
//!
//! - [`refresh_feeds`] drains a feed-URL list through the [`feed`] fetcher
//!   with at most `concurrency` fetches in flight, reporting progress in
//!   submission order.
//! - [`UnfurlQueue`] drains item-URL jobs fed by the fetcher, gated by the
//!   [`RobotsPolicy`], extracting preview metadata per page.
//!
//! Durable storage is the caller's problem: both pools talk to a
//! [`Store`] trait object. [`MemoryStore`] is provided for tests and
//! small embedders.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use trawl::{
//!     refresh_feeds, MemoryStore, RefreshOptions, RobotsPolicy, Store,
//!     Transport, UnfurlOptions, UnfurlQueue,
//! };
//!
//! let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
//! let transport = Arc::new(Transport::new(None, std::time::Duration::from_secs(30))?);
//! let robots = Arc::new(RobotsPolicy::new(Arc::clone(&transport), "trawl"));
//!
//! let queue = UnfurlQueue::start(
//!     Arc::clone(&store),
//!     Arc::clone(&transport),
//!     robots,
//!     UnfurlOptions::default(),
//! );
//!
//! let results = refresh_feeds(
//!     Arc::clone(&store),
//!     transport,
//!     Some(queue.clone()),
//!     &RefreshOptions::default(),
//!     &urls,
//! )
//! .await;
//!
//! queue.close();
//! queue.wait().await;
//! ```

pub mod config;
pub mod feed;
pub mod robots;
pub mod store;
pub mod transport;
pub mod unfurl;
pub mod util;

pub use config::{RefreshOptions, UnfurlOptions};
pub use feed::{refresh_feeds, FetchError, FetchResult};
pub use robots::RobotsPolicy;
pub use store::{
    FeedRecord, ItemRecord, MemoryStore, Store, StoreError, UrlMetadataRecord,
};
pub use transport::{Transport, TransportError};
pub use unfurl::{PageMetadata, QueueStats, UnfurlQueue};
