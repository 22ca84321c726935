//! Tuning knobs for the two worker pools.
//!
//! The engine does not read config files itself; callers deserialize these
//! structs from whatever format they use and pass them in. All fields use
//! `#[serde(default)]` so any subset of keys can be specified; missing keys
//! fall back to `Default::default()`.

use serde::Deserialize;
use std::time::Duration;

/// Options for a feed refresh run ([`crate::refresh_feeds`]).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshOptions {
    /// Maximum number of feed fetches in flight at once.
    pub concurrency: usize,

    /// Per-fetch deadline in seconds, covering the request and body read.
    pub timeout_secs: u64,

    /// Maximum number of items reconciled per feed per fetch.
    pub max_items: usize,

    /// Skip feeds fetched within this many seconds, without any network
    /// call. `None` means always fetch (the HTTP conditional-GET machinery
    /// still applies either way).
    pub max_age_secs: Option<u64>,

    /// Ignore stored validators and the max-age skip; refetch everything.
    pub force: bool,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            timeout_secs: 30,
            max_items: 100,
            max_age_secs: None,
            force: false,
        }
    }
}

impl RefreshOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

/// Options for the metadata-enrichment queue ([`crate::UnfurlQueue`]).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UnfurlOptions {
    /// Worker count. Clamped to `[1, 100]` at startup.
    pub concurrency: usize,

    /// Per-page deadline in seconds.
    pub timeout_secs: u64,

    /// Minimum seconds between retries of a URL whose last fetch failed.
    pub retry_after_secs: u64,

    /// Retry immediately, ignoring the retry interval and cached successes.
    pub force: bool,

    /// Page bodies are truncated (silently) at this many bytes.
    pub max_body_bytes: usize,

    /// Interval between aggregate progress log lines.
    pub progress_interval_secs: u64,
}

impl Default for UnfurlOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            timeout_secs: 20,
            retry_after_secs: 3600,
            force: false,
            max_body_bytes: 2 * 1024 * 1024,
            progress_interval_secs: 30,
        }
    }
}

impl UnfurlOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn clamped_concurrency(&self) -> usize {
        self.concurrency.clamp(1, 100)
    }

    /// Job buffer size: twice the worker count, clamped to `[10, 1000]`.
    pub fn buffer_size(&self) -> usize {
        (self.clamped_concurrency() * 2).clamp(10, 1000)
    }

    pub fn retry_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_after_secs as i64)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.max(1))
    }
}
