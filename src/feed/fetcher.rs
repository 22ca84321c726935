//! Conditional fetch of one feed and reconciliation against prior state.

use crate::config::RefreshOptions;
use crate::feed::parser::{parse_feed, ParsedFeed};
use crate::store::{FeedRecord, ItemRecord, Store, StoreError};
use crate::transport::{Transport, TransportError};
use crate::unfurl::UnfurlQueue;
use crate::util::is_http_url;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use reqwest::StatusCode;
use std::collections::HashSet;
use thiserror::Error;

const MAX_FEED_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while fetching and reconciling one feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error or timeout
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// HTTP response that is neither 200 nor 304
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Body could not be parsed as RSS or Atom
    #[error("parse error: {0}")]
    Parse(String),
    /// The feed's own record could not be loaded or saved. Items cannot be
    /// reconciled against an unsaved feed, so this terminates the fetch.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one feed fetch, returned per URL by the orchestrator.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    /// Feed title, when known (parsed this pass or remembered from the
    /// stored record on cache hits).
    pub feed_title: Option<String>,
    /// Items reconciled this pass; zero on cache hits.
    pub items: usize,
    /// True when no body was transferred (HTTP 304 or max-age skip).
    pub cached: bool,
    pub error: Option<String>,
}

impl FetchResult {
    pub(crate) fn ok(url: &str, feed_title: Option<String>, items: usize) -> Self {
        Self {
            url: url.to_string(),
            feed_title,
            items,
            cached: false,
            error: None,
        }
    }

    pub(crate) fn cached(url: &str, feed_title: Option<String>) -> Self {
        Self {
            url: url.to_string(),
            feed_title,
            items: 0,
            cached: true,
            error: None,
        }
    }

    pub(crate) fn failed(url: &str, error: impl ToString) -> Self {
        Self {
            url: url.to_string(),
            feed_title: None,
            items: 0,
            cached: false,
            error: Some(error.to_string()),
        }
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// Fetches one feed URL, reconciles its items, and records the attempt on
/// the stored [`FeedRecord`]. Never panics and never escalates per-item
/// store problems; only a failure to save the feed's own record aborts.
pub async fn fetch_feed(
    store: &dyn Store,
    transport: &Transport,
    queue: Option<&UnfurlQueue>,
    options: &RefreshOptions,
    url: &str,
) -> FetchResult {
    match fetch_inner(store, transport, queue, options, url).await {
        Ok(result) => result,
        Err(err) => {
            record_failure(store, url, &err).await;
            FetchResult::failed(url, &err)
        }
    }
}

async fn fetch_inner(
    store: &dyn Store,
    transport: &Transport,
    queue: Option<&UnfurlQueue>,
    options: &RefreshOptions,
    url: &str,
) -> Result<FetchResult, FetchError> {
    // Absence of a prior record means first fetch, not an error.
    let prior = store.get_feed(url).await?;

    let mut headers = HeaderMap::new();
    if !options.force {
        if let Some(prior) = &prior {
            if let Some(etag) = &prior.etag {
                if let Ok(value) = HeaderValue::from_str(etag) {
                    headers.insert(IF_NONE_MATCH, value);
                }
            }
            if let Some(last_modified) = &prior.last_modified {
                if let Ok(value) = HeaderValue::from_str(last_modified) {
                    headers.insert(IF_MODIFIED_SINCE, value);
                }
            }
        }
    }

    let response = transport
        .get_with_timeout(url, headers, options.timeout())
        .await?;
    let status = response.status();

    if status == StatusCode::NOT_MODIFIED {
        // Body unread. Refresh timestamps; validators and the error counter
        // stay as they are; only a parsed fetch resets failures.
        let mut record = prior.unwrap_or_else(|| FeedRecord::new(url));
        let now = Utc::now();
        record.last_fetched_at = Some(now);
        record.last_success_at = Some(now);
        let title = record.title.clone();
        store.upsert_feed(&record).await?;
        tracing::debug!(feed = %url, "not modified");
        return Ok(FetchResult::cached(url, title));
    }

    if !status.is_success() {
        return Err(FetchError::HttpStatus(status.as_u16()));
    }

    let etag = header_value(response.headers(), "etag");
    let last_modified = header_value(response.headers(), "last-modified");

    let body = transport.read_capped(response, MAX_FEED_BYTES).await?;
    let parsed = parse_feed(&body).map_err(|e| FetchError::Parse(e.to_string()))?;

    reconcile(store, queue, options, url, prior, parsed, etag, last_modified).await
}

/// Header value as an owned string; an empty value (e.g. `ETag: ""` is rare
/// but `ETag:` with nothing does occur) is treated as absent, not malformed.
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

#[allow(clippy::too_many_arguments)]
async fn reconcile(
    store: &dyn Store,
    queue: Option<&UnfurlQueue>,
    options: &RefreshOptions,
    url: &str,
    prior: Option<FeedRecord>,
    parsed: ParsedFeed,
    etag: Option<String>,
    last_modified: Option<String>,
) -> Result<FetchResult, FetchError> {
    let now = Utc::now();

    // Persist the feed header before any item so items always reference a
    // saved feed.
    let mut record = prior.unwrap_or_else(|| FeedRecord::new(url));
    if parsed.title.is_some() {
        record.title = parsed.title.clone();
    }
    if parsed.description.is_some() {
        record.description = parsed.description.clone();
    }
    record.etag = etag;
    record.last_modified = last_modified;
    record.consecutive_failures = 0;
    record.last_error = None;
    record.last_fetched_at = Some(now);
    record.last_success_at = Some(now);
    store.upsert_feed(&record).await?;

    let mut active: HashSet<String> = HashSet::new();
    let mut new_links: Vec<String> = Vec::new();
    let mut latest_new: Option<DateTime<Utc>> = None;
    let mut count = 0usize;

    for item in parsed.items.into_iter().take(options.max_items) {
        let existing_first_seen = match store.item_first_seen(url, &item.guid).await {
            Ok(first_seen) => first_seen,
            Err(e) => {
                tracing::warn!(feed = %url, guid = %item.guid, error = %e, "item lookup failed, skipping");
                active.insert(item.guid);
                continue;
            }
        };
        let is_new = existing_first_seen.is_none();
        let first_seen = existing_first_seen.unwrap_or(now);

        let item_record = ItemRecord {
            feed_url: url.to_string(),
            guid: item.guid,
            title: item.title,
            link: item.link,
            content: item.content,
            summary: item.summary,
            published_at: item.published,
            first_seen_at: first_seen,
            archived: false,
            payload: None,
        };

        if let Err(e) = store.upsert_item(&item_record).await {
            tracing::warn!(feed = %url, guid = %item_record.guid, error = %e, "failed to persist item, skipping");
        }
        active.insert(item_record.guid.clone());
        count += 1;

        if is_new {
            let candidate = item_record.published_at.unwrap_or(first_seen);
            latest_new = Some(latest_new.map_or(candidate, |cur| cur.max(candidate)));
            if let Some(link) = &item_record.link {
                new_links.push(link.clone());
            }
        }
    }

    // Everything not in this fetch's item list becomes archived.
    if let Err(e) = store.archive_items(url, &active).await {
        tracing::warn!(feed = %url, error = %e, "failed to archive absent items");
    }

    // A pass with no newly seen items must not erase the prior value.
    if let Some(latest) = latest_new {
        record.latest_item_at = Some(record.latest_item_at.map_or(latest, |cur| cur.max(latest)));
        store.upsert_feed(&record).await?;
    }

    if let Some(queue) = queue {
        enqueue_new_links(store, queue, url, new_links).await;
    }

    tracing::info!(feed = %url, items = count, "feed reconciled");
    Ok(FetchResult::ok(url, record.title.clone(), count))
}

/// Feeds newly seen item links into the enrichment queue, skipping links
/// that are not absolute http(s) URLs or already have metadata. Enqueue
/// failures (queue closed or canceled) are dropped silently.
async fn enqueue_new_links(
    store: &dyn Store,
    queue: &UnfurlQueue,
    feed_url: &str,
    links: Vec<String>,
) {
    let candidates: Vec<String> = links.into_iter().filter(|l| is_http_url(l)).collect();
    if candidates.is_empty() {
        return;
    }

    let existing = match store.has_metadata_batch(&candidates).await {
        Ok(existing) => existing,
        Err(e) => {
            tracing::warn!(feed = %feed_url, error = %e, "metadata batch lookup failed");
            HashSet::new()
        }
    };

    for link in candidates {
        if !existing.contains(&link) {
            queue.enqueue(link).await;
        }
    }
}

/// Records a failed attempt on the feed's stored record. Fire-and-forget:
/// a store problem here is logged, not escalated.
async fn record_failure(store: &dyn Store, url: &str, err: &FetchError) {
    let mut record = match store.get_feed(url).await {
        Ok(Some(record)) => record,
        Ok(None) => FeedRecord::new(url),
        Err(e) => {
            tracing::warn!(feed = %url, error = %e, "failed to load feed record for error bookkeeping");
            return;
        }
    };

    record.consecutive_failures += 1;
    record.last_error = Some(err.to_string());
    record.last_fetched_at = Some(Utc::now());

    if let Err(e) = store.upsert_feed(&record).await {
        tracing::warn!(feed = %url, error = %e, "failed to record fetch error");
    }
}
