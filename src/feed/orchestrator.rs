//! Parallel refresh of many feeds with bounded concurrency.
//!
//! Fetches run on spawned tasks gated by a semaphore, so at most
//! `concurrency` feeds are in flight. Completion order is nondeterministic;
//! progress logging is not. Each task reports over a channel and a collector
//! buffers out-of-order completions, emitting one progress line per feed in
//! input order. The returned results are in input order too.

use crate::config::RefreshOptions;
use crate::feed::fetcher::{fetch_feed, FetchResult};
use crate::store::Store;
use crate::transport::Transport;
use crate::unfurl::UnfurlQueue;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

/// Refreshes every URL in `urls`, returning one [`FetchResult`] per URL in
/// the same order. Failures are reported in the results, never raised; a
/// run over N feeds always yields N results.
pub async fn refresh_feeds(
    store: Arc<dyn Store>,
    transport: Arc<Transport>,
    queue: Option<UnfurlQueue>,
    options: &RefreshOptions,
    urls: &[String],
) -> Vec<FetchResult> {
    let total = urls.len();
    if total == 0 {
        return Vec::new();
    }

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    // Capacity equals the task count, so sends never block and a slow
    // collector cannot stall a fetch task.
    let (tx, rx) = mpsc::channel::<(usize, FetchResult)>(total);

    let collector = tokio::spawn(collect_in_order(rx, urls.to_vec()));

    for (index, url) in urls.iter().cloned().enumerate() {
        let store = Arc::clone(&store);
        let transport = Arc::clone(&transport);
        let queue = queue.clone();
        let options = options.clone();
        let semaphore = Arc::clone(&semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            // The semaphore is never closed, so acquisition cannot fail.
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };

            let result = match freshness_skip(store.as_ref(), &options, &url).await {
                Some(result) => result,
                None => {
                    fetch_feed(store.as_ref(), &transport, queue.as_ref(), &options, &url).await
                }
            };
            let _ = tx.send((index, result)).await;
        });
    }
    drop(tx);

    let results = match collector.await {
        Ok(results) => results,
        Err(e) => {
            tracing::error!(error = %e, "refresh collector failed");
            return urls
                .iter()
                .map(|url| FetchResult::failed(url, "refresh collector failed"))
                .collect();
        }
    };

    let ok = results
        .iter()
        .filter(|r| !r.is_err() && !r.cached)
        .count();
    let cached = results.iter().filter(|r| r.cached).count();
    let failed = results.iter().filter(|r| r.is_err()).count();
    tracing::info!(total, ok, cached, failed, "refresh complete");

    results
}

/// Receives `(index, result)` pairs and emits progress in ascending index
/// order, buffering completions that arrive ahead of the cursor. A task
/// that panics never reports; its slot is synthesized as a failure once the
/// channel closes.
async fn collect_in_order(
    mut rx: mpsc::Receiver<(usize, FetchResult)>,
    urls: Vec<String>,
) -> Vec<FetchResult> {
    let total = urls.len();
    let mut slots: Vec<Option<FetchResult>> = vec![None; total];
    let mut buffered: BTreeMap<usize, FetchResult> = BTreeMap::new();
    let mut next = 0usize;

    while let Some((index, result)) = rx.recv().await {
        buffered.insert(index, result);
        while let Some(result) = buffered.remove(&next) {
            log_progress(next, total, &result);
            slots[next] = Some(result);
            next += 1;
        }
    }

    for (index, result) in buffered {
        slots[index] = Some(result);
    }
    for (index, slot) in slots.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(FetchResult::failed(&urls[index], "fetch task panicked"));
        }
        if index >= next {
            log_progress(index, total, slot.as_ref().expect("slot just filled"));
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.expect("every slot filled above"))
        .collect()
}

fn log_progress(index: usize, total: usize, result: &FetchResult) {
    let position = index + 1;
    match &result.error {
        Some(error) => {
            tracing::warn!(position, total, feed = %result.url, error = %error, "refresh failed")
        }
        None if result.cached => {
            tracing::info!(position, total, feed = %result.url, "refresh cached")
        }
        None => {
            tracing::info!(position, total, feed = %result.url, items = result.items, "refreshed")
        }
    }
}

/// Synthesizes a cached result without touching the network when the feed
/// was fetched within `max_age`. Store trouble here falls through to a real
/// fetch.
async fn freshness_skip(
    store: &dyn Store,
    options: &RefreshOptions,
    url: &str,
) -> Option<FetchResult> {
    if options.force {
        return None;
    }
    let max_age = options.max_age()?;
    let max_age = chrono::Duration::from_std(max_age).ok()?;

    let record = match store.get_feed(url).await {
        Ok(Some(record)) => record,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(feed = %url, error = %e, "feed lookup failed, fetching anyway");
            return None;
        }
    };

    let last_fetched = record.last_fetched_at?;
    if Utc::now() - last_fetched < max_age {
        tracing::debug!(feed = %url, "fresh, skipping");
        Some(FetchResult::cached(url, record.title))
    } else {
        None
    }
}
