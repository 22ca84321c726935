//! Bounded worker pool enriching item URLs with page metadata.
//!
//! Jobs flow through a bounded channel: enqueuing blocks while the buffer
//! is full, which pushes backpressure from slow enrichment onto feed
//! discovery instead of buffering without bound. Workers share one receiver
//! behind an async mutex and exit when the channel closes or cancellation
//! is signalled. Cancellation is cooperative and checked between jobs; an
//! in-flight HTTP call runs to its own timeout.
//!
//! Lifecycle: [`UnfurlQueue::start`] spawns the pool, [`close`] stops
//! intake, [`wait`] (after close) blocks until the buffer drains, and
//! [`cancel`] abandons buffered jobs and waits for workers to exit.
//!
//! [`close`]: UnfurlQueue::close
//! [`wait`]: UnfurlQueue::wait
//! [`cancel`]: UnfurlQueue::cancel

use crate::config::UnfurlOptions;
use crate::robots::RobotsPolicy;
use crate::store::{Store, UrlMetadataRecord};
use crate::transport::Transport;
use crate::unfurl::extract;
use chrono::Utc;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use url::Url;

/// Longest honored Crawl-delay; hostile values are clamped to this.
const MAX_CRAWL_DELAY: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    cached: AtomicU64,
}

/// Point-in-time snapshot of queue activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs accepted into the buffer.
    pub enqueued: u64,
    /// Jobs taken off the buffer by a worker.
    pub processed: u64,
    /// Jobs that fetched, extracted and persisted metadata.
    pub succeeded: u64,
    /// Jobs that failed (transport, HTTP status, robots denial, store).
    pub failed: u64,
    /// Jobs skipped because a recent failure is not yet retry-eligible.
    pub skipped: u64,
    /// Jobs satisfied by an existing successful record.
    pub cached: u64,
    /// Jobs accepted but not yet taken by a worker.
    pub pending: u64,
}

/// Per-origin fetch pacing for hosts that publish a Crawl-delay.
///
/// Each origin holds the instant its next fetch slot opens. A worker
/// reserves the slot (advancing it by the delay) and then sleeps until it
/// arrives, so concurrent workers hitting one host stay spaced too.
#[derive(Default)]
struct HostPacer {
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl HostPacer {
    async fn pace(&self, url: &str, delay: Duration) {
        let Ok(parsed) = Url::parse(url) else {
            return;
        };
        let origin = parsed.origin().ascii_serialization();

        let wait = {
            let mut slots = self.next_slot.lock().expect("pacer lock poisoned");
            let now = Instant::now();
            let slot = slots.entry(origin).or_insert(now);
            if *slot < now {
                *slot = now;
            }
            let wait = *slot - now;
            *slot += delay;
            wait
        };

        if !wait.is_zero() {
            tracing::debug!(url = %url, wait_ms = wait.as_millis() as u64, "crawl-delay pacing");
            tokio::time::sleep(wait).await;
        }
    }
}

struct Inner {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    cancel: watch::Sender<bool>,
    counters: Counters,
    pacer: HostPacer,
    workers: Mutex<Vec<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running enrichment pool. Cheap to clone; all clones share
/// one pool.
#[derive(Clone)]
pub struct UnfurlQueue {
    inner: Arc<Inner>,
}

impl UnfurlQueue {
    /// Spawns the worker pool and progress ticker.
    pub fn start(
        store: Arc<dyn Store>,
        transport: Arc<Transport>,
        robots: Arc<RobotsPolicy>,
        options: UnfurlOptions,
    ) -> Self {
        let concurrency = options.clamped_concurrency();
        let (tx, rx) = mpsc::channel::<String>(options.buffer_size());
        let (cancel, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            tx: Mutex::new(Some(tx)),
            cancel,
            counters: Counters::default(),
            pacer: HostPacer::default(),
            workers: Mutex::new(Vec::with_capacity(concurrency)),
            ticker: Mutex::new(None),
        });
        let queue = Self { inner };

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let options = Arc::new(options);
        let mut workers = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&queue.inner),
                Arc::clone(&rx),
                Arc::clone(&store),
                Arc::clone(&transport),
                Arc::clone(&robots),
                Arc::clone(&options),
            )));
        }
        *queue.inner.workers.lock().expect("workers lock poisoned") = workers;

        let ticker = tokio::spawn(ticker_loop(
            Arc::clone(&queue.inner),
            options.progress_interval(),
        ));
        *queue.inner.ticker.lock().expect("ticker lock poisoned") = Some(ticker);

        tracing::debug!(workers = concurrency, "unfurl queue started");
        queue
    }

    /// Hands one URL to the pool. Blocks while the buffer is full; drops
    /// the job silently once the queue is closed or canceled.
    pub async fn enqueue(&self, url: impl Into<String>) {
        let sender = {
            let guard = self.inner.tx.lock().expect("sender lock poisoned");
            guard.clone()
        };
        let Some(sender) = sender else {
            return;
        };
        if sender.send(url.into()).await.is_ok() {
            self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stops accepting jobs. In-flight and buffered jobs still run.
    pub fn close(&self) {
        self.inner
            .tx
            .lock()
            .expect("sender lock poisoned")
            .take();
    }

    /// Blocks until every worker has drained and exited. Call after
    /// [`close`](Self::close); with the intake still open this waits
    /// forever.
    pub async fn wait(&self) {
        let workers: Vec<_> = std::mem::take(
            &mut *self.inner.workers.lock().expect("workers lock poisoned"),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "unfurl worker panicked");
            }
        }
        self.stop_ticker();

        let stats = self.stats();
        tracing::info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            cached = stats.cached,
            "unfurl queue drained"
        );
    }

    /// Abandons buffered jobs and waits for workers to exit. Jobs already
    /// past their cancellation check run to completion.
    pub async fn cancel(&self) {
        let _ = self.inner.cancel.send(true);
        self.close();
        self.wait().await;
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.inner.counters;
        let enqueued = c.enqueued.load(Ordering::Relaxed);
        let processed = c.processed.load(Ordering::Relaxed);
        QueueStats {
            enqueued,
            processed,
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            cached: c.cached.load(Ordering::Relaxed),
            pending: enqueued.saturating_sub(processed),
        }
    }

    fn stop_ticker(&self) {
        if let Some(ticker) = self
            .inner
            .ticker
            .lock()
            .expect("ticker lock poisoned")
            .take()
        {
            ticker.abort();
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    inner: Arc<Inner>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    store: Arc<dyn Store>,
    transport: Arc<Transport>,
    robots: Arc<RobotsPolicy>,
    options: Arc<UnfurlOptions>,
) {
    let cancel = inner.cancel.subscribe();
    loop {
        if *cancel.borrow() {
            break;
        }
        let job = rx.lock().await.recv().await;
        let Some(url) = job else {
            break;
        };
        // Cancellation between taking a job and starting it drops the job.
        if *cancel.borrow() {
            break;
        }

        inner.counters.processed.fetch_add(1, Ordering::Relaxed);
        process_job(&inner, &*store, &transport, &robots, &options, &url).await;
    }
    tracing::debug!(worker = worker_id, "unfurl worker exiting");
}

async fn process_job(
    inner: &Inner,
    store: &dyn Store,
    transport: &Transport,
    robots: &RobotsPolicy,
    options: &UnfurlOptions,
    url: &str,
) {
    let counters = &inner.counters;
    let prior = match store.get_metadata(url).await {
        Ok(prior) => prior,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "metadata lookup failed, fetching anyway");
            None
        }
    };

    if !options.force {
        if let Some(prior) = &prior {
            if prior.is_success() {
                counters.cached.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(url = %url, "metadata already present");
                return;
            }
            // Last attempt failed; honor the retry interval.
            if let Some(fetched_at) = prior.fetched_at {
                if Utc::now() - fetched_at < options.retry_after() {
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(url = %url, "failed recently, not yet retryable");
                    return;
                }
            }
        }
    }

    if !robots.is_allowed(url).await {
        let mut record = prior.unwrap_or_else(|| UrlMetadataRecord::new(url));
        record.fetched_at = Some(Utc::now());
        record.status = None;
        record.last_error = Some("disallowed by robots.txt".to_string());
        tracing::debug!(url = %url, "robots policy denied");
        persist(counters, store, &record, false).await;
        return;
    }

    // Rules are cached by the allow check, so this is a lookup, not a
    // second fetch.
    if let Some(delay) = robots.crawl_delay(url).await {
        inner.pacer.pace(url, delay.min(MAX_CRAWL_DELAY)).await;
    }

    let response = match transport
        .get_with_timeout(url, HeaderMap::new(), options.timeout())
        .await
    {
        Ok(response) => response,
        Err(e) => {
            let mut record = prior.unwrap_or_else(|| UrlMetadataRecord::new(url));
            record.fetched_at = Some(Utc::now());
            record.status = None;
            record.last_error = Some(e.to_string());
            persist(counters, store, &record, false).await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let mut record = prior.unwrap_or_else(|| UrlMetadataRecord::new(url));
        record.fetched_at = Some(Utc::now());
        record.status = Some(status.as_u16());
        record.last_error = Some(format!("HTTP status {}", status.as_u16()));
        persist(counters, store, &record, false).await;
        return;
    }

    let body = match transport.read_capped(response, options.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            let mut record = prior.unwrap_or_else(|| UrlMetadataRecord::new(url));
            record.fetched_at = Some(Utc::now());
            record.status = None;
            record.last_error = Some(e.to_string());
            persist(counters, store, &record, false).await;
            return;
        }
    };

    let page = extract::extract(url, &String::from_utf8_lossy(&body));
    let record = UrlMetadataRecord {
        url: url.to_string(),
        title: page.title,
        description: page.description,
        image_url: page.image_url,
        favicon_url: page.favicon_url,
        extra: page.extra,
        fetched_at: Some(Utc::now()),
        status: Some(status.as_u16()),
        last_error: None,
    };
    persist(counters, store, &record, true).await;
}

async fn persist(
    counters: &Counters,
    store: &dyn Store,
    record: &UrlMetadataRecord,
    fetched_ok: bool,
) {
    let saved = match store.upsert_metadata(record).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(url = %record.url, error = %e, "failed to persist metadata");
            false
        }
    };
    if fetched_ok && saved {
        counters.succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(url = %record.url, "metadata stored");
    } else {
        counters.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Periodic aggregate progress line, independent of the workers. Aborted
/// by `wait`/`cancel`.
async fn ticker_loop(inner: Arc<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it
    loop {
        ticker.tick().await;
        let enqueued = inner.counters.enqueued.load(Ordering::Relaxed);
        if enqueued == 0 {
            continue;
        }
        let processed = inner.counters.processed.load(Ordering::Relaxed);
        tracing::info!(
            processed,
            pending = enqueued.saturating_sub(processed),
            "unfurl progress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn page(title: &str) -> String {
        format!("<html><head><title>{title}</title></head><body></body></html>")
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: UnfurlQueue,
    }

    fn fixture(options: UnfurlOptions) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(Transport::new(None, Duration::from_secs(5)).unwrap());
        let robots = Arc::new(RobotsPolicy::new(Arc::clone(&transport), "trawl"));
        let queue = UnfurlQueue::start(
            Arc::clone(&store) as Arc<dyn Store>,
            transport,
            robots,
            options,
        );
        Fixture { store, queue }
    }

    async fn allow_all_robots(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_close_then_wait_processes_all() {
        let mock_server = MockServer::start().await;
        allow_all_robots(&mock_server).await;
        Mock::given(method("GET"))
            .and(path_regex("^/page/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page("P")))
            .mount(&mock_server)
            .await;

        let f = fixture(UnfurlOptions::default());
        let total = 8;
        for i in 0..total {
            f.queue
                .enqueue(format!("{}/page/{i}", mock_server.uri()))
                .await;
        }
        f.queue.close();
        f.queue.wait().await;

        let stats = f.queue.stats();
        assert_eq!(stats.enqueued, total);
        assert_eq!(stats.processed, total);
        assert_eq!(stats.succeeded, total);
        assert_eq!(stats.pending, 0);

        let record = f
            .store
            .get_metadata(&format!("{}/page/0", mock_server.uri()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.title.as_deref(), Some("P"));
        assert_eq!(record.status, Some(200));
    }

    #[tokio::test]
    async fn test_existing_success_not_refetched() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let f = fixture(UnfurlOptions::default());
        let url = format!("{}/done", mock_server.uri());
        let mut prior = UrlMetadataRecord::new(&url);
        prior.status = Some(200);
        prior.fetched_at = Some(Utc::now());
        f.store.upsert_metadata(&prior).await.unwrap();

        f.queue.enqueue(&url).await;
        f.queue.close();
        f.queue.wait().await;

        assert_eq!(f.queue.stats().cached, 1);
    }

    #[tokio::test]
    async fn test_recent_failure_skipped_until_retryable() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let f = fixture(UnfurlOptions::default());
        let url = format!("{}/failed", mock_server.uri());
        let mut prior = UrlMetadataRecord::new(&url);
        prior.status = Some(500);
        prior.fetched_at = Some(Utc::now());
        f.store.upsert_metadata(&prior).await.unwrap();

        f.queue.enqueue(&url).await;
        f.queue.close();
        f.queue.wait().await;

        assert_eq!(f.queue.stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_stale_failure_retried() {
        let mock_server = MockServer::start().await;
        allow_all_robots(&mock_server).await;
        Mock::given(method("GET"))
            .and(path("/failed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page("Recovered")))
            .expect(1)
            .mount(&mock_server)
            .await;

        let f = fixture(UnfurlOptions::default());
        let url = format!("{}/failed", mock_server.uri());
        let mut prior = UrlMetadataRecord::new(&url);
        prior.status = Some(500);
        prior.fetched_at = Some(Utc::now() - chrono::Duration::hours(2));
        f.store.upsert_metadata(&prior).await.unwrap();

        f.queue.enqueue(&url).await;
        f.queue.close();
        f.queue.wait().await;

        assert_eq!(f.queue.stats().succeeded, 1);
        let record = f.store.get_metadata(&url).await.unwrap().unwrap();
        assert_eq!(record.title.as_deref(), Some("Recovered"));
        assert_eq!(record.last_error, None);
    }

    #[tokio::test]
    async fn test_robots_denial_recorded_as_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /blocked\n"),
            )
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/blocked/post"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let f = fixture(UnfurlOptions::default());
        let url = format!("{}/blocked/post", mock_server.uri());
        f.queue.enqueue(&url).await;
        f.queue.close();
        f.queue.wait().await;

        assert_eq!(f.queue.stats().failed, 1);
        let record = f.store.get_metadata(&url).await.unwrap().unwrap();
        assert_eq!(record.status, None);
        assert!(record.last_error.as_deref().unwrap().contains("robots"));
        assert!(!record.is_success());
    }

    #[tokio::test]
    async fn test_crawl_delay_spaces_same_host_fetches() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("User-agent: *\nCrawl-delay: 0.7\n"),
            )
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex("^/page/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page("P")))
            .mount(&mock_server)
            .await;

        let f = fixture(UnfurlOptions::default());
        let started = Instant::now();
        f.queue
            .enqueue(format!("{}/page/1", mock_server.uri()))
            .await;
        f.queue
            .enqueue(format!("{}/page/2", mock_server.uri()))
            .await;
        f.queue.close();
        f.queue.wait().await;

        assert_eq!(f.queue.stats().succeeded, 2);
        // The second fetch of the host must wait out the published delay.
        assert!(
            started.elapsed() >= Duration::from_millis(700),
            "same-host fetches not spaced by crawl-delay: {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_http_error_recorded_with_status() {
        let mock_server = MockServer::start().await;
        allow_all_robots(&mock_server).await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&mock_server)
            .await;

        let f = fixture(UnfurlOptions::default());
        let url = format!("{}/gone", mock_server.uri());
        f.queue.enqueue(&url).await;
        f.queue.close();
        f.queue.wait().await;

        let record = f.store.get_metadata(&url).await.unwrap().unwrap();
        assert_eq!(record.status, Some(410));
        assert!(record.last_error.is_some());
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_dropped() {
        let f = fixture(UnfurlOptions::default());
        f.queue.close();
        f.queue.enqueue("https://example.com/late").await;
        f.queue.wait().await;
        assert_eq!(f.queue.stats().enqueued, 0);
    }

    #[tokio::test]
    async fn test_cancel_abandons_buffered_jobs() {
        let mock_server = MockServer::start().await;
        allow_all_robots(&mock_server).await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(page("slow"))
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&mock_server)
            .await;

        let options = UnfurlOptions {
            concurrency: 1,
            ..Default::default()
        };
        let f = fixture(options);
        for i in 0..6 {
            f.queue.enqueue(format!("{}/slow/{i}", mock_server.uri())).await;
        }
        f.queue.cancel().await;

        let stats = f.queue.stats();
        assert!(stats.processed < stats.enqueued);
    }
}
