//! Download Manager (C8, §4.8): the scheduler that turns direct-download and
//! translation requests into rate-limited, per-host, coalesced tasklets, and
//! gates the four coarser task kinds (crawl, RSS, API query, email crawl)
//! behind their own concurrency caps.
//!
//! Per-domain FIFO ordering and the robots.txt delay gate apply to the two
//! download kinds (§4.8's `queued_direct_downloads_*`); crawl/RSS/API/email
//! tasks drive the same two download kinds internally, so the domain gate is
//! still enforced, just one layer down. Each coarser kind gets its own
//! `Semaphore` (§4.8 `MAX_CRAWLING_TASKLETS` and friends) instead of a second
//! per-domain queue, which would duplicate delay bookkeeping the download
//! kinds already do.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::cache::{InFlightRegistry, ResponseCache};
use crate::config::Config;
use crate::delivery::DeliveryTracker;
use crate::error::HarvestError;
use crate::fetcher::{FetchRequest, Fetcher};
use crate::item::{DownloadResult, HarvestableItem, Operation, ResultFlags};
use crate::maps::TargetPatterns;
use crate::translation::{TranslationClient, TranslationOutcome};

struct PendingFetch {
    item: HarvestableItem,
    op: Operation,
    cached_html: Option<String>,
    sender: broadcast::Sender<Arc<DownloadResult>>,
}

struct DomainQueue {
    next_allowed_at: Instant,
    min_interval: Duration,
    direct_query: VecDeque<PendingFetch>,
    translation: VecDeque<PendingFetch>,
}

impl DomainQueue {
    fn new(min_interval: Duration) -> Self {
        Self {
            next_allowed_at: Instant::now(),
            min_interval,
            direct_query: VecDeque::new(),
            translation: VecDeque::new(),
        }
    }
}

struct ManagerInner {
    config: Arc<Config>,
    fetcher: Fetcher,
    translation: TranslationClient,
    cache: Arc<ResponseCache>,
    inflight: InFlightRegistry,
    robots: Arc<crate::robots::RobotsOracle>,
    delivery: Arc<dyn DeliveryTracker>,
    target_patterns: TargetPatterns,
    incoming: Mutex<Vec<(String, String, PendingFetch)>>,
    domains: Mutex<IndexMap<String, DomainQueue>>,
    fetch_permits: Arc<Semaphore>,
    crawl_permits: Arc<Semaphore>,
    rss_permits: Arc<Semaphore>,
    api_permits: Arc<Semaphore>,
    email_permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: AtomicBool,
}

/// A cheaply cloneable handle onto the scheduler; every component that needs
/// to fetch or translate something holds one of these (§4.8).
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl Clone for DownloadManager {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl DownloadManager {
    pub fn new(
        config: Arc<Config>,
        fetcher: Fetcher,
        translation: TranslationClient,
        cache: Arc<ResponseCache>,
        robots: Arc<crate::robots::RobotsOracle>,
        delivery: Arc<dyn DeliveryTracker>,
        target_patterns: TargetPatterns,
    ) -> Self {
        let limits = config.global.concurrency.clone();
        let inner = Arc::new(ManagerInner {
            fetch_permits: Arc::new(Semaphore::new(limits.max_direct_download_tasklets)),
            crawl_permits: Arc::new(Semaphore::new(limits.max_crawling_tasklets)),
            rss_permits: Arc::new(Semaphore::new(limits.max_rss_tasklets)),
            api_permits: Arc::new(Semaphore::new(limits.max_apiquery_tasklets)),
            email_permits: Arc::new(Semaphore::new(limits.max_emailcrawl_tasklets)),
            config,
            fetcher,
            translation,
            cache,
            inflight: InFlightRegistry::new(),
            robots,
            delivery,
            target_patterns,
            incoming: Mutex::new(Vec::new()),
            domains: Mutex::new(IndexMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            shutdown: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Spawns the background dispatch loop (~32ms cadence, §4.8). The caller
    /// owns the returned handle and should abort or await it at shutdown.
    pub fn spawn_dispatcher(&self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(dispatch_loop(self.inner.clone()))
    }

    pub fn request_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// `directQuery(item) → DownloadResult` (§4.8).
    pub async fn direct_download(&self, item: &HarvestableItem) -> Arc<DownloadResult> {
        self.schedule(item, Operation::DirectQuery, None, false).await
    }

    /// `useTranslationServer(item, cached_html, force) → DownloadResult` (§4.8).
    pub async fn translate(&self, item: &HarvestableItem, cached_html: Option<String>, force: bool) -> Arc<DownloadResult> {
        self.schedule(item, Operation::UseTranslationServer, cached_html, force).await
    }

    async fn schedule(&self, item: &HarvestableItem, op: Operation, cached_html: Option<String>, force: bool) -> Arc<DownloadResult> {
        if op == Operation::UseTranslationServer && !self.inner.target_patterns.is_supported(&item.url) {
            return Arc::new(DownloadResult {
                url: item.url.clone(),
                operation: op,
                response_body: String::new(),
                response_headers: Vec::new(),
                response_code: 0,
                error_message: Some(HarvestError::UnsupportedUrl.to_string()),
                flags: ResultFlags::empty(),
            });
        }

        if let Some(body) = self.inner.cache.lookup(&item.url, op).await {
            return Arc::new(DownloadResult {
                url: item.url.clone(),
                operation: op,
                response_body: body,
                response_headers: Vec::new(),
                response_code: 200,
                error_message: None,
                flags: ResultFlags::FROM_CACHE,
            });
        }

        if op == Operation::UseTranslationServer
            && !force
            && self.inner.delivery.already_delivered(&item.url, &HashSet::new()).await
        {
            return Arc::new(DownloadResult {
                url: item.url.clone(),
                operation: op,
                response_body: String::new(),
                response_headers: Vec::new(),
                response_code: 0,
                error_message: Some("item already delivered".into()),
                flags: ResultFlags::ITEM_ALREADY_DELIVERED,
            });
        }

        let mut receiver = match self.inner.inflight.join_or_register(&item.url, op).await {
            Ok(rx) => rx,
            Err(sender) => {
                let Ok(parsed) = url::Url::parse(&item.url) else {
                    let result = Arc::new(DownloadResult {
                        url: item.url.clone(),
                        operation: op,
                        response_body: String::new(),
                        response_headers: Vec::new(),
                        response_code: 0,
                        error_message: Some("invalid URL".into()),
                        flags: ResultFlags::empty(),
                    });
                    self.inner.inflight.complete(&item.url, op, result.clone(), sender).await;
                    return result;
                };
                let host = parsed.host_str().unwrap_or_default().to_string();
                let scheme = parsed.scheme().to_string();
                let pf = PendingFetch {
                    item: item.clone(),
                    op,
                    cached_html,
                    sender: sender.clone(),
                };
                self.inner.incoming.lock().await.push((scheme, host, pf));
                sender.subscribe()
            }
        };
        receiver.recv().await.expect("tasklet sender dropped without completing")
    }

    /// `searchMultiple(ids) → TranslationResult` (§4.5, §4.8), bypassing the
    /// per-domain queue: identifiers don't belong to a single host the way a
    /// URL does, so there's nothing meaningful to rate-limit by domain here.
    pub async fn search_multiple(
        &self,
        ids: &IndexMap<String, u64>,
        delivery: &dyn DeliveryTracker,
        time_limit: Duration,
    ) -> Result<TranslationOutcome, HarvestError> {
        let _permit = self.inner.fetch_permits.acquire().await.expect("semaphore closed");
        self.inner.translation.search_multiple(ids, delivery, time_limit).await
    }

    pub async fn run_crawl_guarded<T>(&self, fut: impl Future<Output = T>) -> T {
        let _permit = self.inner.crawl_permits.acquire().await.expect("semaphore closed");
        fut.await
    }

    pub async fn run_rss_guarded<T>(&self, fut: impl Future<Output = T>) -> T {
        let _permit = self.inner.rss_permits.acquire().await.expect("semaphore closed");
        fut.await
    }

    pub async fn run_apiquery_guarded<T>(&self, fut: impl Future<Output = T>) -> T {
        let _permit = self.inner.api_permits.acquire().await.expect("semaphore closed");
        fut.await
    }

    pub async fn run_emailcrawl_guarded<T>(&self, fut: impl Future<Output = T>) -> T {
        let _permit = self.inner.email_permits.acquire().await.expect("semaphore closed");
        fut.await
    }
}

async fn dispatch_loop(inner: Arc<ManagerInner>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(32));
    loop {
        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }
        drain_incoming(&inner).await;
        dispatch_domains(&inner).await;
        reap(&inner).await;
        ticker.tick().await;
    }
}

async fn drain_incoming(inner: &Arc<ManagerInner>) {
    let batch: Vec<_> = {
        let mut incoming = inner.incoming.lock().await;
        std::mem::take(&mut *incoming)
    };
    for (scheme, host, pf) in batch {
        ensure_domain(inner, &scheme, &host).await;
        let mut domains = inner.domains.lock().await;
        let domain = domains.get_mut(&host).expect("domain just ensured");
        match pf.op {
            Operation::DirectQuery => domain.direct_query.push_back(pf),
            Operation::UseTranslationServer => domain.translation.push_back(pf),
        }
    }
}

/// Creates per-host state on first sight, which entails a one-time
/// synchronous `robots.txt` fetch for that host (§4.8).
async fn ensure_domain(inner: &Arc<ManagerInner>, scheme: &str, host: &str) {
    {
        let domains = inner.domains.lock().await;
        if domains.contains_key(host) {
            return;
        }
    }
    if !inner.robots.has_host(host).await {
        let _ = inner.robots.fetch_and_register(inner.fetcher.client(), scheme, host).await;
    }
    let delay = inner.robots.delay_for(host, inner.config.delay_override_for_host(host)).await;
    let mut domains = inner.domains.lock().await;
    domains.entry(host.to_string()).or_insert_with(|| DomainQueue::new(delay.min_interval));
}

/// One pass over every known domain: honours the delay gate, then dispatches
/// at most one tasklet per domain per tick, direct-query before translation
/// (§4.8 priority order).
async fn dispatch_domains(inner: &Arc<ManagerInner>) {
    let now = Instant::now();
    let mut domains = inner.domains.lock().await;
    for domain in domains.values_mut() {
        if now < domain.next_allowed_at {
            continue;
        }
        let Some(pf) = domain.direct_query.pop_front().or_else(|| domain.translation.pop_front()) else {
            continue;
        };
        let Ok(permit) = inner.fetch_permits.clone().try_acquire_owned() else {
            match pf.op {
                Operation::DirectQuery => domain.direct_query.push_front(pf),
                Operation::UseTranslationServer => domain.translation.push_front(pf),
            }
            continue;
        };
        domain.next_allowed_at = now + domain.min_interval;
        let inner2 = inner.clone();
        inner.tasks.lock().await.spawn(async move {
            execute_fetch(inner2, pf).await;
            drop(permit);
        });
    }
}

async fn reap(inner: &Arc<ManagerInner>) {
    let mut tasks = inner.tasks.lock().await;
    while let Some(outcome) = tasks.try_join_next() {
        if let Err(err) = outcome {
            tracing::warn!(error = %err, "tasklet panicked");
        }
    }
}

async fn execute_fetch(inner: Arc<ManagerInner>, pf: PendingFetch) {
    let result = match pf.op {
        Operation::DirectQuery => perform_direct_fetch(&inner, &pf.item).await,
        Operation::UseTranslationServer => perform_translation(&inner, &pf.item, pf.cached_html.as_deref()).await,
    };
    let result = Arc::new(result);
    if result.is_success() {
        inner.cache.insert(&pf.item.url, pf.op, result.response_body.clone()).await;
    }
    inner.inflight.complete(&pf.item.url, pf.op, result, pf.sender).await;
}

async fn perform_direct_fetch(inner: &ManagerInner, item: &HarvestableItem) -> DownloadResult {
    let request = FetchRequest::get(item.url.clone(), inner.config.global.per_request_time_limit());
    let mut backoff = Duration::from_millis(250);
    let mut last_err = None;
    for attempt in 0..3 {
        match inner.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                return DownloadResult {
                    url: item.url.clone(),
                    operation: Operation::DirectQuery,
                    response_body: response.body,
                    response_headers: response.headers,
                    response_code: response.response_code,
                    error_message: None,
                    flags: ResultFlags::empty(),
                };
            }
            Err(err) => {
                let transient = err.is_transient();
                last_err = Some(err);
                if !transient || attempt == 2 {
                    break;
                }
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
    error_to_result(&item.url, Operation::DirectQuery, last_err.expect("loop always sets this on non-success exit"))
}

async fn perform_translation(inner: &ManagerInner, item: &HarvestableItem, cached_html: Option<&str>) -> DownloadResult {
    let time_limit = inner.config.global.per_request_time_limit();
    match inner.translation.web(&item.url, cached_html, time_limit).await {
        Ok(TranslationOutcome::SingleBatch(citations)) | Ok(TranslationOutcome::MultiBatch(citations)) => DownloadResult {
            url: item.url.clone(),
            operation: Operation::UseTranslationServer,
            response_body: serde_json::to_string(&citations).unwrap_or_else(|_| "[]".to_string()),
            response_headers: Vec::new(),
            response_code: 200,
            error_message: None,
            flags: ResultFlags::empty(),
        },
        Ok(TranslationOutcome::Skipped) => DownloadResult {
            url: item.url.clone(),
            operation: Operation::UseTranslationServer,
            response_body: "[]".into(),
            response_headers: Vec::new(),
            response_code: 204,
            error_message: Some("no translator available for this page".into()),
            flags: ResultFlags::empty(),
        },
        Ok(TranslationOutcome::Empty) => DownloadResult {
            url: item.url.clone(),
            operation: Operation::UseTranslationServer,
            response_body: "[]".into(),
            response_headers: Vec::new(),
            response_code: 204,
            error_message: None,
            flags: ResultFlags::empty(),
        },
        Err(err) => error_to_result(&item.url, Operation::UseTranslationServer, err),
    }
}

fn error_to_result(url: &str, op: Operation, err: HarvestError) -> DownloadResult {
    let code = match &err {
        HarvestError::HttpStatus(status) => *status,
        HarvestError::Timeout(_) => 504,
        HarvestError::ConnectionRefused(_) | HarvestError::DnsFailure(_) => 502,
        HarvestError::DeniedByRobots => 403,
        HarvestError::TranslationServerBusy => 503,
        HarvestError::TranslationError => 500,
        _ => 500,
    };
    DownloadResult {
        url: url.to_string(),
        operation: op,
        response_body: String::new(),
        response_headers: Vec::new(),
        response_code: code,
        error_message: Some(err.to_string()),
        flags: ResultFlags::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::NullDeliveryTracker;
    use crate::robots::RobotsOracle;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> Config {
        Config::parse("[global]\ntranslation_server_url = \"http://localhost:1969\"\n").unwrap()
    }

    #[tokio::test]
    async fn cached_entry_short_circuits_without_a_dispatcher() {
        let config = Arc::new(test_config());
        let robots = Arc::new(RobotsOracle::new(&config.global));
        let fetcher = Fetcher::new("test-agent", robots.clone()).unwrap();
        let cache = Arc::new(ResponseCache::new());
        cache.insert("https://example.org/a", Operation::DirectQuery, "cached-body".into()).await;
        let translation = TranslationClient::new(fetcher.client().clone(), "http://localhost:1969", 1, cache.clone());
        let delivery: Arc<dyn DeliveryTracker> = Arc::new(NullDeliveryTracker);
        let manager = DownloadManager::new(config, fetcher, translation, cache, robots, delivery, TargetPatterns::empty());

        let item = HarvestableItem::new("https://example.org/a", 0, Arc::new(vec![]));
        let result = manager.direct_download(&item).await;
        assert!(result.from_cache());
        assert_eq!(result.response_body, "cached-body");
    }

    #[tokio::test]
    async fn already_delivered_short_circuits_translation() {
        struct AlwaysDelivered;
        #[async_trait::async_trait]
        impl DeliveryTracker for AlwaysDelivered {
            async fn already_delivered(&self, _url: &str, _ignore: &HashSet<String>) -> bool {
                true
            }
            async fn record(&self, _url: &str, _state: &str) {}
        }

        let config = Arc::new(test_config());
        let robots = Arc::new(RobotsOracle::new(&config.global));
        let fetcher = Fetcher::new("test-agent", robots.clone()).unwrap();
        let cache = Arc::new(ResponseCache::new());
        let translation = TranslationClient::new(fetcher.client().clone(), "http://localhost:1969", 1, cache.clone());
        let delivery: Arc<dyn DeliveryTracker> = Arc::new(AlwaysDelivered);
        let manager = DownloadManager::new(config, fetcher, translation, cache, robots, delivery, TargetPatterns::empty());

        let item = HarvestableItem::new("https://example.org/a", 0, Arc::new(vec![]));
        let result = manager.translate(&item, None, false).await;
        assert!(result.flags.contains(ResultFlags::ITEM_ALREADY_DELIVERED));
    }

    #[tokio::test]
    async fn direct_download_runs_through_the_domain_queue() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/robots.txt")).respond_with(ResponseTemplate::new(404)).mount(&server).await;
        Mock::given(method("GET")).and(path("/ok")).respond_with(ResponseTemplate::new(200).set_body_string("hello")).mount(&server).await;

        let config = Arc::new(test_config());
        let robots = Arc::new(RobotsOracle::new(&config.global));
        let fetcher = Fetcher::new("test-agent", robots.clone()).unwrap();
        let cache = Arc::new(ResponseCache::new());
        let translation = TranslationClient::new(fetcher.client().clone(), "http://localhost:1969", 1, cache.clone());
        let delivery: Arc<dyn DeliveryTracker> = Arc::new(NullDeliveryTracker);
        let manager = DownloadManager::new(config, fetcher, translation, cache, robots, delivery, TargetPatterns::empty());
        let _dispatcher = manager.spawn_dispatcher();

        let item = HarvestableItem::new(format!("{}/ok", server.uri()), 0, Arc::new(vec![]));
        let result = manager.direct_download(&item).await;
        assert!(result.is_success());
        assert_eq!(result.response_body, "hello");
        manager.request_shutdown();
    }

    #[tokio::test]
    async fn url_outside_target_patterns_is_rejected_before_translation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("targets.regex"), "^https://allowed\\.example/.*$\n").unwrap();
        let patterns = crate::maps::TargetPatterns::load(dir.path()).unwrap();

        let config = Arc::new(test_config());
        let robots = Arc::new(RobotsOracle::new(&config.global));
        let fetcher = Fetcher::new("test-agent", robots.clone()).unwrap();
        let cache = Arc::new(ResponseCache::new());
        let translation = TranslationClient::new(fetcher.client().clone(), "http://localhost:1969", 1, cache.clone());
        let delivery: Arc<dyn DeliveryTracker> = Arc::new(NullDeliveryTracker);
        let manager = DownloadManager::new(config, fetcher, translation, cache, robots, delivery, patterns);

        let item = HarvestableItem::new("https://example.org/a", 0, Arc::new(vec![]));
        let result = manager.translate(&item, None, false).await;
        assert!(!result.is_success());
        assert!(result.error_message.as_deref().unwrap_or("").contains("target pattern"));
    }

    #[tokio::test]
    async fn target_patterns_do_not_block_direct_downloads() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/robots.txt")).respond_with(ResponseTemplate::new(404)).mount(&server).await;
        Mock::given(method("GET")).and(path("/index")).respond_with(ResponseTemplate::new(200).set_body_string("hi")).mount(&server).await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("targets.regex"), "^https://allowed\\.example/.*$\n").unwrap();
        let patterns = crate::maps::TargetPatterns::load(dir.path()).unwrap();

        let config = Arc::new(test_config());
        let robots = Arc::new(RobotsOracle::new(&config.global));
        let fetcher = Fetcher::new("test-agent", robots.clone()).unwrap();
        let cache = Arc::new(ResponseCache::new());
        let translation = TranslationClient::new(fetcher.client().clone(), "http://localhost:1969", 1, cache.clone());
        let delivery: Arc<dyn DeliveryTracker> = Arc::new(NullDeliveryTracker);
        let manager = DownloadManager::new(config, fetcher, translation, cache, robots, delivery, patterns);
        let _dispatcher = manager.spawn_dispatcher();

        let item = HarvestableItem::new(format!("{}/index", server.uri()), 0, Arc::new(vec![]));
        let result = manager.direct_download(&item).await;
        assert!(result.is_success());
        manager.request_shutdown();
    }
}
