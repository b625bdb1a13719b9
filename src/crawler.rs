//! Crawler (C6, §4.6): a bounded-depth breadth-first crawl starting from a
//! journal's entry point URL, classifying every outlink independently
//! against an extraction regex (enqueue for translation) and a crawl regex
//! (visit at the next depth), within a wall-clock budget for the whole crawl.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::mpsc;

use crate::html;
use crate::item::{DownloadResult, HarvestableItem};
use crate::manager::DownloadManager;
use crate::progress::{ProgressLogger, ProgressState};

/// Per-journal crawl parameters (§3 `SiteDescriptor`, restricted to what the
/// crawler itself needs).
#[derive(Debug, Clone)]
pub struct SiteParams {
    pub start_url: String,
    pub max_depth: u32,
    /// Outlinks matching this are fetched at the next depth (§4.6).
    pub crawl_url_regex: Option<Regex>,
    /// Outlinks matching this are handed to the translation server (§4.6).
    /// A page can match both regexes: it is crawled *and* translated.
    pub extraction_regex: Option<Regex>,
    /// Outlinks matching this are dropped before either of the above (§4.6).
    pub ignore_regex: Option<Regex>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlSummary {
    pub visited: u64,
    pub translated: u64,
    pub failed: u64,
}

/// Runs one bounded crawl to completion (or until its wall-clock budget or
/// depth limit is exhausted), feeding every translation result to
/// `results_tx` for the record pipeline to consume (§4.6, §4.9).
///
/// A single failed page does not abort the crawl (§4.6 "failure counting
/// without aborting"): it's counted and the crawl moves on.
pub async fn run_crawl(
    manager: &DownloadManager,
    item: &HarvestableItem,
    params: &SiteParams,
    results_tx: &mpsc::Sender<Arc<DownloadResult>>,
    progress: &ProgressLogger,
) -> CrawlSummary {
    let deadline = Instant::now() + manager.config().global.per_crawl_time_limit();
    let mut visited = HashSet::new();
    let mut current_depth: VecDeque<String> = VecDeque::new();
    current_depth.push_back(params.start_url.clone());
    let mut depth = 0u32;
    let mut summary = CrawlSummary::default();

    while depth <= params.max_depth && !current_depth.is_empty() {
        if Instant::now() >= deadline {
            tracing::warn!(url = %params.start_url, "crawl wall-clock budget exhausted, stopping early");
            break;
        }

        let mut next_depth: VecDeque<String> = VecDeque::new();

        while let Some(url) = current_depth.pop_front() {
            if Instant::now() >= deadline {
                break;
            }
            if !visited.insert(url.clone()) {
                continue;
            }

            let page_item = HarvestableItem::new(url.clone(), item.journal_id, item.journals.clone());
            let result = manager.direct_download(&page_item).await;
            summary.visited += 1;

            if !result.is_success() {
                summary.failed += 1;
                tracing::debug!(url = %url, error = ?result.error_message, "crawl fetch failed, continuing");
                continue;
            }

            let _ = progress.record(&ProgressState {
                processed_url_count: summary.visited,
                remaining_depth: params.max_depth.saturating_sub(depth),
                last_url: url.clone(),
            });

            let wants_extraction = params.extraction_regex.as_ref().is_none_or(|re| re.is_match(&url));
            if wants_extraction {
                let translated = manager.translate(&page_item, Some(result.response_body.clone()), false).await;
                summary.translated += 1;
                if results_tx.send(translated).await.is_err() {
                    tracing::warn!("record pipeline receiver dropped, stopping crawl early");
                    return summary;
                }
            }

            if depth < params.max_depth {
                enqueue_outlinks(&url, &result.response_body, params, &visited, &mut next_depth);
            }
        }

        current_depth = next_depth;
        depth += 1;
    }

    summary
}

fn enqueue_outlinks(
    page_url: &str,
    body: &str,
    params: &SiteParams,
    visited: &HashSet<String>,
    next_depth: &mut VecDeque<String>,
) {
    let Ok(base) = url::Url::parse(page_url) else { return };
    for href in html::extract_links(body) {
        let Ok(resolved) = base.join(&href) else { continue };
        let resolved = resolved.to_string();

        if params.ignore_regex.as_ref().is_some_and(|re| re.is_match(&resolved)) {
            continue;
        }
        if visited.contains(&resolved) {
            continue;
        }
        if params.crawl_url_regex.as_ref().is_none_or(|re| re.is_match(&resolved)) {
            next_depth.push_back(resolved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::config::Config;
    use crate::delivery::NullDeliveryTracker;
    use crate::delivery::DeliveryTracker;
    use crate::robots::RobotsOracle;
    use crate::fetcher::Fetcher;
    use crate::translation::TranslationClient;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> Config {
        Config::parse("[global]\ntranslation_server_url = \"http://localhost:1969\"\n").unwrap()
    }

    #[tokio::test]
    async fn crawl_follows_matching_links_and_translates_extraction_matches() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/robots.txt")).respond_with(ResponseTemplate::new(404)).mount(&server).await;
        Mock::given(method("GET"))
            .and(path("/index"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"<a href="/article/1">one</a><a href="/other">skip</a>"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/article/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>article body</html>"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"title": "Article"}])))
            .mount(&server)
            .await;

        let config = Arc::new(test_config());
        let robots = Arc::new(RobotsOracle::new(&config.global));
        let fetcher = Fetcher::new("test-agent", robots.clone()).unwrap();
        let cache = Arc::new(ResponseCache::new());
        let translation = TranslationClient::new(fetcher.client().clone(), server.uri(), 4, cache.clone());
        let delivery: Arc<dyn DeliveryTracker> = Arc::new(NullDeliveryTracker);
        let manager = DownloadManager::new(config, fetcher, translation, cache, robots, delivery, crate::maps::TargetPatterns::empty());
        let _dispatcher = manager.spawn_dispatcher();

        let params = SiteParams {
            start_url: format!("{}/index", server.uri()),
            max_depth: 1,
            crawl_url_regex: Some(Regex::new(r"/article/").unwrap()),
            extraction_regex: Some(Regex::new(r"/article/").unwrap()),
            ignore_regex: None,
        };
        let item = HarvestableItem::new(params.start_url.clone(), 0, Arc::new(vec![]));
        let progress = ProgressLogger::new(None);
        let (tx, mut rx) = mpsc::channel(8);

        let summary = run_crawl(&manager, &item, &params, &tx, &progress).await;
        drop(tx);

        assert_eq!(summary.visited, 2);
        assert_eq!(summary.translated, 1);
        assert_eq!(summary.failed, 0);
        let translated = rx.recv().await.unwrap();
        assert!(translated.is_success());
        manager.request_shutdown();
    }

    #[tokio::test]
    async fn no_configured_regex_means_crawl_and_extract_everything() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/robots.txt")).respond_with(ResponseTemplate::new(404)).mount(&server).await;
        Mock::given(method("GET"))
            .and(path("/index"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"<a href="/article/1">one</a>"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/article/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>article body</html>"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"title": "Article"}])))
            .mount(&server)
            .await;

        let config = Arc::new(test_config());
        let robots = Arc::new(RobotsOracle::new(&config.global));
        let fetcher = Fetcher::new("test-agent", robots.clone()).unwrap();
        let cache = Arc::new(ResponseCache::new());
        let translation = TranslationClient::new(fetcher.client().clone(), server.uri(), 4, cache.clone());
        let delivery: Arc<dyn DeliveryTracker> = Arc::new(NullDeliveryTracker);
        let manager = DownloadManager::new(config, fetcher, translation, cache, robots, delivery, crate::maps::TargetPatterns::empty());
        let _dispatcher = manager.spawn_dispatcher();

        let params = SiteParams {
            start_url: format!("{}/index", server.uri()),
            max_depth: 1,
            crawl_url_regex: None,
            extraction_regex: None,
            ignore_regex: None,
        };
        let item = HarvestableItem::new(params.start_url.clone(), 0, Arc::new(vec![]));
        let progress = ProgressLogger::new(None);
        let (tx, mut rx) = mpsc::channel(8);

        let summary = run_crawl(&manager, &item, &params, &tx, &progress).await;
        drop(tx);

        assert_eq!(summary.visited, 2);
        assert_eq!(summary.translated, 2);
        let _ = rx.recv().await.unwrap();
        manager.request_shutdown();
    }
}
