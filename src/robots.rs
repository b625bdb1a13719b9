//! Robots & Delay Oracle (C2, §4.2): parses `robots.txt`, answers *may
//! fetch?*, and derives the per-host minimum inter-request delay.
//!
//! The actual allow/disallow matching is delegated to the `robotstxt` crate
//! (the same dependency the teacher crate uses), which already implements the
//! googlebot-spec path canonicalization (`%2F`-preserving percent-decoding,
//! longest/first-matching-prefix). This module adds what that crate does not:
//! crawl-delay extraction and clamping, and a small bounded per-host cache
//! that clears itself when full rather than tracking per-entry recency (§4.2:
//! "a design decision preferring simplicity over LRU accuracy").

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use robotstxt::DefaultMatcher;
use tokio::sync::RwLock;

use crate::config::GlobalConfig;
use crate::error::HarvestError;

#[derive(Debug, Clone)]
struct RobotsEntry {
    body: String,
    crawl_delay: Option<Duration>,
    fetched_at: Instant,
}

/// Per-host delay parameters (§3 `DelayParams`).
#[derive(Debug, Clone, Copy)]
pub struct DelayParams {
    pub min_interval: Duration,
}

impl DelayParams {
    fn clamp(raw: Duration, default_min: Duration, configured_max: Duration) -> Duration {
        raw.clamp(default_min, configured_max.max(default_min))
    }
}

/// Thread-safe, bounded cache of parsed `robots.txt` documents, one per host.
pub struct RobotsOracle {
    user_agent: String,
    ignore_robots: bool,
    default_delay: Duration,
    max_delay: Duration,
    max_cache_entries: usize,
    cache: RwLock<IndexMap<String, Arc<RobotsEntry>>>,
}

impl RobotsOracle {
    pub fn new(global: &GlobalConfig) -> Self {
        Self {
            user_agent: global.user_agent.clone(),
            ignore_robots: global.ignore_robots_dot_txt,
            default_delay: global.default_download_delay(),
            max_delay: global.max_download_delay(),
            max_cache_entries: 10_000,
            cache: RwLock::new(IndexMap::new()),
        }
    }

    pub fn ignore_robots(&self) -> bool {
        self.ignore_robots
    }

    /// Registers a `robots.txt` body for `host`, fetched by the caller (the
    /// download manager does the actual HTTP GET when a domain is first
    /// seen, per §4.8; this oracle only parses and caches).
    pub async fn register(&self, host: &str, body: String) {
        let crawl_delay = extract_crawl_delay(&body, &self.user_agent);
        let entry = Arc::new(RobotsEntry {
            body,
            crawl_delay,
            fetched_at: Instant::now(),
        });

        let mut cache = self.cache.write().await;
        if cache.len() >= self.max_cache_entries && !cache.contains_key(host) {
            tracing::warn!(max = self.max_cache_entries, "robots.txt cache full, clearing en bloc");
            cache.clear();
        }
        cache.insert(host.to_string(), entry);
    }

    pub async fn has_host(&self, host: &str) -> bool {
        self.cache.read().await.contains_key(host)
    }

    /// May the configured user agent fetch `path` on `host`? Unknown hosts
    /// (robots.txt never registered, or the fetch failed) default to allow,
    /// matching the Fetcher's "no robots info ⇒ proceed" fallback.
    pub async fn may_fetch(&self, host: &str, path: &str) -> bool {
        if self.ignore_robots {
            return true;
        }
        if path == "/robots.txt" {
            return true;
        }
        let cache = self.cache.read().await;
        match cache.get(host) {
            Some(entry) => {
                DefaultMatcher::default().one_agent_allowed_by_robots(&entry.body, &self.user_agent, path)
            }
            None => true,
        }
    }

    /// The effective minimum inter-request delay for `host` (§3 `DelayParams`
    /// derivation): `clamp(robots_crawl_delay, default_min, configured_max)`.
    pub async fn delay_for(&self, host: &str, override_delay: Option<Duration>) -> DelayParams {
        if let Some(forced) = override_delay {
            return DelayParams {
                min_interval: DelayParams::clamp(forced, self.default_delay, self.max_delay),
            };
        }
        let cache = self.cache.read().await;
        let raw = cache
            .get(host)
            .and_then(|entry| entry.crawl_delay)
            .unwrap_or(self.default_delay);
        DelayParams {
            min_interval: DelayParams::clamp(raw, self.default_delay, self.max_delay),
        }
    }

    /// Fetches `robots.txt` for `host` with the given HTTP client and
    /// registers it. A fetch failure is not fatal: the host is treated as
    /// having no restrictions, matching common crawler practice.
    pub async fn fetch_and_register(&self, client: &reqwest::Client, scheme: &str, host: &str) -> Result<(), HarvestError> {
        let url = format!("{scheme}://{host}/robots.txt");
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let body = response.text().await.unwrap_or_default();
                self.register(host, body).await;
            }
            Ok(response) => {
                tracing::debug!(host, status = %response.status(), "robots.txt not available, allowing all");
                self.register(host, String::new()).await;
            }
            Err(err) => {
                tracing::debug!(host, error = %err, "failed to fetch robots.txt, allowing all");
                self.register(host, String::new()).await;
            }
        }
        Ok(())
    }
}

/// Scans a `robots.txt` body for the first `Crawl-delay` directive that
/// applies to `user_agent`: either inside that UA's own group, or the `*`
/// group if no specific group matched. This mirrors the informal standard's
/// "first matching group wins" rule without building a full rule-set parser
/// on top of what `robotstxt` already parses internally for path matching.
fn extract_crawl_delay(body: &str, user_agent: &str) -> Option<Duration> {
    let mut current_is_specific_match = false;
    let mut current_is_wildcard = false;
    let mut specific_delay: Option<u64> = None;
    let mut wildcard_delay: Option<u64> = None;

    for raw_line in body.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((directive, value)) = line.split_once(':') else {
            continue;
        };
        let directive = directive.trim().to_ascii_lowercase();
        let value = value.trim();

        match directive.as_str() {
            "user-agent" => {
                current_is_wildcard = value == "*";
                current_is_specific_match =
                    !current_is_wildcard && user_agent.to_ascii_lowercase().starts_with(&value.to_ascii_lowercase());
            }
            "crawl-delay" => {
                if let Ok(seconds) = value.parse::<f64>() {
                    let ms = (seconds * 1000.0) as u64;
                    if current_is_specific_match {
                        specific_delay.get_or_insert(ms);
                    } else if current_is_wildcard {
                        wildcard_delay.get_or_insert(ms);
                    }
                }
            }
            _ => {}
        }
    }

    specific_delay.or(wildcard_delay).map(Duration::from_millis)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle(default_ms: u64, max_ms: u64) -> RobotsOracle {
        RobotsOracle {
            user_agent: "zts_harvester".into(),
            ignore_robots: false,
            default_delay: Duration::from_millis(default_ms),
            max_delay: Duration::from_millis(max_ms),
            max_cache_entries: 10,
            cache: RwLock::new(IndexMap::new()),
        }
    }

    #[tokio::test]
    async fn robots_forbids_root_denies_everything() {
        let oracle = oracle(1000, 5000);
        oracle.register("example.org", "User-agent: *\nDisallow: /\n".to_string()).await;
        assert!(!oracle.may_fetch("example.org", "/page").await);
        assert!(oracle.may_fetch("example.org", "/robots.txt").await);
    }

    #[tokio::test]
    async fn crawl_delay_is_clamped_between_default_and_max() {
        let oracle = oracle(1000, 5000);
        oracle
            .register("example.org", "User-agent: *\nCrawl-delay: 2\n".to_string())
            .await;
        let delay = oracle.delay_for("example.org", None).await;
        assert_eq!(delay.min_interval, Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn crawl_delay_below_default_is_raised() {
        let oracle = oracle(1000, 5000);
        oracle
            .register("example.org", "User-agent: *\nCrawl-delay: 0\n".to_string())
            .await;
        let delay = oracle.delay_for("example.org", None).await;
        assert_eq!(delay.min_interval, Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn crawl_delay_above_max_is_lowered() {
        let oracle = oracle(1000, 5000);
        oracle
            .register("example.org", "User-agent: *\nCrawl-delay: 30\n".to_string())
            .await;
        let delay = oracle.delay_for("example.org", None).await;
        assert_eq!(delay.min_interval, Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn unknown_host_defaults_to_allow() {
        let oracle = oracle(1000, 5000);
        assert!(oracle.may_fetch("never-seen.example", "/anything").await);
    }

    #[tokio::test]
    async fn ignore_robots_flag_allows_everything() {
        let mut oracle = oracle(1000, 5000);
        oracle.ignore_robots = true;
        oracle
            .register("example.org", "User-agent: *\nDisallow: /\n".to_string())
            .await;
        assert!(oracle.may_fetch("example.org", "/page").await);
    }
}
