//! RSS Processor (C7, §4.7): parses a journal's RSS/Atom feed and enqueues a
//! translation task for every item link not already delivered.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::delivery::DeliveryTracker;
use crate::item::{DownloadResult, HarvestableItem};
use crate::manager::DownloadManager;

#[derive(Debug, Clone, Copy, Default)]
pub struct RssSummary {
    pub queued: u64,
    pub skipped_already_delivered: u64,
    pub failed: u64,
}

/// One feed entry worth tracking downstream: link plus whatever publication
/// date the feed carried, used for provenance rather than ordering (§4.7).
#[derive(Debug, Clone)]
pub struct FeedEntry {
    pub link: String,
    pub published: Option<DateTime<Utc>>,
}

/// Fetches and parses `item.url` as an RSS/Atom feed, then translates every
/// entry whose link the delivery tracker doesn't already know about (§4.7).
pub async fn run_rss(
    manager: &DownloadManager,
    item: &HarvestableItem,
    delivery: &dyn DeliveryTracker,
    results_tx: &tokio::sync::mpsc::Sender<Arc<DownloadResult>>,
) -> RssSummary {
    let mut summary = RssSummary::default();

    let feed_result = manager.direct_download(item).await;
    if !feed_result.is_success() {
        summary.failed += 1;
        tracing::warn!(url = %item.url, error = ?feed_result.error_message, "failed to fetch RSS feed");
        return summary;
    }

    let entries = match parse_feed(&feed_result.response_body) {
        Ok(entries) => entries,
        Err(err) => {
            summary.failed += 1;
            tracing::warn!(url = %item.url, error = %err, "failed to parse RSS feed");
            return summary;
        }
    };

    for entry in entries {
        if delivery.already_delivered(&entry.link, &Default::default()).await {
            summary.skipped_already_delivered += 1;
            continue;
        }
        let entry_item = HarvestableItem::new(entry.link.clone(), item.journal_id, item.journals.clone());
        let translated = manager.translate(&entry_item, None, false).await;
        summary.queued += 1;
        if results_tx.send(translated).await.is_err() {
            tracing::warn!("record pipeline receiver dropped, stopping feed processing early");
            break;
        }
    }

    summary
}

fn parse_feed(body: &str) -> Result<Vec<FeedEntry>, rss::Error> {
    let channel = rss::Channel::read_from(body.as_bytes())?;
    Ok(channel
        .items()
        .iter()
        .filter_map(|item| {
            let link = item.link()?.to_string();
            let published = item
                .pub_date()
                .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                .map(|d| d.with_timezone(&Utc));
            Some(FeedEntry { link, published })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::config::Config;
    use crate::delivery::{FileDeliveryTracker, NullDeliveryTracker};
    use crate::fetcher::Fetcher;
    use crate::robots::RobotsOracle;
    use crate::translation::TranslationClient;
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SAMPLE_FEED: &str = r#"<?xml version="1.0"?>
        <rss version="2.0"><channel>
            <title>Journal Feed</title>
            <link>https://example.org</link>
            <description>d</description>
            <item><title>A</title><link>https://example.org/a</link><pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate></item>
            <item><title>B</title><link>https://example.org/b</link></item>
        </channel></rss>"#;

    #[test]
    fn parses_feed_items_with_and_without_pub_date() {
        let entries = parse_feed(SAMPLE_FEED).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].link, "https://example.org/a");
        assert!(entries[0].published.is_some());
        assert_eq!(entries[1].link, "https://example.org/b");
        assert!(entries[1].published.is_none());
    }

    fn test_config() -> Config {
        Config::parse("[global]\ntranslation_server_url = \"http://localhost:1969\"\n").unwrap()
    }

    #[tokio::test]
    async fn already_delivered_entries_are_skipped_not_translated() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/robots.txt")).respond_with(ResponseTemplate::new(404)).mount(&server).await;
        Mock::given(method("GET")).and(path("/feed")).respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_FEED)).mount(&server).await;
        Mock::given(method("POST"))
            .and(path("/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"title": "B"}])))
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

        let dir = tempfile::tempdir().unwrap();
        let tracker = FileDeliveryTracker::load(dir.path().join("delivered.tsv")).unwrap();
        tracker.record("https://example.org/a", "live").await;

        let item = HarvestableItem::new(format!("{}/feed", server.uri()), 0, Arc::new(vec![]));
        let (tx, mut rx) = mpsc::channel(8);
        let summary = run_rss(&manager, &item, &tracker, &tx).await;
        drop(tx);

        assert_eq!(summary.skipped_already_delivered, 1);
        assert_eq!(summary.queued, 1);
        let translated = rx.recv().await.unwrap();
        assert!(translated.is_success());
        manager.request_shutdown();
    }
}
