//! Email Crawl (§4.8 `EmailCrawl` task kind): some journals announce new
//! issues by email rather than RSS. This component scans a raw message body
//! for article links and translates each, the same way the RSS processor
//! handles feed entries (§4.7 is the closer analogue; there is no separate
//! design section for this task kind beyond its scheduling priority).

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;

use crate::delivery::DeliveryTracker;
use crate::item::{DownloadResult, HarvestableItem};
use crate::manager::DownloadManager;

#[derive(Debug, Clone, Copy, Default)]
pub struct EmailCrawlSummary {
    pub links_found: u64,
    pub queued: u64,
    pub skipped_already_delivered: u64,
}

/// Extracts every link matching `link_regex` from `raw_message`, deduplicates
/// them, and translates whichever ones the delivery tracker doesn't already
/// know about.
pub async fn run_email_crawl(
    manager: &DownloadManager,
    item: &HarvestableItem,
    raw_message: &str,
    link_regex: &Regex,
    delivery: &dyn DeliveryTracker,
    results_tx: &tokio::sync::mpsc::Sender<Arc<DownloadResult>>,
) -> EmailCrawlSummary {
    let mut summary = EmailCrawlSummary::default();
    let mut seen = HashSet::new();

    for found in link_regex.find_iter(raw_message) {
        let link = found.as_str().to_string();
        if !seen.insert(link.clone()) {
            continue;
        }
        summary.links_found += 1;

        if delivery.already_delivered(&link, &Default::default()).await {
            summary.skipped_already_delivered += 1;
            continue;
        }

        let link_item = HarvestableItem::new(link, item.journal_id, item.journals.clone());
        let translated = manager.translate(&link_item, None, false).await;
        summary.queued += 1;
        if results_tx.send(translated).await.is_err() {
            tracing::warn!("record pipeline receiver dropped, stopping email crawl early");
            break;
        }
    }

    summary
}
