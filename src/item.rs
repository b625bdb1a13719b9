//! The data model shared across every component (§3): journals, harvestable
//! items, and the operations/results that flow between them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How a [`JournalDescriptor`] expects to be enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    Rss,
    Direct,
    Crawl,
    ApiQuery,
    EmailCrawl,
}

/// Whether harvested records from this journal should actually be shipped
/// downstream. The delivery tracker (C4) is consulted regardless of mode, but
/// `None` sources are typically wired to a tracker that never marks delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMode {
    None,
    Test,
    Live,
}

/// Static, immutable-after-load configuration for one journal/source (§3).
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct JournalDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub online_issn: Option<String>,
    pub print_issn: Option<String>,
    pub parent_ppn: Option<String>,
    pub group: Option<String>,
    #[serde(default = "default_delivery_mode")]
    pub delivery_mode: DeliveryMode,
    pub zeder_id: Option<u64>,
    pub entry_point_url: String,
    pub extraction_regex: Option<String>,
    pub crawl_url_regex: Option<String>,
    #[serde(default = "default_max_crawl_depth")]
    pub max_crawl_depth: u32,
    pub strptime_format: Option<String>,
}

fn default_delivery_mode() -> DeliveryMode {
    DeliveryMode::Test
}

fn default_max_crawl_depth() -> u32 {
    1
}

/// An index into the process-wide journal table. Cheap to copy, and lets
/// [`HarvestableItem`] reference its owning descriptor without owning it:
/// the table (`Arc<Vec<JournalDescriptor>>`) outlives every item derived
/// from it, so the back-reference is just an array index.
pub type JournalId = usize;

/// One unit of work the pipeline reasons about (§3). `id` is unique per
/// process and distinguishes two items enqueued for the same `(journal, url)`.
#[derive(Debug, Clone)]
pub struct HarvestableItem {
    pub id: u64,
    pub url: String,
    pub journal_id: JournalId,
    pub journals: Arc<Vec<JournalDescriptor>>,
}

static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

impl HarvestableItem {
    pub fn new(url: impl Into<String>, journal_id: JournalId, journals: Arc<Vec<JournalDescriptor>>) -> Self {
        Self {
            id: NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed),
            url: url.into(),
            journal_id,
            journals,
        }
    }

    pub fn journal(&self) -> &JournalDescriptor {
        &self.journals[self.journal_id]
    }
}

impl std::fmt::Display for HarvestableItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (journal \"{}\", id {})", self.url, self.journal().name, self.id)
    }
}

/// Which of the two download operations a task performs (§3, `DownloadResult`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DirectQuery,
    UseTranslationServer,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::DirectQuery => write!(f, "direct_query"),
            Operation::UseTranslationServer => write!(f, "use_translation_server"),
        }
    }
}

bitflags::bitflags! {
    /// Non-exclusive flags attached to a [`DownloadResult`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResultFlags: u8 {
        const FROM_CACHE = 0b01;
        const ITEM_ALREADY_DELIVERED = 0b10;
    }
}

/// Outcome of one fetch or translation call (§3).
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub url: String,
    pub operation: Operation,
    pub response_body: String,
    pub response_headers: Vec<(String, String)>,
    pub response_code: u16,
    pub error_message: Option<String>,
    pub flags: ResultFlags,
}

impl DownloadResult {
    /// `downloadSuccessful ⇔ response_code ∈ [200,299]` (§3 invariant); the
    /// translation client special-cases 300 itself rather than calling this.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.response_code)
    }

    pub fn from_cache(&self) -> bool {
        self.flags.contains(ResultFlags::FROM_CACHE)
    }
}
