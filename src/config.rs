//! Layered configuration (§4.11, ambient stack): one TOML document holding a
//! `[global]` table and a `[[journal]]` array, deserialized with `serde` the
//! way the rest of the example pack's config-heavy crates do it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::HarvestError;
use crate::item::JournalDescriptor;

/// Process-wide concurrency caps per task kind (§4.8 `MAX_*_TASKLETS`).
#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyLimits {
    #[serde(default = "default_direct_download_cap")]
    pub max_direct_download_tasklets: usize,
    #[serde(default = "default_crawling_cap")]
    pub max_crawling_tasklets: usize,
    #[serde(default = "default_rss_cap")]
    pub max_rss_tasklets: usize,
    #[serde(default = "default_apiquery_cap")]
    pub max_apiquery_tasklets: usize,
    #[serde(default = "default_emailcrawl_cap")]
    pub max_emailcrawl_tasklets: usize,
    #[serde(default = "default_translation_cap")]
    pub max_concurrent_translation_server_requests: usize,
}

fn default_direct_download_cap() -> usize {
    20
}
fn default_crawling_cap() -> usize {
    10
}
fn default_rss_cap() -> usize {
    5
}
fn default_apiquery_cap() -> usize {
    5
}
fn default_emailcrawl_cap() -> usize {
    2
}
fn default_translation_cap() -> usize {
    8
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            max_direct_download_tasklets: default_direct_download_cap(),
            max_crawling_tasklets: default_crawling_cap(),
            max_rss_tasklets: default_rss_cap(),
            max_apiquery_tasklets: default_apiquery_cap(),
            max_emailcrawl_tasklets: default_emailcrawl_cap(),
            max_concurrent_translation_server_requests: default_translation_cap(),
        }
    }
}

/// Global knobs that apply to every source (§4.11).
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    pub translation_server_url: String,
    #[serde(default = "default_download_delay_ms")]
    pub default_download_delay_ms: u64,
    #[serde(default = "default_max_download_delay_ms")]
    pub max_download_delay_ms: u64,
    #[serde(default)]
    pub per_domain_delay_overrides_ms: HashMap<String, u64>,
    #[serde(default = "default_per_request_time_limit_ms")]
    pub per_request_time_limit_ms: u64,
    #[serde(default = "default_per_crawl_time_limit_ms")]
    pub per_crawl_time_limit_ms: u64,
    /// Directory of ISSN enrichment maps and the `targets.regex` allowlist (§4.9/§4.11).
    pub map_directory: Option<PathBuf>,
    #[serde(default)]
    pub ignore_robots_dot_txt: bool,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub concurrency: ConcurrencyLimits,
    pub progress_file: Option<PathBuf>,
    pub delivered_fingerprints_file: Option<PathBuf>,
    pub delivery_tracker_file: Option<PathBuf>,
    #[serde(default = "default_output_format")]
    pub output_format: OutputFormat,
    #[serde(default = "default_control_number_prefix")]
    pub control_number_prefix: String,
}

fn default_download_delay_ms() -> u64 {
    1000
}
fn default_max_download_delay_ms() -> u64 {
    30_000
}
fn default_per_request_time_limit_ms() -> u64 {
    20_000
}
fn default_per_crawl_time_limit_ms() -> u64 {
    600_000
}
fn default_user_agent() -> String {
    "zts_harvester (+https://example.org/docs/user_agents)".to_string()
}
fn default_output_format() -> OutputFormat {
    OutputFormat::Json
}
fn default_control_number_prefix() -> String {
    "ZTS".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Marcxml,
    Marc21,
    Json,
}

impl GlobalConfig {
    pub fn per_request_time_limit(&self) -> Duration {
        Duration::from_millis(self.per_request_time_limit_ms)
    }

    pub fn per_crawl_time_limit(&self) -> Duration {
        Duration::from_millis(self.per_crawl_time_limit_ms)
    }

    pub fn default_download_delay(&self) -> Duration {
        Duration::from_millis(self.default_download_delay_ms)
    }

    pub fn max_download_delay(&self) -> Duration {
        Duration::from_millis(self.max_download_delay_ms)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    global: GlobalConfig,
    #[serde(rename = "journal", default)]
    journals: Vec<JournalDescriptor>,
}

/// The fully loaded, immutable configuration (§9 design note: "passed by
/// reference into every component; *not* module-level state").
#[derive(Debug, Clone)]
pub struct Config {
    pub global: GlobalConfig,
    pub journals: Arc<Vec<JournalDescriptor>>,
}

impl Config {
    /// Loads and validates the layered configuration document. Any failure
    /// here is FATAL (§7): the process should abort before issuing any
    /// network I/O.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HarvestError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| HarvestError::Configuration(format!("cannot read {}: {e}", path.as_ref().display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, HarvestError> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| HarvestError::Configuration(format!("malformed config: {e}")))?;

        if raw.global.translation_server_url.trim().is_empty() {
            return Err(HarvestError::Configuration(
                "global.translation_server_url must not be empty".into(),
            ));
        }
        if raw.global.default_download_delay_ms > raw.global.max_download_delay_ms {
            return Err(HarvestError::Configuration(
                "global.default_download_delay_ms must not exceed max_download_delay_ms".into(),
            ));
        }
        for journal in &raw.journals {
            if journal.entry_point_url.trim().is_empty() {
                return Err(HarvestError::Configuration(format!(
                    "journal \"{}\" has an empty entry_point_url",
                    journal.name
                )));
            }
            if let Some(pattern) = &journal.extraction_regex {
                regex::Regex::new(pattern)
                    .map_err(|e| HarvestError::Configuration(format!("journal \"{}\": bad extraction_regex: {e}", journal.name)))?;
            }
            if let Some(pattern) = &journal.crawl_url_regex {
                regex::Regex::new(pattern)
                    .map_err(|e| HarvestError::Configuration(format!("journal \"{}\": bad crawl_url_regex: {e}", journal.name)))?;
            }
        }

        Ok(Config {
            global: raw.global,
            journals: Arc::new(raw.journals),
        })
    }

    /// Per-host override of the default download delay, falling back to the
    /// global default when the host has no explicit entry (§3 `DelayParams`).
    pub fn delay_override_for_host(&self, host: &str) -> Option<Duration> {
        self.global
            .per_domain_delay_overrides_ms
            .get(host)
            .map(|ms| Duration::from_millis(*ms))
    }
}
