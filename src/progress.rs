//! Progress & Error Logger (C10, §4.10): a resumable progress file rewritten
//! after every URL processed in a crawl, plus error-taxonomy counters used
//! for the end-of-run summary (§7 "user-visible behavior").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::HarvestError;

/// `(processed_url_count; remaining_depth; last_url)` (§3, §4.10).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgressState {
    pub processed_url_count: u64,
    pub remaining_depth: u32,
    pub last_url: String,
}

impl ProgressState {
    fn serialize(&self) -> String {
        format!("{};{};{}", self.processed_url_count, self.remaining_depth, self.last_url)
    }

    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().splitn(3, ';');
        let processed_url_count = parts.next()?.parse().ok()?;
        let remaining_depth = parts.next()?.parse().ok()?;
        let last_url = parts.next()?.to_string();
        Some(Self {
            processed_url_count,
            remaining_depth,
            last_url,
        })
    }
}

/// Per-run counters, grouped by the error taxonomy's `kind_label` (§7).
#[derive(Debug, Default)]
pub struct ErrorCounters {
    counts: Mutex<HashMap<&'static str, u64>>,
}

impl ErrorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, error: &HarvestError) {
        let mut counts = self.counts.lock().expect("error counter lock poisoned");
        *counts.entry(error.kind_label()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let counts = self.counts.lock().expect("error counter lock poisoned");
        let mut items: Vec<_> = counts.iter().map(|(k, v)| (*k, *v)).collect();
        items.sort_by_key(|(k, _)| *k);
        items
    }

    pub fn total(&self) -> u64 {
        self.counts.lock().expect("error counter lock poisoned").values().sum()
    }
}

/// Writes the resumable progress file atomically: write to a sibling temp
/// path, then rename over the target (§4.10).
pub struct ProgressLogger {
    path: Option<PathBuf>,
    errors: ErrorCounters,
}

impl ProgressLogger {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            errors: ErrorCounters::new(),
        }
    }

    pub fn errors(&self) -> &ErrorCounters {
        &self.errors
    }

    pub fn load(&self) -> Option<ProgressState> {
        let path = self.path.as_ref()?;
        let text = std::fs::read_to_string(path).ok()?;
        ProgressState::parse(&text)
    }

    pub fn record(&self, state: &ProgressState) -> std::io::Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        write_atomically(path, &state.serialize())
    }
}

fn write_atomically(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)
}
