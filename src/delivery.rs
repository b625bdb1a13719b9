//! Delivery Tracker Interface (C4, §4.4): a read-only query over whether a
//! URL has already been delivered in a prior run. The core only depends on
//! this trait's contract; the persistent store behind it is an external
//! collaborator. A simple file-backed implementation is provided so the
//! crate runs standalone end to end.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;

/// Given a URL, has it already been delivered in a state the caller does not
/// want to ignore? `ignore_states` lets retries proceed past e.g. a
/// "transient-error" or "pending" record (§4.4).
#[async_trait]
pub trait DeliveryTracker: Send + Sync {
    async fn already_delivered(&self, url: &str, ignore_states: &HashSet<String>) -> bool;

    /// Records that `url` reached `state`. Not part of the formal interface
    /// (§4.4 calls the tracker read-only from the core's perspective), but
    /// every concrete backend needs a way to get data in, and the reference
    /// implementation uses this same trait for both directions.
    async fn record(&self, url: &str, state: &str);
}

/// A tracker that never considers anything delivered. Useful for `DeliveryMode::None`
/// sources, dry runs, and tests.
#[derive(Debug, Default)]
pub struct NullDeliveryTracker;

#[async_trait]
impl DeliveryTracker for NullDeliveryTracker {
    async fn already_delivered(&self, _url: &str, _ignore_states: &HashSet<String>) -> bool {
        false
    }

    async fn record(&self, _url: &str, _state: &str) {}
}

/// Newline-delimited `url\tstate` file, loaded entirely into memory at
/// startup and appended to as deliveries happen. Good enough for the
/// harvester's own runs; a production deployment would swap this for a
/// relational store behind the same trait (§4.4).
pub struct FileDeliveryTracker {
    path: PathBuf,
    states: RwLock<HashMap<String, String>>,
}

impl FileDeliveryTracker {
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut states = HashMap::new();
        if let Ok(text) = std::fs::read_to_string(&path) {
            for line in text.lines() {
                if let Some((url, state)) = line.split_once('\t') {
                    states.insert(url.to_string(), state.to_string());
                }
            }
        }
        Ok(Self {
            path,
            states: RwLock::new(states),
        })
    }

    fn flush(&self, states: &HashMap<String, String>) -> std::io::Result<()> {
        let mut body = String::new();
        for (url, state) in states {
            body.push_str(url);
            body.push('\t');
            body.push_str(state);
            body.push('\n');
        }
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, &self.path)
    }
}

#[async_trait]
impl DeliveryTracker for FileDeliveryTracker {
    async fn already_delivered(&self, url: &str, ignore_states: &HashSet<String>) -> bool {
        let states = self.states.read().expect("delivery tracker lock poisoned");
        match states.get(url) {
            Some(state) => !ignore_states.contains(state),
            None => false,
        }
    }

    async fn record(&self, url: &str, state: &str) {
        let mut states = self.states.write().expect("delivery tracker lock poisoned");
        states.insert(url.to_string(), state.to_string());
        if let Err(err) = self.flush(&states) {
            tracing::warn!(error = %err, "failed to persist delivery tracker state");
        }
    }
}
