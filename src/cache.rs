//! Response Cache (C3, §4.3): a content-addressed store of recent responses,
//! plus the in-flight registry that coalesces duplicate concurrent requests.
//!
//! This is the only mechanism preventing duplicate translation-server calls
//! for URLs discovered concurrently by different crawlers (§4.3).

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{broadcast, RwLock};

use crate::item::{DownloadResult, Operation};

/// A cache entry (§3 `CachedDownloadData`).
#[derive(Debug, Clone)]
pub struct CachedDownloadData {
    pub url: String,
    pub operation: Operation,
    pub body: String,
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: RwLock<IndexMap<(String, OperationKey), CachedDownloadData>>,
}

/// `Operation` isn't `Hash`/`Eq` by derive (kept minimal in `item.rs`), so the
/// cache key uses this local mirror instead of pulling in more derives than
/// the rest of that enum's callers need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OperationKey {
    DirectQuery,
    UseTranslationServer,
}

impl From<Operation> for OperationKey {
    fn from(op: Operation) -> Self {
        match op {
            Operation::DirectQuery => OperationKey::DirectQuery,
            Operation::UseTranslationServer => OperationKey::UseTranslationServer,
        }
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the cached body for `(url, op)`, if any (§4.3 `lookup`).
    pub async fn lookup(&self, url: &str, op: Operation) -> Option<String> {
        let entries = self.entries.read().await;
        entries.get(&(url.to_string(), op.into())).map(|e| e.body.clone())
    }

    /// Idempotent insert. On key collision with a differing body, logs and
    /// keeps the first entry (§3 `CachedDownloadData` multiplicity).
    pub async fn insert(&self, url: &str, op: Operation, body: String) {
        let key = (url.to_string(), OperationKey::from(op));
        let mut entries = self.entries.write().await;
        match entries.get(&key) {
            Some(existing) if existing.body != body => {
                tracing::warn!(url, operation = %op, "cache collision with differing body, keeping original");
            }
            Some(_) => {}
            None => {
                entries.insert(
                    key,
                    CachedDownloadData {
                        url: url.to_string(),
                        operation: op,
                        body,
                    },
                );
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Tracks tasklets currently in flight so that a second caller for the same
/// `(url, op)` gets a future bound to the existing tasklet instead of a new
/// one being created (§4.3, §4.8).
#[derive(Default)]
pub struct InFlightRegistry {
    inner: RwLock<HashMap<(String, OperationKey), broadcast::Sender<Arc<DownloadResult>>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// If `(url, op)` is already in flight, returns a receiver bound to its
    /// result. Otherwise registers a fresh broadcast channel and returns
    /// `None`, meaning the caller is responsible for doing the work and
    /// calling [`InFlightRegistry::complete`] when done.
    pub async fn join_or_register(
        &self,
        url: &str,
        op: Operation,
    ) -> Result<broadcast::Receiver<Arc<DownloadResult>>, broadcast::Sender<Arc<DownloadResult>>> {
        let key = (url.to_string(), OperationKey::from(op));
        let mut inner = self.inner.write().await;
        if let Some(sender) = inner.get(&key) {
            Ok(sender.subscribe())
        } else {
            let (tx, _rx) = broadcast::channel(1);
            inner.insert(key, tx.clone());
            Err(tx)
        }
    }

    /// Broadcasts the finished result to every coalesced waiter and removes
    /// the bookkeeping entry (merging §4.8 step 4 "reap in-flight registry"
    /// into tasklet completion rather than a separate periodic sweep).
    pub async fn complete(&self, url: &str, op: Operation, result: Arc<DownloadResult>, sender: broadcast::Sender<Arc<DownloadResult>>) {
        let _ = sender.send(result);
        let key = (url.to_string(), OperationKey::from(op));
        self.inner.write().await.remove(&key);
    }

    pub async fn in_flight_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ResultFlags;

    fn result(url: &str) -> Arc<DownloadResult> {
        Arc::new(DownloadResult {
            url: url.to_string(),
            operation: Operation::UseTranslationServer,
            response_body: "[]".into(),
            response_headers: vec![],
            response_code: 200,
            error_message: None,
            flags: ResultFlags::empty(),
        })
    }

    #[tokio::test]
    async fn lookup_miss_then_hit() {
        let cache = ResponseCache::new();
        assert!(cache.lookup("https://example.org/a", Operation::DirectQuery).await.is_none());
        cache.insert("https://example.org/a", Operation::DirectQuery, "body".into()).await;
        assert_eq!(
            cache.lookup("https://example.org/a", Operation::DirectQuery).await.unwrap(),
            "body"
        );
    }

    #[tokio::test]
    async fn collision_keeps_first_body() {
        let cache = ResponseCache::new();
        cache.insert("https://example.org/a", Operation::DirectQuery, "first".into()).await;
        cache.insert("https://example.org/a", Operation::DirectQuery, "second".into()).await;
        assert_eq!(
            cache.lookup("https://example.org/a", Operation::DirectQuery).await.unwrap(),
            "first"
        );
    }

    #[tokio::test]
    async fn second_caller_for_same_key_coalesces() {
        let registry = InFlightRegistry::new();
        let first = registry
            .join_or_register("https://example.org/a", Operation::UseTranslationServer)
            .await;
        let sender = first.expect_err("first caller should own the work");

        let second = registry
            .join_or_register("https://example.org/a", Operation::UseTranslationServer)
            .await;
        let mut receiver = second.expect("second caller should coalesce onto the first");

        let payload = result("https://example.org/a");
        registry
            .complete("https://example.org/a", Operation::UseTranslationServer, payload.clone(), sender)
            .await;

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.url, payload.url);
        assert_eq!(registry.in_flight_count().await, 0);
    }
}
