//! Translation Client (C5, §4.5): wraps the external translation server's
//! `/web` and `/searchmultiple` endpoints, including the 300-multiple-match
//! round-trip protocol.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::cache::ResponseCache;
use crate::delivery::DeliveryTracker;
use crate::error::HarvestError;
use crate::item::Operation;

const MAX_SEARCHMULTIPLE_BATCH: usize = 400;
/// §4.5: the second `/web` call after a 300 gets a time budget multiplied by
/// this factor relative to the first.
const MULTI_MATCH_TIME_BUDGET_FACTOR: u32 = 2;

/// What a translation call produced, distinguishing the single- and
/// multi-match protocols so callers can decide how to fan out records (§4.5).
#[derive(Debug, Clone)]
pub enum TranslationOutcome {
    SingleBatch(Vec<Value>),
    MultiBatch(Vec<Value>),
    /// 501: no translator configured for this page. Not an error (§4.5).
    Skipped,
    /// The request was never sent because there was nothing left to send
    /// (e.g. a `searchmultiple` batch that filtered down to empty, §4.5).
    Empty,
}

pub struct TranslationClient {
    http: reqwest::Client,
    server_url: String,
    session_id: String,
    semaphore: Arc<Semaphore>,
    wait_timeout_factor: u32,
    cache: Arc<ResponseCache>,
}

impl TranslationClient {
    pub fn new(http: reqwest::Client, server_url: impl Into<String>, max_concurrent: usize, cache: Arc<ResponseCache>) -> Self {
        Self {
            http,
            server_url: server_url.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            wait_timeout_factor: 3,
            cache,
        }
    }

    /// `web(url, cached_html) → TranslationResult` (§4.5).
    #[tracing::instrument(skip(self, cached_html), fields(url))]
    pub async fn web(&self, url: &str, cached_html: Option<&str>, time_limit: Duration) -> Result<TranslationOutcome, HarvestError> {
        let mut payload = serde_json::json!({
            "url": url,
            "sessionid": self.session_id,
        });
        if let Some(html) = cached_html {
            payload["cachedHTML"] = Value::String(html.to_string());
        }

        let (status, body) = self.post("/web", &payload, time_limit).await?;
        self.interpret_web_response(url, &payload, status, body, time_limit).await
    }

    async fn interpret_web_response(
        &self,
        original_url: &str,
        original_payload: &Value,
        status: u16,
        body: String,
        time_limit: Duration,
    ) -> Result<TranslationOutcome, HarvestError> {
        match status {
            200 => {
                let citations: Vec<Value> = serde_json::from_str(&body)?;
                Ok(TranslationOutcome::SingleBatch(citations))
            }
            300 => {
                let candidates: IndexMap<String, String> = serde_json::from_str(&body)?;
                let extended_limit = time_limit * MULTI_MATCH_TIME_BUDGET_FACTOR;
                let (second_status, second_body) = self.post("/web", original_payload, extended_limit).await?;
                if second_status != 200 {
                    return Err(HarvestError::ProtocolError(format!(
                        "expected 200 on the multi-match follow-up, got {second_status}"
                    )));
                }
                let citations: Vec<Value> = serde_json::from_str(&second_body)?;

                if citations.len() == 1 {
                    if let Some(returned_url) = citations[0].get("url").and_then(Value::as_str) {
                        if returned_url == original_url {
                            return Err(HarvestError::ProtocolError(
                                "300 follow-up returned a single citation echoing the original URL".into(),
                            ));
                        }
                    }
                }

                for (child_url, _label) in &candidates {
                    if let Some(citation) = citations.iter().find(|c| c.get("url").and_then(Value::as_str) == Some(child_url.as_str())) {
                        self.cache
                            .insert(child_url, Operation::UseTranslationServer, citation.to_string())
                            .await;
                    }
                }

                Ok(TranslationOutcome::MultiBatch(citations))
            }
            500 => Err(HarvestError::TranslationError),
            501 => Ok(TranslationOutcome::Skipped),
            other => Err(HarvestError::HttpStatus(other)),
        }
    }

    /// `searchMultiple(id_object) → TranslationResult` (§4.5).
    #[tracing::instrument(skip(self, ids, tracker))]
    pub async fn search_multiple(
        &self,
        ids: &IndexMap<String, u64>,
        tracker: &dyn DeliveryTracker,
        time_limit: Duration,
    ) -> Result<TranslationOutcome, HarvestError> {
        let ignore_states = HashSet::new();
        let mut filtered = IndexMap::new();
        for (id, index) in ids {
            if !tracker.already_delivered(id, &ignore_states).await {
                filtered.insert(id.clone(), *index);
            }
            if filtered.len() >= MAX_SEARCHMULTIPLE_BATCH {
                tracing::warn!(dropped = ids.len() - filtered.len(), "searchmultiple batch truncated at ceiling");
                break;
            }
        }

        if filtered.is_empty() {
            return Ok(TranslationOutcome::Empty);
        }

        let payload = serde_json::json!({
            "items": filtered,
            "sessionid": self.session_id,
        });
        let (status, body) = self.post("/searchmultiple", &payload, time_limit).await?;

        match status {
            200 => Ok(TranslationOutcome::SingleBatch(serde_json::from_str(&body)?)),
            300 => {
                let extended_limit = time_limit * MULTI_MATCH_TIME_BUDGET_FACTOR;
                let (second_status, second_body) = self.post("/searchmultiple", &payload, extended_limit).await?;
                if second_status != 200 {
                    return Err(HarvestError::ProtocolError(format!(
                        "expected 200 on the multi-match follow-up, got {second_status}"
                    )));
                }
                Ok(TranslationOutcome::MultiBatch(serde_json::from_str(&second_body)?))
            }
            500 => Err(HarvestError::TranslationError),
            501 => Ok(TranslationOutcome::Skipped),
            other => Err(HarvestError::HttpStatus(other)),
        }
    }

    /// Posts `payload` to `self.server_url + endpoint`, throttled by the
    /// process-wide translation-server semaphore (§4.5).
    async fn post(&self, endpoint: &str, payload: &Value, time_limit: Duration) -> Result<(u16, String), HarvestError> {
        let wait_timeout = time_limit * self.wait_timeout_factor;
        let permit = tokio::time::timeout(wait_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| HarvestError::TranslationServerBusy)?
            .map_err(|_| HarvestError::TranslationServerBusy)?;

        let url = format!("{}{endpoint}", self.server_url.trim_end_matches('/'));
        let result = tokio::time::timeout(time_limit, self.http.post(&url).json(payload).send())
            .await
            .map_err(|_| HarvestError::Timeout(time_limit))?;

        drop(permit);

        let response = result.map_err(HarvestError::from)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(HarvestError::from)?;
        Ok((status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_with_cache() -> (reqwest::Client, Arc<ResponseCache>) {
        (reqwest::Client::new(), Arc::new(ResponseCache::new()))
    }

    #[tokio::test]
    async fn single_match_returns_single_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"title": "A"}])))
            .mount(&server)
            .await;

        let (http, cache) = client_with_cache();
        let client = TranslationClient::new(http, server.uri(), 4, cache);
        let outcome = client.web("https://example.org/a", None, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, TranslationOutcome::SingleBatch(v) if v.len() == 1));
    }

    #[tokio::test]
    async fn multi_match_round_trips_and_caches_children() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/web"))
            .respond_with(ResponseTemplate::new(300).set_body_json(serde_json::json!({
                "https://example.org/a1": "A1",
                "https://example.org/a2": "A2",
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"url": "https://example.org/a1", "title": "A1"},
                {"url": "https://example.org/a2", "title": "A2"},
            ])))
            .mount(&server)
            .await;

        let (http, cache) = client_with_cache();
        let client = TranslationClient::new(http, server.uri(), 4, cache.clone());
        let outcome = client.web("https://example.org/a", None, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, TranslationOutcome::MultiBatch(v) if v.len() == 2));

        assert!(cache.lookup("https://example.org/a1", Operation::UseTranslationServer).await.is_some());
        assert!(cache.lookup("https://example.org/a2", Operation::UseTranslationServer).await.is_some());
    }

    #[tokio::test]
    async fn status_500_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/web"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (http, cache) = client_with_cache();
        let client = TranslationClient::new(http, server.uri(), 4, cache);
        let err = client.web("https://example.org/a", None, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, HarvestError::TranslationError));
    }

    #[tokio::test]
    async fn status_501_is_skipped_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/web"))
            .respond_with(ResponseTemplate::new(501))
            .mount(&server)
            .await;

        let (http, cache) = client_with_cache();
        let client = TranslationClient::new(http, server.uri(), 4, cache);
        let outcome = client.web("https://example.org/a", None, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, TranslationOutcome::Skipped));
    }

    #[tokio::test]
    async fn empty_filtered_batch_never_contacts_server() {
        let server = MockServer::start().await;
        // No mock registered: if the client hits the server, wiremock will panic on an
        // unexpected request at `server` drop time.
        let (http, cache) = client_with_cache();
        let client = TranslationClient::new(http, server.uri(), 4, cache);

        struct AlwaysDelivered;
        #[async_trait::async_trait]
        impl DeliveryTracker for AlwaysDelivered {
            async fn already_delivered(&self, _url: &str, _ignore: &HashSet<String>) -> bool {
                true
            }
            async fn record(&self, _url: &str, _state: &str) {}
        }

        let mut ids = IndexMap::new();
        ids.insert("10.1000/xyz".to_string(), 0u64);
        let outcome = client.search_multiple(&ids, &AlwaysDelivered, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, TranslationOutcome::Empty));
    }
}
