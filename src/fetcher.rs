//! Fetcher (C1, §4.1): a single HTTP request with timeout, redirect
//! following, robots.txt consultation, decompression, and a shared cookie
//! jar. Everything above this layer (the scheduler, the crawler, the
//! translation client) goes through here for network I/O.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method};

use crate::error::HarvestError;
use crate::html;
use crate::robots::RobotsOracle;

const DEFAULT_MAX_REDIRECTS: u32 = 10;
const DEFAULT_MAX_HTTP_EQUIV_REDIRECTS: u32 = 1;
const DEFAULT_HTTP_EQUIV_THRESHOLD: Duration = Duration::from_secs(30);
const DEFAULT_MAX_DOCUMENT_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

/// Everything the Fetcher needs to know to perform one logical request,
/// including however many redirect hops it ends up taking (§4.1).
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: HttpMethod,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
    pub max_redirects: u32,
    pub time_budget: Duration,
    /// Empty ⇒ accept all languages. A bare code matches itself and any
    /// region-suffixed variant; `*` matches all (§4.1).
    pub acceptable_languages: Vec<String>,
    pub honour_robots: bool,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>, time_budget: Duration) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            body: None,
            headers: Vec::new(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            time_budget,
            acceptable_languages: Vec::new(),
            honour_robots: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub final_url: String,
    pub response_code: u16,
    /// Every intermediate `Location` hop, in order (§4.1 "records every intermediate Location").
    pub redirect_chain: Vec<String>,
}

pub struct Fetcher {
    client: Client,
    robots: Arc<RobotsOracle>,
    user_agent: String,
    max_document_bytes: usize,
}

impl Fetcher {
    pub fn new(user_agent: impl Into<String>, robots: Arc<RobotsOracle>) -> Result<Self, HarvestError> {
        let user_agent = user_agent.into();
        let client = Client::builder()
            .user_agent(user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .cookie_store(true)
            .build()
            .map_err(|e| HarvestError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            robots,
            user_agent,
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    #[tracing::instrument(skip(self, request), fields(url = %request.url))]
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, HarvestError> {
        let overall_deadline = tokio::time::Instant::now() + request.time_budget;
        let mut current_url = request.url.clone();
        let mut redirect_chain = Vec::new();
        let mut http_equiv_hops = 0u32;

        loop {
            let parsed = url::Url::parse(&current_url).map_err(|e| HarvestError::InvalidUrl(e.to_string()))?;
            let host = parsed.host_str().ok_or_else(|| HarvestError::InvalidUrl("missing host".into()))?.to_string();

            if request.honour_robots && !self.robots.may_fetch(&host, parsed.path()).await {
                return Err(HarvestError::DeniedByRobots);
            }

            let remaining = overall_deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(HarvestError::Timeout(request.time_budget));
            }

            let response = self.send_once(&current_url, &request, remaining).await?;
            let status = response.status().as_u16();

            if (300..400).contains(&status) {
                if redirect_chain.len() as u32 >= request.max_redirects {
                    return Err(HarvestError::TooManyRedirects { limit: request.max_redirects });
                }
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| HarvestError::ProtocolError("redirect without Location header".into()))?;
                let next = parsed
                    .join(location)
                    .map_err(|e| HarvestError::ProtocolError(format!("invalid redirect target: {e}")))?;
                redirect_chain.push(next.to_string());
                current_url = next.to_string();
                continue;
            }

            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
                .collect();

            if let Some(language) = header_value(&headers, "content-language") {
                if !language_acceptable(&language, &request.acceptable_languages) {
                    return Err(HarvestError::UnacceptableLanguage);
                }
            }

            let is_text = header_value(&headers, "content-type")
                .map(|ct| ct.starts_with("text/") || ct.contains("json") || ct.contains("xml"))
                .unwrap_or(true);

            let bytes = response.bytes().await.map_err(HarvestError::from)?;
            if bytes.len() > self.max_document_bytes {
                if is_text {
                    tracing::warn!(len = bytes.len(), cap = self.max_document_bytes, "truncating oversized text document");
                } else {
                    return Err(HarvestError::DocumentTooLarge(bytes.len()));
                }
            }
            let truncated = &bytes[..bytes.len().min(self.max_document_bytes)];
            let body = String::from_utf8_lossy(truncated).into_owned();

            if (200..300).contains(&status) && body_looks_like_html(&headers) && http_equiv_hops < DEFAULT_MAX_HTTP_EQUIV_REDIRECTS {
                if let Some((delay, target)) = html::find_meta_refresh(&body) {
                    if delay < DEFAULT_HTTP_EQUIV_THRESHOLD {
                        if let Ok(next) = parsed.join(&target) {
                            http_equiv_hops += 1;
                            redirect_chain.push(next.to_string());
                            current_url = next.to_string();
                            continue;
                        }
                    }
                }
            }

            return Ok(FetchResponse {
                headers,
                body,
                final_url: current_url,
                response_code: status,
                redirect_chain,
            });
        }
    }

    async fn send_once(
        &self,
        url: &str,
        request: &FetchRequest,
        remaining: Duration,
    ) -> Result<reqwest::Response, HarvestError> {
        let mut builder = self.client.request(request.method.into(), url).timeout(remaining);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("user-agent")) {
            builder = builder.header(reqwest::header::USER_AGENT, &self.user_agent);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        builder.send().await.map_err(HarvestError::from)
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn body_looks_like_html(headers: &[(String, String)]) -> bool {
    header_value(headers, "content-type")
        .map(|ct| ct.contains("html"))
        .unwrap_or(false)
}

/// Empty list ⇒ accept all; a bare code matches the same code and any
/// region-suffixed variant; `*` matches all (§4.1).
fn language_acceptable(content_language: &str, acceptable: &[String]) -> bool {
    if acceptable.is_empty() {
        return true;
    }
    let tags: Vec<&str> = content_language.split(',').map(|t| t.trim()).collect();
    acceptable.iter().any(|wanted| {
        if wanted == "*" {
            return true;
        }
        let wanted_lower = wanted.to_ascii_lowercase();
        tags.iter().any(|tag| {
            let tag_lower = tag.to_ascii_lowercase();
            tag_lower == wanted_lower || tag_lower.starts_with(&format!("{wanted_lower}-"))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_acceptable_list_accepts_everything() {
        assert!(language_acceptable("de-DE", &[]));
    }

    #[test]
    fn bare_code_matches_region_variant() {
        assert!(language_acceptable("en-GB", &["en".to_string()]));
        assert!(language_acceptable("en", &["en".to_string()]));
        assert!(!language_acceptable("fr", &["en".to_string()]));
    }

    #[test]
    fn wildcard_matches_all() {
        assert!(language_acceptable("zz-ZZ", &["*".to_string()]));
    }

    #[test]
    fn parse_refresh_directive_handles_quotes() {
        let (delay, url) = html::find_meta_refresh(r#"<meta http-equiv="refresh" content="0;url='https://example.org'">"#).unwrap();
        assert_eq!(delay, Duration::from_secs(0));
        assert_eq!(url, "https://example.org");
    }
}
