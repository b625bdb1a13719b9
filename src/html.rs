//! Small HTML helpers shared by the fetcher (meta-refresh detection) and the
//! crawler (outlink extraction), generalized from the teacher crate's single
//! `extract_links` helper.

use scraper::{Html, Selector};
use std::time::Duration;

/// Extracts every `href` from `<a>` tags, in document order, duplicates and
/// all — callers are responsible for deduping (§4.6: "ignores duplicates").
pub fn extract_links(content: &str) -> Vec<String> {
    let document = Html::parse_document(content);
    let Ok(selector) = Selector::parse("a") else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|element| element.value().attr("href"))
        .filter(|href| !href.trim().is_empty() && !href.starts_with("javascript:"))
        .map(|href| href.to_string())
        .collect()
}

/// Looks for `<meta http-equiv="refresh" content="N; url=...">` and returns
/// the delay plus target URL, if present (§4.1 redirect policy).
pub fn find_meta_refresh(content: &str) -> Option<(Duration, String)> {
    let document = Html::parse_document(content);
    let selector = Selector::parse("meta").ok()?;
    for element in document.select(&selector) {
        let value = element.value();
        let is_refresh = value
            .attr("http-equiv")
            .map(|v| v.eq_ignore_ascii_case("refresh"))
            .unwrap_or(false);
        if !is_refresh {
            continue;
        }
        let Some(content_attr) = value.attr("content") else {
            continue;
        };
        if let Some((delay, url)) = parse_refresh_directive(content_attr) {
            return Some((delay, url));
        }
    }
    None
}

fn parse_refresh_directive(directive: &str) -> Option<(Duration, String)> {
    let mut parts = directive.splitn(2, ';');
    let delay_part = parts.next()?.trim();
    let delay_seconds: f64 = delay_part.parse().ok()?;
    let rest = parts.next()?.trim();
    let url = rest
        .strip_prefix("url=")
        .or_else(|| rest.strip_prefix("URL="))
        .unwrap_or(rest)
        .trim()
        .trim_matches(|c| c == '\'' || c == '"');
    if url.is_empty() {
        return None;
    }
    Some((Duration::from_secs_f64(delay_seconds.max(0.0)), url.to_string()))
}
