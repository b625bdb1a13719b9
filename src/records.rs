//! Record Pipeline (C9, §4.9): turns translation-server citations into
//! deduplicated bibliographic records, assigns monotonic control numbers, and
//! renders MARC or JSON output.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::OutputFormat;
use crate::delivery::DeliveryTracker;
use crate::item::DownloadResult;
use crate::maps::IssnMaps;

/// What a translation server citation object looks like on the wire. Unknown
/// fields are ignored; everything here is optional because Zotero-style
/// translators emit wildly different subsets depending on item type (§4.9).
#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
pub struct Citation {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub creators: Vec<Creator>,
    pub date: Option<String>,
    pub language: Option<String>,
    pub rights: Option<String>,
    #[serde(rename = "DOI")]
    pub doi: Option<String>,
    #[serde(rename = "ISSN")]
    pub issn: Option<String>,
    #[serde(rename = "publicationTitle")]
    pub publication_title: Option<String>,
    pub volume: Option<String>,
    pub issue: Option<String>,
    pub pages: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "abstractNote")]
    pub abstract_note: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(rename = "itemType", default)]
    pub item_type: String,
}

#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
pub struct Creator {
    #[serde(rename = "firstName")]
    pub first_name: Option<String>,
    #[serde(rename = "lastName")]
    pub last_name: Option<String>,
    #[serde(rename = "creatorType", default)]
    pub creator_type: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct Tag {
    pub tag: String,
}

/// One MARC field: a tag plus its already-formatted value (subfield
/// delimiters included where relevant, e.g. `$aTitle$bSubtitle`). Rendering
/// to MARCXML/MARC21 is a mechanical wrapping step kept out of this struct.
#[derive(Debug, Clone)]
pub struct MarcField {
    pub tag: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct Record {
    pub control_number: String,
    pub fingerprint: String,
    pub fields: Vec<MarcField>,
}

/// Assigns `PREFIX` + a zero-padded, monotonically increasing counter to
/// every new record (§4.9).
pub struct ControlNumberGenerator {
    prefix: String,
    next: AtomicU64,
}

impl ControlNumberGenerator {
    pub fn new(prefix: impl Into<String>, start_at: u64) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(start_at),
        }
    }

    pub fn next(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}{:09}", self.prefix, n)
    }
}

/// `sha256(title|doi|issn|url)`, lowercased and whitespace-collapsed before
/// hashing so trivial formatting differences between translator runs don't
/// produce spurious duplicates. Deliberately excludes the control number
/// (§4.9: dedup must be stable across reruns that assign different numbers).
pub fn fingerprint(citation: &Citation) -> String {
    let canon = |s: &str| s.trim().to_ascii_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    let key = [
        canon(&citation.title),
        canon(citation.doi.as_deref().unwrap_or("")),
        canon(citation.issn.as_deref().unwrap_or("")),
        canon(citation.url.as_deref().unwrap_or("")),
    ]
    .join("\u{1f}");
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
}

const DEFAULT_LANGUAGE_CODE: &str = "eng";

/// Builds the MARC field list for one citation (§4.9's tag table:
/// 001/007/022/041/084/100/700/245/260/362/520/542/653/773/856/936), enriched
/// with the per-ISSN overrides in `issn_maps` (language, physical form, SSG,
/// keyword routing, superior PPN, inferred volume) the way the original
/// harvester's map files drive the same lookups.
pub fn assemble_marc_fields(citation: &Citation, control_number: &str, issn_maps: &IssnMaps) -> Vec<MarcField> {
    let issn = citation.issn.as_deref();
    let mut fields = vec![MarcField { tag: "001".into(), value: control_number.to_string() }];

    fields.push(MarcField {
        tag: "008".into(),
        value: citation.date.clone().unwrap_or_default(),
    });

    if let Some(physical_form) = issn.and_then(|issn| issn_maps.physical_form.get(issn)) {
        match physical_form.as_str() {
            "A" => fields.push(MarcField { tag: "007".into(), value: "tu".into() }),
            "O" => fields.push(MarcField { tag: "007".into(), value: "cr uuu---uuuuu".into() }),
            other => tracing::warn!(issn = issn.unwrap_or_default(), physical_form = other, "unhandled entry in physical form map"),
        }
    }

    if let Some(issn) = issn {
        fields.push(MarcField { tag: "022".into(), value: format!("$a{issn}") });
    }

    let language_code = issn
        .and_then(|issn| issn_maps.language_code.get(issn))
        .or_else(|| citation.language.as_ref().and_then(|lang| issn_maps.language_name_to_code.get(lang)))
        .cloned()
        .unwrap_or_else(|| DEFAULT_LANGUAGE_CODE.to_string());
    fields.push(MarcField { tag: "041".into(), value: format!("$a{language_code}") });

    if let Some(ssg) = issn.and_then(|issn| issn_maps.ssg.get(issn)) {
        fields.push(MarcField { tag: "084".into(), value: format!("$a{ssg}") });
    }

    let mut creators = citation.creators.iter();
    if let Some(first_author) = creators.next() {
        fields.push(MarcField { tag: "100".into(), value: format!("$a{}", format_name(first_author)) });
    }
    for co_author in creators {
        fields.push(MarcField { tag: "700".into(), value: format!("$a{}", format_name(co_author)) });
    }

    fields.push(MarcField { tag: "245".into(), value: format!("$a{}", citation.title) });

    if let Some(date) = &citation.date {
        fields.push(MarcField { tag: "260".into(), value: format!("$c{date}") });
    }

    let volume = citation.volume.clone().or_else(|| issn.and_then(|issn| issn_maps.volume.get(issn)).cloned());
    if volume.is_some() || citation.issue.is_some() {
        let mut value = String::new();
        if let Some(volume) = &volume {
            value.push_str(&format!("$aVol. {volume}"));
        }
        if let Some(issue) = &citation.issue {
            value.push_str(&format!(" no. {issue}"));
        }
        fields.push(MarcField { tag: "362".into(), value });
    }

    if let Some(abstract_note) = &citation.abstract_note {
        fields.push(MarcField { tag: "520".into(), value: format!("$a{abstract_note}") });
    }

    if let Some(rights) = &citation.rights {
        let subfield = if url::Url::parse(rights).is_ok() { 'u' } else { 'f' };
        fields.push(MarcField { tag: "542".into(), value: format!("${subfield}{rights}") });
    }

    let keyword_tag = issn.and_then(|issn| issn_maps.keyword_field.get(issn)).cloned().unwrap_or_else(|| "653".to_string());
    for tag in &citation.tags {
        fields.push(MarcField { tag: keyword_tag.clone(), value: format!("$a{}", tag.tag) });
    }

    if let Some(journal) = &citation.publication_title {
        let mut value = format!("$t{journal}");
        if let Some(pages) = &citation.pages {
            value.push_str(&format!("$g{pages}"));
        }
        if let Some(ppn) = issn.and_then(|issn| issn_maps.superior_ppn.get(issn)) {
            value.push_str(&format!("$w{ppn}"));
        }
        fields.push(MarcField { tag: "773".into(), value });
    }

    if let Some(url) = &citation.url {
        fields.push(MarcField { tag: "856".into(), value: format!("$u{url}") });
    }
    if let Some(doi) = &citation.doi {
        fields.push(MarcField { tag: "856".into(), value: format!("$uurn:doi:{doi}") });
    }

    let mut item_type_field = format!("$a{}", citation.item_type);
    if let Some(license_code) = issn.and_then(|issn| issn_maps.license_code.get(issn)) {
        if license_code == "l" {
            item_type_field.push_str("$zKostenfrei");
        } else {
            tracing::warn!(
                issn = issn.unwrap_or_default(),
                license_code = %license_code,
                "ISSN_to_licence.map contains an ISSN that has not been mapped to \"l\" and we don't know what to do with it"
            );
        }
    }
    if let Some(volume) = &volume {
        item_type_field.push_str(&format!("$v{volume}"));
    }
    fields.push(MarcField { tag: "936".into(), value: item_type_field });

    fields
}

fn format_name(creator: &Creator) -> String {
    match (&creator.last_name, &creator.first_name) {
        (Some(last), Some(first)) => format!("{last}, {first}"),
        (Some(last), None) => last.clone(),
        (None, Some(first)) => first.clone(),
        (None, None) => String::new(),
    }
}

/// Persists the set of delivered fingerprints as one hash per line, loaded
/// eagerly and rewritten atomically on every insert (§4.9 "sidecar file").
pub struct DeliveredFingerprints {
    path: Option<PathBuf>,
    seen: RwLock<HashSet<String>>,
}

impl DeliveredFingerprints {
    pub fn load(path: Option<impl AsRef<Path>>) -> std::io::Result<Self> {
        let path = path.map(|p| p.as_ref().to_path_buf());
        let mut seen = HashSet::new();
        if let Some(path) = &path {
            if let Ok(text) = std::fs::read_to_string(path) {
                seen.extend(text.lines().map(|l| l.to_string()));
            }
        }
        Ok(Self { path, seen: RwLock::new(seen) })
    }

    pub fn contains(&self, fp: &str) -> bool {
        self.seen.read().expect("fingerprint lock poisoned").contains(fp)
    }

    pub fn insert(&self, fp: String) -> std::io::Result<()> {
        let mut seen = self.seen.write().expect("fingerprint lock poisoned");
        if !seen.insert(fp) {
            return Ok(());
        }
        let Some(path) = &self.path else { return Ok(()) };
        let body = seen.iter().cloned().collect::<Vec<_>>().join("\n");
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, path)
    }
}

/// Drains translation results from `results_rx`, dedupes, assigns control
/// numbers, and hands every new record to `sink` (§4.9). Returns the count of
/// records actually emitted (post-dedup).
pub async fn run_pipeline(
    mut results_rx: tokio::sync::mpsc::Receiver<Arc<DownloadResult>>,
    fingerprints: &DeliveredFingerprints,
    control_numbers: &ControlNumberGenerator,
    delivery: &dyn DeliveryTracker,
    issn_maps: &IssnMaps,
    output_format: OutputFormat,
    sink: &mut dyn std::io::Write,
) -> std::io::Result<u64> {
    let mut emitted = 0u64;
    while let Some(result) = results_rx.recv().await {
        if !result.is_success() || result.response_body.trim().is_empty() {
            continue;
        }
        let Ok(citations) = serde_json::from_str::<Vec<Citation>>(&result.response_body) else {
            tracing::warn!(url = %result.url, "translation result was not a citation array, skipping");
            continue;
        };
        for citation in citations {
            let fp = fingerprint(&citation);
            if fingerprints.contains(&fp) {
                continue;
            }
            let control_number = control_numbers.next();
            let record = Record {
                fingerprint: fp.clone(),
                fields: assemble_marc_fields(&citation, &control_number, issn_maps),
                control_number,
            };
            write_record(sink, &record, output_format)?;
            fingerprints.insert(fp)?;
            delivery.record(result.url.as_str(), "live").await;
            emitted += 1;
        }
    }
    Ok(emitted)
}

fn write_record(sink: &mut dyn std::io::Write, record: &Record, format: OutputFormat) -> std::io::Result<()> {
    match format {
        OutputFormat::Json => {
            let fields: Vec<_> = record.fields.iter().map(|f| (f.tag.clone(), f.value.clone())).collect();
            let value = serde_json::json!({
                "control_number": record.control_number,
                "fields": fields,
            });
            writeln!(sink, "{value}")
        }
        OutputFormat::Marcxml | OutputFormat::Marc21 => {
            writeln!(sink, "<record>")?;
            for field in &record.fields {
                writeln!(sink, "  <datafield tag=\"{}\">{}</datafield>", field.tag, field.value)?;
            }
            writeln!(sink, "</record>")
        }
    }
}
