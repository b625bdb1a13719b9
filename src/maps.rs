//! ISSN-keyed enrichment maps and the supported-target allowlist (§4.9,
//! §4.11): per-ISSN overrides for language, license, physical form, SSG,
//! keyword routing, superior PPN and volume, plus an optional
//! `targets.regex` allowlist, loaded from a map-directory of flat
//! `key=value` files the way the original harvester's map loader does.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;

use crate::error::HarvestError;

/// Per-ISSN lookup tables used to enrich a citation the translation server
/// didn't (or couldn't) provide on its own.
#[derive(Debug, Clone, Default)]
pub struct IssnMaps {
    pub ssg: HashMap<String, String>,
    pub keyword_field: HashMap<String, String>,
    pub language_code: HashMap<String, String>,
    pub physical_form: HashMap<String, String>,
    pub superior_ppn: HashMap<String, String>,
    pub volume: HashMap<String, String>,
    pub license_code: HashMap<String, String>,
    pub language_name_to_code: HashMap<String, String>,
}

impl IssnMaps {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads every known map file out of `dir`. A map file that doesn't exist
    /// is treated as empty rather than fatal — not every deployment needs
    /// every kind of enrichment — but a malformed one that does exist is an
    /// error.
    pub fn load(dir: &Path) -> Result<Self, HarvestError> {
        Ok(Self {
            ssg: load_map_file(&dir.join("ISSN_to_SSG.map"))?,
            keyword_field: load_map_file(&dir.join("ISSN_to_keyword_field.map"))?,
            language_code: load_map_file(&dir.join("ISSN_to_language_code.map"))?,
            physical_form: load_map_file(&dir.join("ISSN_to_physical_form.map"))?,
            superior_ppn: load_map_file(&dir.join("ISSN_to_superior_ppn.map"))?,
            volume: load_map_file(&dir.join("ISSN_to_volume.map"))?,
            license_code: load_map_file(&dir.join("ISSN_to_licence.map"))?,
            language_name_to_code: load_map_file(&dir.join("language_to_language_code.map"))?,
        })
    }
}

fn load_map_file(path: &Path) -> Result<HashMap<String, String>, HarvestError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return Ok(HashMap::new()),
    };
    let mut map = HashMap::new();
    for (line_no, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(HarvestError::Configuration(format!(
                "invalid line {} in {}: expected key=value",
                line_no + 1,
                path.display()
            )));
        };
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

/// The `targets.regex` allowlist (§4.11): when present, only URLs matching
/// at least one pattern are harvested at all.
#[derive(Debug, Clone, Default)]
pub struct TargetPatterns(Vec<Regex>);

impl TargetPatterns {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn load(dir: &Path) -> Result<Self, HarvestError> {
        let path = dir.join("targets.regex");
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => return Ok(Self::empty()),
        };
        let mut patterns = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let pattern = Regex::new(line)
                .map_err(|e| HarvestError::Configuration(format!("invalid pattern \"{line}\" in {}: {e}", path.display())))?;
            patterns.push(pattern);
        }
        Ok(Self(patterns))
    }

    /// No configured patterns means no restriction.
    pub fn is_supported(&self, url: &str) -> bool {
        self.0.is_empty() || self.0.iter().any(|p| p.is_match(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_map_directory_files_are_empty_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let maps = IssnMaps::load(dir.path()).unwrap();
        assert!(maps.ssg.is_empty());
    }

    #[test]
    fn parses_key_value_lines_and_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("ISSN_to_SSG.map")).unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "1234-5678=21").unwrap();
        drop(file);
        let maps = IssnMaps::load(dir.path()).unwrap();
        assert_eq!(maps.ssg.get("1234-5678"), Some(&"21".to_string()));
    }

    #[test]
    fn malformed_map_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("ISSN_to_SSG.map")).unwrap();
        writeln!(file, "not a key value line").unwrap();
        drop(file);
        assert!(IssnMaps::load(dir.path()).is_err());
    }

    #[test]
    fn loads_physical_form_map() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("ISSN_to_physical_form.map")).unwrap();
        writeln!(file, "1234-5678=O").unwrap();
        drop(file);
        let maps = IssnMaps::load(dir.path()).unwrap();
        assert_eq!(maps.physical_form.get("1234-5678"), Some(&"O".to_string()));
    }

    #[test]
    fn no_target_patterns_means_everything_is_supported() {
        let dir = tempfile::tempdir().unwrap();
        let patterns = TargetPatterns::load(dir.path()).unwrap();
        assert!(patterns.is_supported("https://example.org/anything"));
    }

    #[test]
    fn configured_patterns_restrict_to_matches() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("targets.regex")).unwrap();
        writeln!(file, "^https://example\\.org/journal/.*$").unwrap();
        drop(file);
        let patterns = TargetPatterns::load(dir.path()).unwrap();
        assert!(patterns.is_supported("https://example.org/journal/42"));
        assert!(!patterns.is_supported("https://other.org/journal/42"));
    }
}
