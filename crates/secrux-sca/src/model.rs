//! Usage-index output model.
//!
//! The index is attached to a Trivy task result as the `usage-index`
//! artifact; field names and omission rules follow that contract.

use serde::{Deserialize, Serialize};

/// The emitted artifact: when and what was scanned, plus every correlation
/// found.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageIndex {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generated_at: String,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub scanned_files: usize,
    pub entries: Vec<UsageEntry>,
}

impl UsageIndex {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What a usage entry records about an occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    Import,
    Manifest,
    Code,
    New,
    Call,
    Type,
    Annotation,
}

/// One correlation between a vulnerable package and a source location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ecosystem: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    /// Repo-relative, slash-separated path.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file: String,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub line: usize,
    pub kind: UsageKind,
    /// Trimmed source line, at most 400 characters.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snippet: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub symbol: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub receiver: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub callee: String,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub start_line: usize,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub start_col: usize,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub end_line: usize,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub end_col: usize,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub confidence: f64,
}

impl UsageEntry {
    /// A bare token-scan entry: location and kind only.
    pub(crate) fn token_match(
        ecosystem: &str,
        key: &str,
        file: &str,
        line: usize,
        kind: UsageKind,
        snippet: String,
    ) -> Self {
        Self {
            ecosystem: ecosystem.to_string(),
            key: key.to_string(),
            file: file.to_string(),
            line,
            kind,
            snippet,
            language: String::new(),
            symbol: String::new(),
            receiver: String::new(),
            callee: String::new(),
            start_line: 0,
            start_col: 0,
            end_line: 0,
            end_col: 0,
            confidence: 0.0,
        }
    }
}

/// A vulnerable dependency distilled from the Trivy report.
#[derive(Debug, Clone)]
pub struct UsagePackage {
    pub ecosystem: String,
    pub key: String,
    /// Lowercase-deduplicated scan tokens, each at least four characters.
    pub tokens: Vec<String>,
}

/// A Maven package split into coordinates.
#[derive(Debug, Clone)]
pub struct MavenPackage {
    pub key: String,
    pub group_id: String,
    pub artifact: String,
    pub ecosystem: String,
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

/// Trim a source line into a snippet of at most `max_len` characters.
pub(crate) fn line_snippet(lines: &[String], line: usize, max_len: usize) -> String {
    if line == 0 || line > lines.len() {
        return String::new();
    }
    let snippet = lines[line - 1].trim();
    snippet.chars().take(max_len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_serialization_omits_empty_fields() {
        let entry = UsageEntry::token_match("npm", "lodash", "src/a.js", 3, UsageKind::Import, "import _ from 'lodash'".into());
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["kind"], "import");
        assert_eq!(value["line"], 3);
        assert!(value.get("confidence").is_none());
        assert!(value.get("language").is_none());
        assert!(value.get("startLine").is_none());
    }

    #[test]
    fn test_line_snippet_bounds() {
        let lines = vec!["  hello world  ".to_string()];
        assert_eq!(line_snippet(&lines, 1, 400), "hello world");
        assert_eq!(line_snippet(&lines, 2, 400), "");
        assert_eq!(line_snippet(&lines, 0, 400), "");
        assert_eq!(line_snippet(&lines, 1, 5), "hello");
    }
}
