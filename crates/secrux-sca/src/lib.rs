//! # secrux-sca
//!
//! SCA usage-index pipeline: correlates Trivy vulnerability findings to
//! concrete source-code occurrences across a scanned tree. Non-Maven
//! packages get a token scan over manifests and source files; Maven packages
//! additionally get a manifest coordinate scan and an AST-assisted Java
//! occurrence scan.

pub mod java;
pub mod model;
pub mod packages;

mod maven;
mod token_scan;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};

pub use model::{UsageEntry, UsageIndex, UsageKind, UsagePackage};

/// Distinct packages taken from the vulnerability report.
const MAX_PACKAGES: usize = 200;
/// Entries per package key.
const MAX_PER_KEY: usize = 20;
/// Entries overall.
const MAX_TOTAL_ENTRIES: usize = 2000;
/// Files opened across all scan phases.
const MAX_FILES: usize = 5000;
/// Files larger than this are skipped.
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;
/// Snippets are trimmed to this many characters.
const SNIPPET_MAX_LEN: usize = 400;

/// Build the usage index for a completed filesystem scan.
///
/// Returns `None` when the report yields no scannable packages or the scan
/// finds no occurrences; an empty index is never emitted.
pub fn build_usage_index(scan_root: &Path, vuln_payload: &str) -> Result<Option<UsageIndex>> {
    let packages = packages::extract_usage_packages(vuln_payload, MAX_PACKAGES)?;
    if packages.is_empty() {
        return Ok(None);
    }

    let maven_packages = packages::extract_maven_packages(&packages);
    let token_packages: Vec<UsagePackage> = packages
        .iter()
        .filter(|p| !p.ecosystem.eq_ignore_ascii_case("maven"))
        .cloned()
        .collect();

    let mut caps = CapTracker::new();
    let mut entries: Vec<UsageEntry> = Vec::new();

    token_scan::scan_tokens(scan_root, &token_packages, &mut caps, &mut entries);

    for entry in maven::scan_manifests(scan_root, &maven_packages, &mut caps) {
        if caps.total_reached() {
            break;
        }
        if caps.admit(&entry.key) {
            entries.push(entry);
        }
    }

    let extractor = java::ast::AstExtractor;
    for entry in java::scan_java_usage(scan_root, &maven_packages, &extractor, &mut caps) {
        if caps.total_reached() {
            break;
        }
        if caps.admit(&entry.key) {
            entries.push(entry);
        }
    }

    if entries.is_empty() {
        return Ok(None);
    }

    Ok(Some(UsageIndex {
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        scanned_files: caps.files_scanned(),
        entries,
    }))
}

/// Enforces the emission caps shared by all scan phases.
pub(crate) struct CapTracker {
    per_key: HashMap<String, usize>,
    total: usize,
    files: usize,
}

impl CapTracker {
    pub(crate) fn new() -> Self {
        Self {
            per_key: HashMap::new(),
            total: 0,
            files: 0,
        }
    }

    /// Whether an entry for `key` may be emitted; counts it if so.
    pub(crate) fn admit(&mut self, key: &str) -> bool {
        if self.total >= MAX_TOTAL_ENTRIES {
            return false;
        }
        let count = self.per_key.entry(key.to_string()).or_insert(0);
        if *count >= MAX_PER_KEY {
            return false;
        }
        *count += 1;
        self.total += 1;
        true
    }

    pub(crate) fn total_reached(&self) -> bool {
        self.total >= MAX_TOTAL_ENTRIES
    }

    pub(crate) fn has_file_budget(&self) -> bool {
        self.files < MAX_FILES
    }

    pub(crate) fn file_scanned(&mut self) {
        self.files += 1;
    }

    pub(crate) fn files_scanned(&self) -> usize {
        self.files
    }
}

/// Build, VCS and IDE directories that never hold interesting usages.
pub(crate) fn is_skip_dir(name: &OsStr) -> bool {
    matches!(
        name.to_string_lossy().as_ref(),
        ".git" | ".svn" | ".hg" | ".idea" | ".vscode" | ".gradle" | "node_modules" | "vendor"
            | "target" | "build" | "dist" | "out" | ".next"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_tracker_limits() {
        let mut caps = CapTracker::new();
        for _ in 0..MAX_PER_KEY {
            assert!(caps.admit("k1"));
        }
        assert!(!caps.admit("k1"));
        assert!(caps.admit("k2"));
    }

    #[test]
    fn test_skip_dirs() {
        assert!(is_skip_dir(OsStr::new("node_modules")));
        assert!(is_skip_dir(OsStr::new(".git")));
        assert!(!is_skip_dir(OsStr::new("src")));
    }
}
