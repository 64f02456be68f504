//! Token-based multi-ecosystem scan for non-Maven packages.

use std::collections::HashMap;
use std::path::Path;

use walkdir::WalkDir;

use crate::model::{line_snippet, UsageEntry, UsageKind, UsagePackage};
use crate::{is_skip_dir, CapTracker, MAX_FILE_BYTES, SNIPPET_MAX_LEN};

/// Longest-first token list is capped here.
const MAX_TOKENS: usize = 400;
/// Lines longer than this are ignored.
const MAX_LINE_BYTES: usize = 256 * 1024;

/// Scan the tree for case-insensitive token occurrences and emit entries for
/// every package associated with a matching token.
pub(crate) fn scan_tokens(
    scan_root: &Path,
    packages: &[UsagePackage],
    caps: &mut CapTracker,
    entries: &mut Vec<UsageEntry>,
) {
    let mut token_to_packages: HashMap<String, Vec<usize>> = HashMap::new();
    let mut tokens: Vec<String> = Vec::new();
    for (index, package) in packages.iter().enumerate() {
        for token in &package.tokens {
            let token = token.trim().to_lowercase();
            if token.is_empty() {
                continue;
            }
            token_to_packages
                .entry(token.clone())
                .or_insert_with(|| {
                    tokens.push(token.clone());
                    Vec::new()
                })
                .push(index);
        }
    }
    if tokens.is_empty() {
        return;
    }
    tokens.sort_by(|a, b| b.len().cmp(&a.len()));
    tokens.truncate(MAX_TOKENS);

    let walker = WalkDir::new(scan_root)
        .into_iter()
        .filter_entry(|entry| !(entry.file_type().is_dir() && is_skip_dir(entry.file_name())));
    for entry in walker {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        if caps.total_reached() || !caps.has_file_budget() {
            break;
        }
        let path = entry.path();
        if !is_relevant_file(path) {
            continue;
        }
        if entry.metadata().map(|m| m.len()).unwrap_or(0) > MAX_FILE_BYTES {
            continue;
        }
        let Ok(raw) = std::fs::read(path) else { continue };
        caps.file_scanned();

        let rel = relative_slash_path(scan_root, path);
        let content = String::from_utf8_lossy(&raw);
        let lines: Vec<String> = content.lines().map(str::to_string).collect();

        for (line_index, raw_line) in lines.iter().enumerate() {
            if caps.total_reached() {
                break;
            }
            if raw_line.trim().is_empty() || raw_line.len() > MAX_LINE_BYTES {
                continue;
            }
            let lower = raw_line.to_lowercase();
            for token in &tokens {
                if !lower.contains(token.as_str()) {
                    continue;
                }
                for &package_index in &token_to_packages[token] {
                    let package = &packages[package_index];
                    if !caps.admit(&package.key) {
                        continue;
                    }
                    entries.push(UsageEntry::token_match(
                        &package.ecosystem,
                        &package.key,
                        &rel,
                        line_index + 1,
                        kind_for_line(path, raw_line),
                        line_snippet(&lines, line_index + 1, SNIPPET_MAX_LEN),
                    ));
                    if caps.total_reached() {
                        break;
                    }
                }
            }
        }
    }
}

pub(crate) fn relative_slash_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Manifests by basename, source files by extension.
fn is_relevant_file(path: &Path) -> bool {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if matches!(
        base.as_str(),
        "pom.xml"
            | "build.gradle"
            | "build.gradle.kts"
            | "settings.gradle"
            | "settings.gradle.kts"
            | "package.json"
            | "package-lock.json"
            | "yarn.lock"
            | "pnpm-lock.yaml"
            | "go.mod"
            | "go.sum"
            | "requirements.txt"
            | "poetry.lock"
            | "cargo.toml"
            | "cargo.lock"
            | "gemfile"
    ) {
        return true;
    }
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    matches!(
        ext.as_str(),
        "java" | "kt" | "kts" | "go" | "js" | "jsx" | "ts" | "tsx" | "py" | "rb" | "php" | "cs"
            | "rs" | "xml" | "yml" | "yaml"
    )
}

fn kind_for_line(path: &Path, line: &str) -> UsageKind {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if base == "pom.xml"
        || base.ends_with(".gradle")
        || base.ends_with(".gradle.kts")
        || base == "package.json"
        || base.ends_with(".lock")
        || base == "go.mod"
        || base == "requirements.txt"
    {
        return UsageKind::Manifest;
    }
    let trimmed = line.trim();
    if trimmed.starts_with("import ") || trimmed.starts_with("import\t") {
        return UsageKind::Import;
    }
    if trimmed.contains("require(") || trimmed.contains("from \"") || trimmed.contains("from '") {
        return UsageKind::Import;
    }
    UsageKind::Code
}
