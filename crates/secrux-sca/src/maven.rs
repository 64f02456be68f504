//! Maven manifest scan: POM and Gradle dependency declarations.

use std::collections::HashMap;
use std::path::Path;

use walkdir::WalkDir;

use crate::model::{line_snippet, MavenPackage, UsageEntry, UsageKind};
use crate::{is_skip_dir, CapTracker, SNIPPET_MAX_LEN};

/// Scan POM and Gradle files for declarations of the given packages. The
/// caller admits the returned entries against the caps.
pub(crate) fn scan_manifests(
    scan_root: &Path,
    packages: &[MavenPackage],
    caps: &mut CapTracker,
) -> Vec<UsageEntry> {
    if packages.is_empty() {
        return Vec::new();
    }
    let mut key_lookup: HashMap<String, String> = HashMap::new();
    for package in packages {
        let key = package.key.trim();
        if !key.is_empty() {
            key_lookup.insert(key.to_lowercase(), key.to_string());
        }
    }
    if key_lookup.is_empty() {
        return Vec::new();
    }

    let mut entries = Vec::new();
    let walker = WalkDir::new(scan_root)
        .into_iter()
        .filter_entry(|entry| !(entry.file_type().is_dir() && is_skip_dir(entry.file_name())));
    for entry in walker {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        if !caps.has_file_budget() {
            break;
        }
        let base = entry.file_name().to_string_lossy().to_lowercase();
        let is_pom = base == "pom.xml";
        let is_gradle = matches!(
            base.as_str(),
            "build.gradle" | "build.gradle.kts" | "settings.gradle" | "settings.gradle.kts"
        );
        if !is_pom && !is_gradle {
            continue;
        }
        let Ok(raw) = std::fs::read(entry.path()) else { continue };
        caps.file_scanned();

        let rel = crate::token_scan::relative_slash_path(scan_root, entry.path());
        let content = String::from_utf8_lossy(&raw);
        let lines: Vec<String> = content.lines().map(str::to_string).collect();

        if is_pom {
            entries.extend(scan_pom_lines(&lines, &rel, &key_lookup));
        } else {
            entries.extend(scan_gradle_lines(&lines, &rel, &key_lookup));
        }
    }
    entries
}

/// Line-oriented POM walk: remember the most recent `<groupId>`, probe
/// `group:artifact` on every `<artifactId>`.
fn scan_pom_lines(
    lines: &[String],
    rel: &str,
    key_lookup: &HashMap<String, String>,
) -> Vec<UsageEntry> {
    let mut entries = Vec::new();
    let mut last_group = String::new();
    let mut last_group_line = 0usize;
    for (index, raw) in lines.iter().enumerate() {
        let line_no = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(group) = extract_xml_tag_value(trimmed, "groupId") {
            last_group = group;
            last_group_line = line_no;
            continue;
        }
        if let Some(artifact) = extract_xml_tag_value(trimmed, "artifactId") {
            if last_group.is_empty() {
                continue;
            }
            let probe = format!("{}:{}", last_group.trim(), artifact.trim()).to_lowercase();
            if let Some(key) = key_lookup.get(&probe) {
                entries.push(UsageEntry {
                    ecosystem: "maven".to_string(),
                    key: key.clone(),
                    file: rel.to_string(),
                    line: line_no,
                    kind: UsageKind::Manifest,
                    snippet: line_snippet(lines, line_no, SNIPPET_MAX_LEN),
                    language: "xml".to_string(),
                    symbol: key.clone(),
                    receiver: String::new(),
                    callee: String::new(),
                    start_line: last_group_line,
                    start_col: 1,
                    end_line: line_no,
                    end_col: 1,
                    confidence: 0.7,
                });
            }
        }
    }
    entries
}

/// Gradle files get a simple substring probe per key.
fn scan_gradle_lines(
    lines: &[String],
    rel: &str,
    key_lookup: &HashMap<String, String>,
) -> Vec<UsageEntry> {
    let mut entries = Vec::new();
    for (index, raw) in lines.iter().enumerate() {
        let line_no = index + 1;
        let lower = raw.to_lowercase();
        for (key_lower, key) in key_lookup {
            if !lower.contains(key_lower.as_str()) {
                continue;
            }
            entries.push(UsageEntry {
                ecosystem: "maven".to_string(),
                key: key.clone(),
                file: rel.to_string(),
                line: line_no,
                kind: UsageKind::Manifest,
                snippet: line_snippet(lines, line_no, SNIPPET_MAX_LEN),
                language: "gradle".to_string(),
                symbol: key.clone(),
                receiver: String::new(),
                callee: String::new(),
                start_line: line_no,
                start_col: 1,
                end_line: line_no,
                end_col: 1,
                confidence: 0.75,
            });
        }
    }
    entries
}

/// Extract `<tag>value</tag>` from a single line.
fn extract_xml_tag_value(line: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = line.find(&open)? + open.len();
    let end = line[start..].find(&close)?;
    let value = line[start..start + end].trim();
    (!value.is_empty()).then(|| value.to_string())
}
