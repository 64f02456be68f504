//! Java occurrence extraction.
//!
//! Correlates Maven groups to concrete Java usage sites: imports, type
//! declarations, object creation, method calls and annotations. Extraction
//! goes through the [`JavaOccurrenceExtractor`] capability; the tree-sitter
//! implementation is preferred and the lexer-based heuristic stands in when
//! parsing yields nothing.

pub mod ast;
pub mod heuristic;
pub(crate) mod lexer;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use walkdir::WalkDir;

use crate::model::{line_snippet, MavenPackage, UsageEntry, UsageKind};
use crate::packages::unique_tokens;
use crate::{is_skip_dir, CapTracker, MAX_FILE_BYTES, SNIPPET_MAX_LEN};

/// Java files are read up to this many lines.
const MAX_JAVA_LINES: usize = 4000;

/// One `import` declaration.
#[derive(Debug, Clone)]
pub struct JavaImport {
    pub target: String,
    pub is_static: bool,
    pub is_wildcard: bool,
    pub line: usize,
}

/// One extracted usage site inside a Java file.
#[derive(Debug, Clone)]
pub struct JavaOccurrence {
    pub group_id: String,
    pub line: usize,
    pub col: usize,
    pub end_line: usize,
    pub end_col: usize,
    pub kind: UsageKind,
    pub snippet: String,
    pub symbol: String,
    pub receiver: String,
    pub callee: String,
    pub confidence: f64,
}

/// Capability interface over the two extraction strategies. Both produce
/// identically shaped occurrences.
pub trait JavaOccurrenceExtractor: Send + Sync {
    fn extract(
        &self,
        src: &str,
        lines: &[String],
        imports: &[JavaImport],
        group_ids: &[String],
    ) -> Vec<JavaOccurrence>;
}

/// Walk the tree for `.java` files and emit usage entries for every matched
/// import and occurrence.
pub(crate) fn scan_java_usage(
    scan_root: &Path,
    packages: &[MavenPackage],
    extractor: &dyn JavaOccurrenceExtractor,
    caps: &mut CapTracker,
) -> Vec<UsageEntry> {
    let mut group_to_keys: HashMap<String, Vec<String>> = HashMap::new();
    let mut group_ids: Vec<String> = Vec::new();
    for package in packages {
        let group = package.group_id.trim().to_lowercase();
        if group.is_empty() {
            continue;
        }
        group_to_keys
            .entry(group.clone())
            .or_insert_with(|| {
                group_ids.push(group.clone());
                Vec::new()
            })
            .push(package.key.clone());
    }
    if group_ids.is_empty() {
        return Vec::new();
    }
    for keys in group_to_keys.values_mut() {
        *keys = unique_tokens(std::mem::take(keys));
    }
    // Longest groups first so the most specific prefix wins.
    group_ids.sort_by(|a, b| b.len().cmp(&a.len()));

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
        let is_java = entry
            .path()
            .extension()
            .map(|e| e.to_string_lossy().eq_ignore_ascii_case("java"))
            .unwrap_or(false);
        if !is_java {
            continue;
        }
        if entry.metadata().map(|m| m.len()).unwrap_or(0) > MAX_FILE_BYTES {
            continue;
        }
        let Ok(raw) = std::fs::read(entry.path()) else { continue };
        caps.file_scanned();

        let rel = crate::token_scan::relative_slash_path(scan_root, entry.path());
        let text = String::from_utf8_lossy(&raw);
        let lines: Vec<String> = text.lines().take(MAX_JAVA_LINES).map(str::to_string).collect();
        if lines.is_empty() {
            continue;
        }
        let content = lines.join("\n");

        let (imports, mut matched_groups) = scan_java_imports(&lines, &group_ids);
        if matched_groups.is_empty() {
            // No matching import; admit the file only if a fully qualified
            // reference appears somewhere.
            let lower = content.to_lowercase();
            for group in &group_ids {
                if lower.contains(&format!("{group}.")) {
                    matched_groups.insert(group.clone());
                }
            }
            if matched_groups.is_empty() {
                continue;
            }
        }

        let occurrences = extractor.extract(&content, &lines, &imports, &group_ids);
        if occurrences.is_empty() && imports.is_empty() {
            continue;
        }

        for import in &imports {
            let group = match_group_id(&group_ids, &import.target);
            if group.is_empty() {
                continue;
            }
            for key in &group_to_keys[&group] {
                entries.push(UsageEntry {
                    ecosystem: "maven".to_string(),
                    key: key.clone(),
                    file: rel.clone(),
                    line: import.line,
                    kind: UsageKind::Import,
                    snippet: line_snippet(&lines, import.line, SNIPPET_MAX_LEN),
                    language: "java".to_string(),
                    symbol: import.target.clone(),
                    receiver: String::new(),
                    callee: String::new(),
                    start_line: import.line,
                    start_col: 1,
                    end_line: import.line,
                    end_col: 1,
                    confidence: 0.9,
                });
            }
        }

        for occurrence in &occurrences {
            let Some(keys) = group_to_keys.get(&occurrence.group_id) else {
                continue;
            };
            for key in keys {
                entries.push(UsageEntry {
                    ecosystem: "maven".to_string(),
                    key: key.clone(),
                    file: rel.clone(),
                    line: occurrence.line,
                    kind: occurrence.kind,
                    snippet: occurrence.snippet.clone(),
                    language: "java".to_string(),
                    symbol: occurrence.symbol.clone(),
                    receiver: occurrence.receiver.clone(),
                    callee: occurrence.callee.clone(),
                    start_line: occurrence.line,
                    start_col: occurrence.col,
                    end_line: or_nonzero(occurrence.end_line, occurrence.line),
                    end_col: or_nonzero(occurrence.end_col, occurrence.col),
                    confidence: occurrence.confidence,
                });
            }
        }
    }
    entries
}

/// Parse import declarations and note which groups they touch.
pub(crate) fn scan_java_imports(
    lines: &[String],
    group_ids: &[String],
) -> (Vec<JavaImport>, HashSet<String>) {
    let mut imports = Vec::new();
    let mut matched_groups = HashSet::new();
    for (index, line) in lines.iter().enumerate() {
        let raw = line.trim();
        let Some(rest) = raw.strip_prefix("import ") else {
            continue;
        };
        let mut rest = rest.trim();
        let is_static = match rest.strip_prefix("static ") {
            Some(after) => {
                rest = after.trim();
                true
            }
            None => false,
        };
        let Some(target) = rest.strip_suffix(';') else {
            continue;
        };
        let target = target.trim();
        if target.is_empty() {
            continue;
        }
        let is_wildcard = target.ends_with(".*");
        imports.push(JavaImport {
            target: target.to_string(),
            is_static,
            is_wildcard,
            line: index + 1,
        });
        let group = match_group_id(group_ids, target);
        if !group.is_empty() {
            matched_groups.insert(group);
        }
    }
    (imports, matched_groups)
}

/// Maps built from the import list: simple type name -> group, and static
/// member -> group.
pub(crate) fn build_import_maps(
    imports: &[JavaImport],
    group_ids: &[String],
) -> (HashMap<String, String>, HashMap<String, String>) {
    let mut type_to_group = HashMap::new();
    let mut static_member_to_group = HashMap::new();
    for import in imports {
        let group = match_group_id(group_ids, &import.target);
        if group.is_empty() || import.is_wildcard {
            continue;
        }
        if import.is_static {
            let (_, member) = split_owner_and_member(&import.target);
            if !member.is_empty() {
                static_member_to_group.insert(member, group);
            }
        } else {
            let simple = last_segment(&import.target);
            if !simple.is_empty() {
                type_to_group.insert(simple, group);
            }
        }
    }
    (type_to_group, static_member_to_group)
}

/// Greedy prefix match of a dotted value against the group list (which is
/// sorted longest first).
pub(crate) fn match_group_id(group_ids: &[String], value: &str) -> String {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return String::new();
    }
    for group in group_ids {
        if value == *group || value.starts_with(&format!("{group}.")) {
            return group.clone();
        }
    }
    String::new()
}

/// Resolve a type name: fully qualified names match group prefixes, simple
/// names go through the import map.
pub(crate) fn resolve_symbol_group(
    symbol: &str,
    group_ids: &[String],
    type_to_group: &HashMap<String, String>,
) -> String {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return String::new();
    }
    if symbol.contains('.') {
        return match_group_id(group_ids, symbol);
    }
    type_to_group.get(symbol).cloned().unwrap_or_default()
}

/// Resolve a call receiver to a group with a confidence reflecting how it
/// was resolved: fully qualified 0.9, imported type 0.75, variable binding
/// 0.65.
pub(crate) fn resolve_receiver_group(
    receiver: &str,
    group_ids: &[String],
    type_to_group: &HashMap<String, String>,
    var_to_group: &HashMap<String, String>,
) -> (String, f64) {
    let receiver = receiver.trim();
    if receiver.is_empty() {
        return (String::new(), 0.0);
    }
    if receiver.contains('.') {
        let group = match_group_id(group_ids, receiver);
        if !group.is_empty() {
            return (group, 0.9);
        }
        let last = last_segment(receiver);
        if let Some(group) = var_to_group.get(&last) {
            return (group.clone(), 0.65);
        }
        if let Some(group) = type_to_group.get(&last) {
            return (group.clone(), 0.75);
        }
        return (String::new(), 0.0);
    }
    if let Some(group) = var_to_group.get(receiver) {
        return (group.clone(), 0.65);
    }
    if let Some(group) = type_to_group.get(receiver) {
        return (group.clone(), 0.75);
    }
    (String::new(), 0.0)
}

pub(crate) fn last_segment(value: &str) -> String {
    let value = value.trim();
    match value.rfind('.') {
        Some(index) if index + 1 < value.len() => value[index + 1..].to_string(),
        _ => value.to_string(),
    }
}

pub(crate) fn split_owner_and_member(target: &str) -> (String, String) {
    let target = target.trim();
    match target.rfind('.') {
        Some(index) if index + 1 < target.len() => (
            target[..index].to_string(),
            target[index + 1..].to_string(),
        ),
        _ => (String::new(), String::new()),
    }
}

/// Strip annotations, generics, array suffixes and varargs from a type name.
pub(crate) fn normalize_type_name(raw: &str) -> String {
    let mut raw = raw.trim();
    while raw.starts_with('@') {
        match raw.find(' ') {
            Some(space) => raw = raw[space + 1..].trim_start(),
            None => return String::new(),
        }
    }
    let mut name = match raw.find('<') {
        Some(index) => &raw[..index],
        None => raw,
    }
    .trim();
    while let Some(stripped) = name.strip_suffix("[]") {
        name = stripped.trim_end();
    }
    name.strip_suffix("...").unwrap_or(name).trim().to_string()
}

fn or_nonzero(value: usize, fallback: usize) -> usize {
    if value != 0 {
        value
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_lines(src: &str) -> Vec<String> {
        src.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_import_parsing() {
        let lines = to_lines(
            "package a;\n\
             import org.apache.commons.lang3.StringUtils;\n\
             import static org.junit.Assert.assertEquals;\n\
             import org.apache.commons.io.*;\n\
             import broken\n",
        );
        let groups = vec!["org.apache.commons".to_string()];
        let (imports, matched) = scan_java_imports(&lines, &groups);
        assert_eq!(imports.len(), 3);
        assert_eq!(imports[0].line, 2);
        assert!(!imports[0].is_static);
        assert!(imports[1].is_static);
        assert!(imports[2].is_wildcard);
        assert!(matched.contains("org.apache.commons"));
    }

    #[test]
    fn test_group_matching_prefers_longest() {
        let groups = vec!["org.apache.commons.io".to_string(), "org.apache.commons".to_string()];
        assert_eq!(
            match_group_id(&groups, "org.apache.commons.io.FileUtils"),
            "org.apache.commons.io"
        );
        assert_eq!(
            match_group_id(&groups, "org.apache.commons.lang3.StringUtils"),
            "org.apache.commons"
        );
        assert_eq!(match_group_id(&groups, "com.example.Foo"), "");
        // A group name must match on a dot boundary.
        assert_eq!(match_group_id(&groups, "org.apache.commonsx.Foo"), "");
    }

    #[test]
    fn test_normalize_type_name() {
        assert_eq!(normalize_type_name("List<String>"), "List");
        assert_eq!(normalize_type_name("String[]"), "String");
        assert_eq!(normalize_type_name("@Nonnull Foo"), "Foo");
        assert_eq!(normalize_type_name("Object..."), "Object");
        assert_eq!(normalize_type_name("Map<String, List<Integer>>[]"), "Map");
    }

    #[test]
    fn test_segments() {
        assert_eq!(last_segment("a.b.C"), "C");
        assert_eq!(last_segment("C"), "C");
        assert_eq!(
            split_owner_and_member("org.junit.Assert.assertEquals"),
            ("org.junit.Assert".to_string(), "assertEquals".to_string())
        );
        assert_eq!(split_owner_and_member("plain"), (String::new(), String::new()));
    }
}
