//! Package extraction from the Trivy vulnerability report.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::{MavenPackage, UsagePackage};

/// Shortest token worth scanning for.
const MIN_TOKEN_LEN: usize = 4;
/// Maven artifact names are common words; require more length.
const MIN_ARTIFACT_TOKEN_LEN: usize = 6;

#[derive(Debug, Default, Deserialize)]
struct TrivyReport {
    #[serde(default, rename = "Results")]
    results: Vec<TrivyResult>,
}

#[derive(Debug, Default, Deserialize)]
struct TrivyResult {
    #[serde(default, rename = "Type")]
    result_type: String,
    #[serde(default, rename = "Vulnerabilities")]
    vulnerabilities: Vec<TrivyVulnerability>,
}

#[derive(Debug, Default, Deserialize)]
struct TrivyVulnerability {
    #[serde(default, rename = "PkgName")]
    pkg_name: String,
    #[serde(default, rename = "PkgIdentifier")]
    pkg_identifier: Option<PkgIdentifier>,
}

#[derive(Debug, Default, Deserialize)]
struct PkgIdentifier {
    #[serde(default, rename = "PURL", alias = "Purl", alias = "purl")]
    purl: String,
}

/// Distil the report into at most `limit` distinct packages with scan
/// tokens. Packages seen twice merge their tokens.
pub fn extract_usage_packages(vuln_payload: &str, limit: usize) -> Result<Vec<UsagePackage>> {
    let report: TrivyReport =
        serde_json::from_str(vuln_payload).context("parsing trivy vulnerability report")?;

    let mut seen: HashMap<String, UsagePackage> = HashMap::new();
    for result in &report.results {
        for vuln in &result.vulnerabilities {
            let pkg_name = vuln.pkg_name.trim();
            let purl = vuln
                .pkg_identifier
                .as_ref()
                .map(|id| id.purl.trim())
                .unwrap_or_default();
            let ecosystem = detect_ecosystem(purl, &result.result_type);
            let key = if pkg_name.is_empty() { purl } else { pkg_name };
            if key.is_empty() {
                continue;
            }
            let key_lower = key.to_lowercase();
            if !seen.contains_key(&key_lower) && seen.len() >= limit {
                continue;
            }
            let tokens = derive_usage_tokens(&ecosystem, pkg_name, purl);
            if tokens.is_empty() {
                continue;
            }
            match seen.get_mut(&key_lower) {
                Some(existing) => existing.tokens = merge_tokens(&existing.tokens, &tokens),
                None => {
                    seen.insert(
                        key_lower,
                        UsagePackage {
                            ecosystem,
                            key: key.to_string(),
                            tokens,
                        },
                    );
                }
            }
        }
    }

    let mut packages: Vec<UsagePackage> = seen.into_values().collect();
    packages.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(packages)
}

/// Split the Maven packages out into coordinates, dropping anything without
/// both a group and an artifact.
pub fn extract_maven_packages(packages: &[UsagePackage]) -> Vec<MavenPackage> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for package in packages {
        if !package.ecosystem.eq_ignore_ascii_case("maven") {
            continue;
        }
        let key = package.key.trim();
        if key.is_empty() || !seen.insert(key.to_lowercase()) {
            continue;
        }
        let Some((group, artifact)) = parse_maven_coords(key) else {
            continue;
        };
        out.push(MavenPackage {
            key: key.to_string(),
            group_id: group,
            artifact,
            ecosystem: package.ecosystem.clone(),
        });
    }
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

/// Parse `group:artifact` or `pkg:maven/group/artifact@version` coordinates.
pub fn parse_maven_coords(key: &str) -> Option<(String, String)> {
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    if let Some(coords) = key.to_lowercase().strip_prefix("pkg:maven/") {
        let coords = coords.split('@').next().unwrap_or_default();
        let mut parts = coords.split('/');
        let group = parts.next().unwrap_or_default().trim().to_string();
        let artifact = parts.next().unwrap_or_default().trim().to_string();
        if group.is_empty() || artifact.is_empty() {
            return None;
        }
        return Some((group, artifact));
    }
    let mut parts = key.split(':');
    let group = parts.next().unwrap_or_default().trim().to_string();
    let artifact = parts.next().unwrap_or_default().trim().to_string();
    if group.is_empty() || artifact.is_empty() {
        return None;
    }
    Some((group, artifact))
}

fn detect_ecosystem(purl: &str, result_type: &str) -> String {
    let lower = purl.trim().to_lowercase();
    for (prefix, ecosystem) in [
        ("pkg:maven/", "maven"),
        ("pkg:npm/", "npm"),
        ("pkg:golang/", "golang"),
        ("pkg:pypi/", "pypi"),
        ("pkg:gem/", "gem"),
    ] {
        if lower.starts_with(prefix) {
            return ecosystem.to_string();
        }
    }
    result_type.trim().to_lowercase()
}

/// Derive lowercase-comparable scan tokens for one package.
fn derive_usage_tokens(ecosystem: &str, pkg_name: &str, purl: &str) -> Vec<String> {
    let purl_lower = purl.trim().to_lowercase();
    let mut tokens = Vec::new();
    let mut add = |value: &str| {
        let value = value.trim();
        if value.len() >= MIN_TOKEN_LEN {
            tokens.push(value.to_string());
        }
    };

    if ecosystem.eq_ignore_ascii_case("maven") {
        let mut add_coords = |group: &str, artifact: &str| {
            // Bare group names are too generic without a dotted namespace.
            if group.contains('.') {
                add(group);
            }
            if artifact.len() >= MIN_ARTIFACT_TOKEN_LEN {
                add(artifact);
            }
        };
        if let Some((group, artifact)) = parse_maven_coords(pkg_name) {
            add_coords(&group, &artifact);
        }
        if purl_lower.starts_with("pkg:maven/") {
            if let Some((group, artifact)) = parse_maven_coords(&purl_lower) {
                add_coords(&group, &artifact);
            }
        }
        return unique_tokens(tokens);
    }

    if !pkg_name.is_empty() {
        add(pkg_name);
    }
    match ecosystem.to_lowercase().as_str() {
        "golang" => {
            if let Some(module) = purl_lower.strip_prefix("pkg:golang/") {
                add(module.split('@').next().unwrap_or_default());
            }
        }
        "npm" => {
            if let Some(name) = purl_lower.strip_prefix("pkg:npm/") {
                add(name.split('@').next().unwrap_or_default());
            }
        }
        _ => {}
    }
    unique_tokens(tokens)
}

fn merge_tokens(a: &[String], b: &[String]) -> Vec<String> {
    unique_tokens(a.iter().chain(b.iter()).cloned().collect())
}

/// De-duplicate case-insensitively, preserving first-seen spelling.
pub(crate) fn unique_tokens(tokens: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(tokens.len());
    for token in tokens {
        let token = token.trim().to_string();
        if token.is_empty() || !seen.insert(token.to_lowercase()) {
            continue;
        }
        out.push(token);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(vulns: serde_json::Value) -> String {
        serde_json::json!({"Results": [{"Type": "jar", "Vulnerabilities": vulns}]}).to_string()
    }

    #[test]
    fn test_maven_tokens_from_pkgname_and_purl() {
        let payload = report(serde_json::json!([{
            "PkgName": "org.apache.commons:commons-lang3",
            "PkgIdentifier": {"PURL": "pkg:maven/org.apache.commons/commons-lang3@3.8"}
        }]));
        let packages = extract_usage_packages(&payload, 200).unwrap();
        assert_eq!(packages.len(), 1);
        let package = &packages[0];
        assert_eq!(package.ecosystem, "maven");
        assert_eq!(package.key, "org.apache.commons:commons-lang3");
        assert!(package.tokens.iter().any(|t| t == "org.apache.commons"));
        assert!(package.tokens.iter().any(|t| t == "commons-lang3"));
    }

    #[test]
    fn test_short_tokens_are_dropped() {
        // Group without a dot and a five-char artifact produce nothing.
        let payload = report(serde_json::json!([{
            "PkgName": "junit:junit",
            "PkgIdentifier": {"PURL": "pkg:maven/junit/junit@4.12"}
        }]));
        let packages = extract_usage_packages(&payload, 200).unwrap();
        assert!(packages.is_empty());
    }

    #[test]
    fn test_npm_purl_name_token() {
        let payload = serde_json::json!({"Results": [{"Type": "npm", "Vulnerabilities": [{
            "PkgName": "lodash",
            "PkgIdentifier": {"purl": "pkg:npm/lodash@4.17.0"}
        }]}]})
        .to_string();
        let packages = extract_usage_packages(&payload, 200).unwrap();
        assert_eq!(packages[0].ecosystem, "npm");
        assert_eq!(packages[0].tokens, vec!["lodash".to_string()]);
    }

    #[test]
    fn test_ecosystem_falls_back_to_result_type() {
        let payload = serde_json::json!({"Results": [{"Type": "Composer", "Vulnerabilities": [{
            "PkgName": "monolog/monolog"
        }]}]})
        .to_string();
        let packages = extract_usage_packages(&payload, 200).unwrap();
        assert_eq!(packages[0].ecosystem, "composer");
    }

    #[test]
    fn test_package_limit() {
        let vulns: Vec<serde_json::Value> = (0..300)
            .map(|i| serde_json::json!({"PkgName": format!("package-number-{i}")}))
            .collect();
        let payload = report(serde_json::Value::Array(vulns));
        let packages = extract_usage_packages(&payload, 200).unwrap();
        assert_eq!(packages.len(), 200);
    }

    #[test]
    fn test_duplicate_packages_merge_tokens() {
        let payload = report(serde_json::json!([
            {"PkgName": "lodash", "PkgIdentifier": {"PURL": "pkg:npm/lodash@1"}},
            {"PkgName": "LODASH", "PkgIdentifier": {"PURL": "pkg:npm/lodash@2"}}
        ]));
        let packages = extract_usage_packages(&payload, 200).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].tokens, vec!["lodash".to_string()]);
    }

    #[test]
    fn test_maven_coords_parsing() {
        assert_eq!(
            parse_maven_coords("org.x:artifact"),
            Some(("org.x".to_string(), "artifact".to_string()))
        );
        assert_eq!(
            parse_maven_coords("pkg:maven/org.x/artifact@1.0"),
            Some(("org.x".to_string(), "artifact".to_string()))
        );
        assert_eq!(parse_maven_coords("plainname"), None);
        assert_eq!(parse_maven_coords(""), None);
    }
}
