use std::path::Path;

use secrux_sca::{build_usage_index, UsageKind};

const POM: &str = r#"<project>
  <dependencies>
    <dependency>
      <groupId>org.apache.commons</groupId>
      <artifactId>commons-lang3</artifactId>
      <version>3.8</version>
    </dependency>
  </dependencies>
</project>
"#;

const JAVA: &str = r#"package demo;

import org.apache.commons.lang3.StringUtils;

public class A {
    boolean check(String s) {
        return StringUtils.isEmpty(s);
    }
}
"#;

fn vuln_report() -> String {
    serde_json::json!({
        "Results": [{
            "Type": "jar",
            "Vulnerabilities": [{
                "VulnerabilityID": "CVE-2025-0001",
                "PkgName": "org.apache.commons:commons-lang3",
                "PkgIdentifier": {"PURL": "pkg:maven/org.apache.commons/commons-lang3@3.8"}
            }]
        }]
    })
    .to_string()
}

fn write_fixture(root: &Path) {
    std::fs::create_dir_all(root.join("src/main/java/demo")).unwrap();
    std::fs::write(root.join("pom.xml"), POM).unwrap();
    std::fs::write(root.join("src/main/java/demo/A.java"), JAVA).unwrap();
}

#[test]
fn test_maven_usage_index_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());

    let index = build_usage_index(dir.path(), &vuln_report())
        .unwrap()
        .expect("index should be produced");

    assert!(!index.generated_at.is_empty());
    assert!(index.scanned_files >= 2);

    // Import entry on the exact import line.
    let import = index
        .entries
        .iter()
        .find(|e| e.kind == UsageKind::Import)
        .expect("import entry");
    assert_eq!(import.file, "src/main/java/demo/A.java");
    assert_eq!(import.line, 3);
    assert_eq!(import.confidence, 0.9);
    assert_eq!(import.symbol, "org.apache.commons.lang3.StringUtils");

    // Manifest entry pointing at the pom declaration.
    let manifest = index
        .entries
        .iter()
        .find(|e| e.kind == UsageKind::Manifest)
        .expect("manifest entry");
    assert_eq!(manifest.file, "pom.xml");
    assert_eq!(manifest.key, "org.apache.commons:commons-lang3");

    // Call entry for StringUtils.isEmpty with a usable confidence.
    let call = index
        .entries
        .iter()
        .find(|e| e.kind == UsageKind::Call && e.callee == "isEmpty")
        .expect("call entry");
    assert_eq!(call.receiver, "StringUtils");
    assert!(call.confidence >= 0.65);

    // Wire shape: artifact JSON is camelCase with a type-tagged kind.
    let json = index.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(value["generatedAt"].is_string());
    assert!(value["entries"].as_array().unwrap().len() >= 3);
}

#[test]
fn test_caps_hold_over_noisy_trees() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    // One npm package matched by hundreds of lines.
    let noisy: String = (0..500).map(|_| "const x = require('left-pad');\n").collect();
    for i in 0..5 {
        std::fs::write(dir.path().join(format!("src/f{i}.js")), &noisy).unwrap();
    }
    let report = serde_json::json!({
        "Results": [{
            "Type": "npm",
            "Vulnerabilities": [{
                "PkgName": "left-pad",
                "PkgIdentifier": {"PURL": "pkg:npm/left-pad@1.3.0"}
            }]
        }]
    })
    .to_string();

    let index = build_usage_index(dir.path(), &report).unwrap().expect("index");
    assert!(index.entries.len() <= 2000);
    let per_key = index
        .entries
        .iter()
        .filter(|e| e.key == "left-pad")
        .count();
    assert!(per_key <= 20, "per-key cap violated: {per_key}");
}

#[test]
fn test_no_packages_means_no_artifact() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let empty = serde_json::json!({"Results": []}).to_string();
    assert!(build_usage_index(dir.path(), &empty).unwrap().is_none());
}

#[test]
fn test_no_occurrences_means_no_artifact() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.go"), "package main\n").unwrap();
    let report = serde_json::json!({
        "Results": [{
            "Type": "npm",
            "Vulnerabilities": [{"PkgName": "some-unused-package"}]
        }]
    })
    .to_string();
    assert!(build_usage_index(dir.path(), &report).unwrap().is_none());
}

#[test]
fn test_invalid_report_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(build_usage_index(dir.path(), "not json").is_err());
}
