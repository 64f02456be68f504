//! Maven POM repository sanitisation for Trivy filesystem scans.
//!
//! Walks a source tree and rewrites every `pom.xml` so that `<repository>`
//! and `<pluginRepository>` entries pointing at banned hosts disappear. The
//! rewrite is a token-stream copy: everything passes through verbatim except
//! dropped entries, and a file with nothing to drop keeps its exact bytes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::{Reader, Writer};
use reqwest::Url;
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use secrux_core::config::TrivyConfig;
use secrux_core::task::{sanitize_name, TaskAssignment};

use crate::util::chmod_best_effort;

/// Aggregate outcome of a sanitisation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PomSanitizeStats {
    pub poms_scanned: usize,
    pub poms_modified: usize,
    pub repositories_removed: usize,
    pub errors: usize,
}

/// The directory Trivy should scan, plus the copy backing it when one was
/// made.
pub struct ScanDir {
    pub path: PathBuf,
    _copy: Option<TempDir>,
}

/// Decide whether to sanitise (and whether to copy first), then sanitise.
/// Returns the scan directory and human-readable notes for the run journal.
pub fn prepare_trivy_scan_dir(
    trivy: &TrivyConfig,
    assignment: &TaskAssignment,
    source_dir: &Path,
) -> Result<(ScanDir, Vec<String>)> {
    if !trivy.sanitize_pom_repositories {
        return Ok((
            ScanDir {
                path: source_dir.to_path_buf(),
                _copy: None,
            },
            Vec::new(),
        ));
    }

    let mut banned_hosts = normalize_host_list(&trivy.banned_maven_repo_hosts);
    if banned_hosts.is_empty() {
        banned_hosts = normalize_host_list(&secrux_core::config::settings::default_banned_hosts());
    }

    let copy_mode = {
        let mode = trivy.filesystem_copy_mode.trim().to_lowercase();
        if mode.is_empty() {
            "auto".to_string()
        } else {
            mode
        }
    };

    let mut notes = vec![format!(
        "[secrux-executor] trivy pom sanitization enabled=true copyMode={copy_mode} bannedMavenRepoHosts={}",
        banned_hosts.join(",")
    )];

    // A local filesystem path belongs to the user; never mutate it in place
    // unless copies are disabled outright.
    let local_path_source = assignment
        .source
        .as_ref()
        .and_then(|s| s.filesystem.as_ref())
        .map(|fs| !fs.path.trim().is_empty() && fs.upload_id.trim().is_empty())
        .unwrap_or(false);
    let should_copy = match copy_mode.as_str() {
        "never" => false,
        "always" => true,
        _ => local_path_source,
    };

    let mut copy = None;
    let scan_path = if should_copy {
        let tmp = tempfile::Builder::new()
            .prefix(&format!(
                "secrux-trivy-src-{}-",
                sanitize_name(&assignment.task_id)
            ))
            .tempdir()
            .context("creating sanitization copy dir")?;
        chmod_best_effort(tmp.path(), 0o755);
        copy_dir(source_dir, tmp.path())
            .context("failed to copy trivy scan source for pom sanitization")?;
        notes.push(format!(
            "[secrux-executor] trivy source copied for sanitization (path={})",
            tmp.path().display()
        ));
        let path = tmp.path().to_path_buf();
        copy = Some(tmp);
        path
    } else {
        source_dir.to_path_buf()
    };

    let stats = sanitize_tree(&scan_path, &banned_hosts);
    if stats.errors > 0 {
        notes.push(format!(
            "[secrux-executor] trivy pom sanitization warnings={} (some pom.xml files could not be processed)",
            stats.errors
        ));
    }
    if stats.repositories_removed > 0 {
        notes.push(format!(
            "[secrux-executor] trivy pom sanitization removed={} (pomsModified={} pomsScanned={})",
            stats.repositories_removed, stats.poms_modified, stats.poms_scanned
        ));
    } else if stats.poms_scanned > 0 {
        notes.push(format!(
            "[secrux-executor] trivy pom sanitization scanned poms={} (no banned repo urls found)",
            stats.poms_scanned
        ));
    }

    Ok((
        ScanDir {
            path: scan_path,
            _copy: copy,
        },
        notes,
    ))
}

/// Strip scheme and slashes, lowercase, de-duplicate.
pub fn normalize_host_list(hosts: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(hosts.len());
    for raw in hosts {
        let mut host = raw.trim().to_lowercase();
        for prefix in ["https://", "http://", "//"] {
            if let Some(rest) = host.strip_prefix(prefix) {
                host = rest.to_string();
            }
        }
        let host = host.trim_end_matches('/').to_string();
        if host.is_empty() || !seen.insert(host.clone()) {
            continue;
        }
        out.push(host);
    }
    out
}

/// Recursive copy preserving file modes and symlinks.
fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields children of src");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Sanitise every `pom.xml` (case-insensitive) under `root`. Per-file
/// failures count as warnings and never abort the walk.
pub fn sanitize_tree(root: &Path, banned_hosts: &[String]) -> PomSanitizeStats {
    let mut stats = PomSanitizeStats::default();
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => {
                stats.errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file()
            || !entry.file_name().to_string_lossy().eq_ignore_ascii_case("pom.xml")
        {
            continue;
        }
        stats.poms_scanned += 1;
        let raw = match std::fs::read(entry.path()) {
            Ok(raw) => raw,
            Err(_) => {
                stats.errors += 1;
                continue;
            }
        };
        match sanitize_pom_xml(&raw, banned_hosts) {
            Ok((_, 0)) => {}
            Ok((updated, removed)) => {
                if std::fs::write(entry.path(), updated).is_err() {
                    stats.errors += 1;
                    continue;
                }
                debug!(path = %entry.path().display(), removed, "pom sanitized");
                stats.poms_modified += 1;
                stats.repositories_removed += removed;
            }
            Err(_) => stats.errors += 1,
        }
    }
    stats
}

/// Rewrite one POM. Returns the output bytes and how many repository entries
/// were dropped; zero drops returns the input bytes unchanged.
pub fn sanitize_pom_xml(raw: &[u8], banned_hosts: &[String]) -> Result<(Vec<u8>, usize)> {
    let mut reader = Reader::from_reader(raw);
    let mut writer = Writer::new(Vec::with_capacity(raw.len()));
    let mut buf = Vec::new();
    let mut removed = 0;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,
            Event::Start(ref start)
                if matches!(
                    start.local_name().as_ref(),
                    b"repositories" | b"pluginRepositories"
                ) =>
            {
                let section = start.local_name().as_ref().to_vec();
                writer.write_event(event.borrow())?;
                removed += copy_repository_section(&mut reader, &mut writer, &section, banned_hosts)?;
            }
            other => writer.write_event(other)?,
        }
        buf.clear();
    }

    if removed == 0 {
        return Ok((raw.to_vec(), 0));
    }
    Ok((writer.into_inner(), removed))
}

/// Copy a `<repositories>`/`<pluginRepositories>` section, filtering out
/// entries whose URL is banned.
fn copy_repository_section(
    reader: &mut Reader<&[u8]>,
    writer: &mut Writer<Vec<u8>>,
    section: &[u8],
    banned_hosts: &[String],
) -> Result<usize> {
    let mut dropped = 0;
    let mut depth = 1usize;
    let mut buf = Vec::new();
    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => anyhow::bail!("unexpected end of document inside repository section"),
            Event::Start(ref start)
                if matches!(
                    start.local_name().as_ref(),
                    b"repository" | b"pluginRepository"
                ) =>
            {
                let (entry_events, url) = read_entry(reader, event.into_owned())?;
                if is_banned_repo_url(url.as_deref().unwrap_or(""), banned_hosts) {
                    dropped += 1;
                } else {
                    for entry_event in entry_events {
                        writer.write_event(entry_event)?;
                    }
                }
            }
            Event::Start(_) => {
                depth += 1;
                writer.write_event(event)?;
            }
            Event::End(ref end) => {
                depth -= 1;
                let matches_section = end.local_name().as_ref() == section;
                writer.write_event(event.borrow())?;
                if depth == 0 && matches_section {
                    return Ok(dropped);
                }
            }
            other => writer.write_event(other)?,
        }
        buf.clear();
    }
}

/// Buffer one repository entry and extract its URL. The last `<url>` text
/// content in the entry wins.
fn read_entry(
    reader: &mut Reader<&[u8]>,
    start: Event<'static>,
) -> Result<(Vec<Event<'static>>, Option<String>)> {
    let entry_name = match &start {
        Event::Start(s) => s.name().as_ref().to_vec(),
        _ => unreachable!("read_entry is called with a start event"),
    };
    let mut events = vec![start];
    let mut depth = 1usize;
    let mut url = None;
    let mut in_url = false;
    let mut buf = Vec::new();
    loop {
        let event = reader.read_event_into(&mut buf)?.into_owned();
        match &event {
            Event::Eof => anyhow::bail!("unexpected end of document inside repository entry"),
            Event::Start(s) => {
                depth += 1;
                in_url = s.local_name().as_ref() == b"url";
            }
            Event::Text(text) => {
                if in_url {
                    let value = text.unescape()?.trim().to_string();
                    if !value.is_empty() {
                        url = Some(value);
                    }
                }
            }
            Event::End(end) => {
                if end.local_name().as_ref() == b"url" {
                    in_url = false;
                }
                depth -= 1;
                if depth == 0 && end.name().as_ref() == entry_name.as_slice() {
                    events.push(event);
                    return Ok((events, url));
                }
            }
            _ => {}
        }
        events.push(event);
        buf.clear();
    }
}

/// A URL is banned when its host (or, as a fallback, the raw lowercase
/// value) contains any banned host.
pub fn is_banned_repo_url(value: &str, banned_hosts: &[String]) -> bool {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return false;
    }
    let host = Url::parse(&value)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| value.clone());
    banned_hosts.iter().any(|banned| {
        let banned = banned.trim().to_lowercase();
        !banned.is_empty() && (host.contains(&banned) || value.contains(&banned))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const POM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<project>
  <modelVersion>4.0.0</modelVersion>
  <repositories>
    <repository>
      <id>jcenter</id>
      <url>https://jcenter.bintray.com/</url>
    </repository>
    <repository>
      <id>central</id>
      <url>https://repo.maven.apache.org/maven2</url>
    </repository>
  </repositories>
</project>
"#;

    fn banned() -> Vec<String> {
        normalize_host_list(&secrux_core::config::settings::default_banned_hosts())
    }

    #[test]
    fn test_banned_repository_dropped_central_kept() {
        let (out, removed) = sanitize_pom_xml(POM.as_bytes(), &banned()).unwrap();
        assert_eq!(removed, 1);
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("jcenter.bintray.com"));
        assert!(text.contains("repo.maven.apache.org"));
        assert!(text.contains("<modelVersion>4.0.0</modelVersion>"));
    }

    #[test]
    fn test_clean_pom_is_byte_identical() {
        let clean = POM.replace("https://jcenter.bintray.com/", "https://example.com/maven2");
        let (out, removed) = sanitize_pom_xml(clean.as_bytes(), &banned()).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(out, clean.as_bytes());
    }

    #[test]
    fn test_sanitization_is_idempotent() {
        let (first, removed) = sanitize_pom_xml(POM.as_bytes(), &banned()).unwrap();
        assert_eq!(removed, 1);
        let (second, removed_again) = sanitize_pom_xml(&first, &banned()).unwrap();
        assert_eq!(removed_again, 0);
        assert_eq!(second, first);
    }

    #[test]
    fn test_plugin_repositories_are_sanitized_too() {
        let pom = r#"<project>
  <pluginRepositories>
    <pluginRepository>
      <id>bad</id>
      <url>https://dl.bintray.com/plugins</url>
    </pluginRepository>
  </pluginRepositories>
</project>"#;
        let (out, removed) = sanitize_pom_xml(pom.as_bytes(), &banned()).unwrap();
        assert_eq!(removed, 1);
        assert!(!String::from_utf8(out).unwrap().contains("bintray"));
    }

    #[test]
    fn test_last_url_in_entry_decides() {
        let pom = r#"<project>
  <repositories>
    <repository>
      <releases><url>https://example.com/ok</url></releases>
      <url>https://jcenter.bintray.com/</url>
    </repository>
  </repositories>
</project>"#;
        let (_, removed) = sanitize_pom_xml(pom.as_bytes(), &banned()).unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_host_matching() {
        let hosts = banned();
        assert!(is_banned_repo_url("https://jcenter.bintray.com/", &hosts));
        assert!(is_banned_repo_url("HTTP://DL.BINTRAY.COM/x", &hosts));
        // Raw-value fallback catches non-URL strings.
        assert!(is_banned_repo_url("mirror of repo.bintray.com", &hosts));
        assert!(!is_banned_repo_url("https://repo.maven.apache.org/maven2", &hosts));
        assert!(!is_banned_repo_url("", &hosts));
    }

    #[test]
    fn test_normalize_host_list() {
        let hosts = normalize_host_list(&[
            " https://JCenter.Bintray.com/ ".to_string(),
            "//dl.bintray.com".to_string(),
            "jcenter.bintray.com".to_string(),
            "".to_string(),
        ]);
        assert_eq!(hosts, vec!["jcenter.bintray.com", "dl.bintray.com"]);
    }

    #[test]
    fn test_sanitize_tree_counts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("module")).unwrap();
        std::fs::write(dir.path().join("pom.xml"), POM).unwrap();
        std::fs::write(
            dir.path().join("module/POM.XML"),
            POM.replace("https://jcenter.bintray.com/", "https://example.com"),
        )
        .unwrap();

        let stats = sanitize_tree(dir.path(), &banned());
        assert_eq!(stats.poms_scanned, 2);
        assert_eq!(stats.poms_modified, 1);
        assert_eq!(stats.repositories_removed, 1);
        assert_eq!(stats.errors, 0);

        // The clean file kept its bytes.
        let clean = std::fs::read_to_string(dir.path().join("module/POM.XML")).unwrap();
        assert!(clean.contains("example.com"));
    }
}
