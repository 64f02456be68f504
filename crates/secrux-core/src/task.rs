//! Task assignment model.
//!
//! A `task_assign` frame from the gateway carries these fields at the top
//! level of the message, alongside the `type` tag.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single scan job assigned by the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignment {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub stage_id: String,
    #[serde(default)]
    pub stage_type: String,
    /// Engine selector (`semgrep`, `trivy`). Blank defaults to `semgrep`.
    #[serde(default)]
    pub engine: String,
    /// Optional engine image override; wins over the executor's registry.
    #[serde(default)]
    pub image: String,
    /// Explicit engine command; empty means the engine default.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// CPU limit in whole or fractional CPUs. Zero means unlimited.
    #[serde(default)]
    pub cpu_limit: f64,
    /// Memory limit in MiB. Zero means unlimited.
    #[serde(default)]
    pub memory_limit_mb: i64,
    /// Task timeout hint in seconds. Zero means the engine default.
    #[serde(default)]
    pub timeout_sec: u64,
    #[serde(default)]
    pub use_pro: bool,
    #[serde(default)]
    pub semgrep_token: String,
    #[serde(default)]
    pub api_base_url: String,
    #[serde(default)]
    pub source: Option<SourceSpec>,
    #[serde(default)]
    pub output_prefix: String,
}

/// Source union: exactly one variant is populated per assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveSourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemSourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sbom: Option<SbomSourceSpec>,
    /// Reserved by the schema; assignments carrying only `url` are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<UrlSourceSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSourceSpec {
    #[serde(default)]
    pub repo: String,
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub ref_type: RefType,
    #[serde(default)]
    pub auth: GitAuth,
}

/// How to interpret a Git ref during materialisation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RefType {
    #[default]
    Branch,
    Tag,
    Commit,
    /// Unrecognised values clone the full history without a checkout.
    #[serde(other)]
    Other,
}

impl RefType {
    /// Branches and tags are fetched with a depth-1 `--branch` clone.
    pub fn shallow(self) -> bool {
        matches!(self, RefType::Branch | RefType::Tag)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitAuth {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl GitAuth {
    pub fn is_empty(&self) -> bool {
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        blank(&self.token) && blank(&self.username) && blank(&self.password)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSourceSpec {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub upload_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemSourceSpec {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub upload_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSourceSpec {
    #[serde(default)]
    pub r#ref: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SbomSourceSpec {
    #[serde(default)]
    pub upload_id: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlSourceSpec {
    #[serde(default)]
    pub url: String,
}

/// Turn a task identifier into a string safe for container names: lowercase,
/// everything outside `[a-z0-9-]` mapped to `-`.
pub fn sanitize_name(value: &str) -> String {
    if value.is_empty() {
        return "task".to_string();
    }
    value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_decodes_from_assign_frame() {
        let frame = serde_json::json!({
            "type": "task_assign",
            "taskId": "t-42",
            "stageId": "stage-1",
            "stageType": "sca",
            "engine": "trivy",
            "cpuLimit": 1.5,
            "memoryLimitMb": 2048,
            "timeoutSec": 600,
            "env": {"FOO": "bar"},
            "source": {"git": {"repo": "https://example.com/a.git", "ref": "main", "refType": "BRANCH", "auth": {"token": "sec"}}}
        });
        let assign: TaskAssignment = serde_json::from_value(frame).unwrap();
        assert_eq!(assign.task_id, "t-42");
        assert_eq!(assign.cpu_limit, 1.5);
        assert_eq!(assign.memory_limit_mb, 2048);
        let git = assign.source.unwrap().git.unwrap();
        assert_eq!(git.git_ref, "main");
        assert_eq!(git.ref_type, RefType::Branch);
        assert!(git.ref_type.shallow());
        assert_eq!(git.auth.token.as_deref(), Some("sec"));
    }

    #[test]
    fn test_unknown_ref_type_is_tolerated() {
        let git: GitSourceSpec =
            serde_json::from_value(serde_json::json!({"repo": "r", "refType": "SHA"})).unwrap();
        assert_eq!(git.ref_type, RefType::Other);
        assert!(!git.ref_type.shallow());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Task_42/a"), "task-42-a");
        assert_eq!(sanitize_name(""), "task");
        assert_eq!(sanitize_name("abc-123"), "abc-123");
    }
}
