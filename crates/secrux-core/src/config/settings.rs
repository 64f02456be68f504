//! Executor settings and JSON configuration parsing.
//!
//! Precedence: command-line flags (applied by the binary) > config file >
//! built-in defaults. Engine images additionally honour the
//! `ENGINE_IMAGE_MAP`, `ENGINE_SEMGREP_IMAGE` and `ENGINE_TRIVY_IMAGE`
//! environment variables.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_SERVER_ADDR: &str = "gateway.secrux.internal:5155";
const DEFAULT_SEMGREP_IMAGE: &str = "secrux-semgrep-engine:latest";
const DEFAULT_TRIVY_IMAGE: &str = "aquasec/trivy:latest";

/// Resolved executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Gateway address, `host:port`.
    pub server_addr: String,
    /// TLS server name override for certificate verification.
    pub server_name: String,
    /// Path to the gateway CA certificate (PEM). Empty uses system roots.
    pub ca_cert_path: String,
    /// Provisioned executor token.
    pub token: String,
    /// Skip TLS verification (dev only).
    pub insecure: bool,
    /// Engine name -> container image.
    pub engine_images: HashMap<String, String>,
    pub trivy: TrivyConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            server_name: String::new(),
            ca_cert_path: String::new(),
            token: String::new(),
            insecure: false,
            engine_images: HashMap::new(),
            trivy: TrivyConfig::default(),
        }
    }
}

/// Trivy tuning block.
#[derive(Debug, Clone)]
pub struct TrivyConfig {
    /// Rewrite `pom.xml` files to drop banned repository hosts before a scan.
    pub sanitize_pom_repositories: bool,
    pub banned_maven_repo_hosts: Vec<String>,
    /// `auto`, `always` or `never`: when to copy the source tree before
    /// sanitising.
    pub filesystem_copy_mode: String,
    pub maven_repository_path: String,
    pub maven_settings_path: String,
    pub cache_host_path: String,
    /// Pass the host's proxy environment into the engine container.
    pub inherit_proxy_env: bool,
    /// Total Trivy task timeout override in seconds. Zero defers to the task
    /// hint, then the built-in default.
    pub timeout_sec: u64,
}

impl Default for TrivyConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_default();
        let under_home = |rel: &str| {
            if home.trim().is_empty() {
                String::new()
            } else {
                format!("{home}/{rel}")
            }
        };
        Self {
            sanitize_pom_repositories: true,
            banned_maven_repo_hosts: default_banned_hosts(),
            filesystem_copy_mode: "auto".to_string(),
            maven_repository_path: under_home(".m2/repository"),
            maven_settings_path: under_home(".m2/settings.xml"),
            cache_host_path: under_home(".cache/secrux/trivy"),
            inherit_proxy_env: true,
            timeout_sec: 0,
        }
    }
}

pub fn default_banned_hosts() -> Vec<String> {
    vec![
        "dl.bintray.com".to_string(),
        "jcenter.bintray.com".to_string(),
        "repo.bintray.com".to_string(),
    ]
}

/// On-disk configuration shape (all fields optional).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileConfig {
    #[serde(default)]
    server: String,
    #[serde(default)]
    server_name: String,
    #[serde(default)]
    ca_cert_path: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    insecure: Option<bool>,
    #[serde(default)]
    engine_images: HashMap<String, String>,
    #[serde(default)]
    trivy: Option<TrivyFileConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrivyFileConfig {
    #[serde(default)]
    sanitize_pom_repositories: Option<bool>,
    #[serde(default)]
    banned_maven_repo_hosts: Vec<String>,
    #[serde(default)]
    filesystem_copy_mode: String,
    #[serde(default)]
    maven_repository_path: String,
    #[serde(default)]
    maven_settings_path: String,
    #[serde(default)]
    cache_host_path: String,
    #[serde(default)]
    inherit_proxy_env: Option<bool>,
    #[serde(default)]
    timeout_sec: u64,
}

impl ExecutorConfig {
    /// Load defaults, then merge the JSON config file when one is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(path) = path {
            let file = load_config_file(path)?;
            cfg.merge_file(file);
        }
        cfg.server_name = cfg.server_name.trim().to_string();
        cfg.ca_cert_path = expand_user_path(&cfg.ca_cert_path);
        Ok(cfg)
    }

    fn merge_file(&mut self, file: FileConfig) {
        if !file.server.trim().is_empty() {
            self.server_addr = file.server.trim().to_string();
        }
        if !file.server_name.trim().is_empty() {
            self.server_name = file.server_name.trim().to_string();
        }
        if !file.ca_cert_path.trim().is_empty() {
            self.ca_cert_path = expand_user_path(file.ca_cert_path.trim());
        }
        if !file.token.is_empty() {
            self.token = file.token;
        }
        if let Some(insecure) = file.insecure {
            self.insecure = insecure;
        }
        if !file.engine_images.is_empty() {
            merge_engine_maps(&mut self.engine_images, &file.engine_images);
        }
        if let Some(trivy) = file.trivy {
            if let Some(v) = trivy.sanitize_pom_repositories {
                self.trivy.sanitize_pom_repositories = v;
            }
            if !trivy.banned_maven_repo_hosts.is_empty() {
                self.trivy.banned_maven_repo_hosts = trivy.banned_maven_repo_hosts;
            }
            if !trivy.filesystem_copy_mode.trim().is_empty() {
                self.trivy.filesystem_copy_mode = trivy.filesystem_copy_mode.trim().to_string();
            }
            if !trivy.maven_repository_path.trim().is_empty() {
                self.trivy.maven_repository_path =
                    expand_user_path(trivy.maven_repository_path.trim());
            }
            if !trivy.maven_settings_path.trim().is_empty() {
                self.trivy.maven_settings_path =
                    expand_user_path(trivy.maven_settings_path.trim());
            }
            if !trivy.cache_host_path.trim().is_empty() {
                self.trivy.cache_host_path = expand_user_path(trivy.cache_host_path.trim());
            }
            if let Some(v) = trivy.inherit_proxy_env {
                self.trivy.inherit_proxy_env = v;
            }
            if trivy.timeout_sec > 0 {
                self.trivy.timeout_sec = trivy.timeout_sec;
            }
        }
    }
}

fn load_config_file(path: &Path) -> Result<FileConfig> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !ext.is_empty() && ext != "json" {
        anyhow::bail!("unsupported config format .{ext} (only JSON)");
    }
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("parsing config file {}", path.display()))
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_user_path(path: &str) -> String {
    let value = path.trim();
    if value.is_empty() {
        return String::new();
    }
    let home = match std::env::var("HOME") {
        Ok(home) if !home.trim().is_empty() => home,
        _ => return value.to_string(),
    };
    if value == "~" {
        return home;
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return format!("{home}/{rest}");
    }
    value.to_string()
}

/// Assemble the engine image registry: config file, then environment
/// overrides, then built-in fallbacks for `semgrep` and `trivy`.
pub fn build_engine_image_map(base: &HashMap<String, String>) -> HashMap<String, String> {
    let mut registry = HashMap::new();
    merge_engine_maps(&mut registry, base);
    if let Ok(raw) = std::env::var("ENGINE_IMAGE_MAP") {
        merge_engine_maps(&mut registry, &parse_engine_image_map(&raw));
    }
    if let Ok(img) = std::env::var("ENGINE_SEMGREP_IMAGE") {
        if !img.trim().is_empty() {
            registry.insert("semgrep".to_string(), img.trim().to_string());
        }
    }
    if let Ok(img) = std::env::var("ENGINE_TRIVY_IMAGE") {
        if !img.trim().is_empty() {
            registry.insert("trivy".to_string(), img.trim().to_string());
        }
    }
    registry
        .entry("semgrep".to_string())
        .or_insert_with(|| DEFAULT_SEMGREP_IMAGE.to_string());
    registry
        .entry("trivy".to_string())
        .or_insert_with(|| DEFAULT_TRIVY_IMAGE.to_string());
    registry
}

/// Parse a `name=image,name=image` list.
fn parse_engine_image_map(raw: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        result.insert(key, value.to_string());
    }
    result
}

fn merge_engine_maps(dst: &mut HashMap<String, String>, src: &HashMap<String, String>) {
    for (key, value) in src {
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        dst.insert(key, value.to_string());
    }
}

/// Resolve the container image for an assignment: explicit override first,
/// then the engine registry.
pub fn resolve_task_image(
    engine: &str,
    image_override: &str,
    registry: &HashMap<String, String>,
) -> Result<String> {
    if !image_override.trim().is_empty() {
        return Ok(image_override.trim().to_string());
    }
    let engine = engine.trim().to_lowercase();
    if engine.is_empty() {
        anyhow::bail!("engine not provided and no image override");
    }
    match registry.get(&engine) {
        Some(image) if !image.is_empty() => Ok(image.clone()),
        _ => anyhow::bail!("engine {engine} is not configured on this executor"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_config_merge() {
        let mut file = tempfile::NamedTempFile::with_suffix(".json").unwrap();
        write!(
            file,
            r#"{{
                "server": "gw.example.com:5155",
                "token": "tok",
                "insecure": true,
                "engineImages": {{"Semgrep": "custom/semgrep:1"}},
                "trivy": {{"sanitizePomRepositories": false, "filesystemCopyMode": "always", "timeoutSec": 900}}
            }}"#
        )
        .unwrap();

        let cfg = ExecutorConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.server_addr, "gw.example.com:5155");
        assert_eq!(cfg.token, "tok");
        assert!(cfg.insecure);
        assert_eq!(cfg.engine_images.get("semgrep").unwrap(), "custom/semgrep:1");
        assert!(!cfg.trivy.sanitize_pom_repositories);
        assert_eq!(cfg.trivy.filesystem_copy_mode, "always");
        assert_eq!(cfg.trivy.timeout_sec, 900);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.trivy.banned_maven_repo_hosts, default_banned_hosts());
    }

    #[test]
    fn test_non_json_config_rejected() {
        let file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ExecutorConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_engine_image_fallbacks() {
        let registry = build_engine_image_map(&HashMap::new());
        assert_eq!(registry.get("semgrep").unwrap(), DEFAULT_SEMGREP_IMAGE);
        assert_eq!(registry.get("trivy").unwrap(), DEFAULT_TRIVY_IMAGE);
    }

    #[test]
    fn test_parse_engine_image_map() {
        let parsed = parse_engine_image_map(" semgrep=a:1 , TRIVY=b:2 ,, bad-entry ");
        assert_eq!(parsed.get("semgrep").unwrap(), "a:1");
        assert_eq!(parsed.get("trivy").unwrap(), "b:2");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_resolve_task_image() {
        let mut registry = HashMap::new();
        registry.insert("trivy".to_string(), "aquasec/trivy:0.55".to_string());
        assert_eq!(
            resolve_task_image("TRIVY", "", &registry).unwrap(),
            "aquasec/trivy:0.55"
        );
        assert_eq!(
            resolve_task_image("trivy", "override:1", &registry).unwrap(),
            "override:1"
        );
        assert!(resolve_task_image("grype", "", &registry).is_err());
    }
}
