//! Trivy SCA task.
//!
//! Runs the vulnerability scan (with an offline retry on analyzer
//! timeouts), generates a CycloneDX SBOM as a best-effort follow-up, and for
//! filesystem scans builds the usage index correlating findings to source
//! locations. The worker keeps a `[secrux-executor]`-prefixed run journal
//! that ships as the task log.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tracing::warn;

use secrux_core::task::TaskAssignment;

use crate::pom::prepare_trivy_scan_dir;
use crate::runtime::run_engine_container;
use crate::session::ExecutorContext;
use crate::source::{download_upload, prepare_sbom_dir, prepare_source};
use crate::tasks::{create_output_dir, send_report, TaskReport};
use crate::util::read_file_safe;

const VULN_OUTPUT: &str = "trivy-vulns.json";
const SBOM_OUTPUT: &str = "sbom.cdx.json";

const CONTAINER_CACHE_DIR: &str = "/tmp/trivy-cache";
const CONTAINER_MAVEN_REPO_DIR: &str = "/root/.m2/repository";
const CONTAINER_MAVEN_SETTINGS: &str = "/root/.m2/settings.xml";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanKind {
    Image,
    Sbom,
    Fs,
}

impl ScanKind {
    fn as_str(self) -> &'static str {
        match self {
            ScanKind::Image => "image",
            ScanKind::Sbom => "sbom",
            ScanKind::Fs => "fs",
        }
    }
}

pub async fn run(context: Arc<ExecutorContext>, mut assignment: TaskAssignment) {
    let output_dir = match create_output_dir(&assignment.task_id) {
        Ok(dir) => dir,
        Err(error) => {
            warn!(task_id = %assignment.task_id, error = %error, "failed to create output dir");
            send_report(&context, &assignment, TaskReport::failure(error.into())).await;
            return;
        }
    };

    let timeout = resolve_trivy_timeout(assignment.timeout_sec, context.config.trivy.timeout_sec);
    let deadline = tokio::time::Instant::now() + timeout;
    let trivy_timeout_arg = format_duration_arg(inner_trivy_timeout(timeout));
    let global_args = vec!["--timeout".to_string(), trivy_timeout_arg.clone()];

    let Some(source) = assignment.source.clone() else {
        send_report(&context, &assignment, TaskReport::failure(anyhow!("source is required for trivy"))).await;
        return;
    };

    // Per-branch state. The holders keep temp dirs alive for the whole run.
    let mut binds: Vec<String>;
    let vuln_cmd: Vec<String>;
    let mut sbom_cmd: Option<Vec<String>> = None;
    let mut sbom_content = String::new();
    let scan_kind: ScanKind;
    let scan_target: String;
    let mut prep_notes: Vec<String> = Vec::new();
    let mut fs_scan_dir: Option<PathBuf> = None;
    let mut _source_holder = None;
    let mut _scan_holder = None;
    let mut _upload_holder = None;

    let image_ref = source
        .image
        .as_ref()
        .map(|image| image.r#ref.trim().to_string())
        .filter(|r| !r.is_empty());
    let sbom_spec = source.sbom.as_ref().filter(|sbom| {
        !sbom.url.trim().is_empty() || !sbom.upload_id.trim().is_empty()
    });

    if let Some(image_ref) = image_ref {
        // The engine talks to the local daemon to read the image.
        binds = vec![
            format!("{}:/output", output_dir.path().display()),
            "/var/run/docker.sock:/var/run/docker.sock".to_string(),
        ];
        vuln_cmd = [
            global_args.clone(),
            cmd(&["image", "--scanners", "vuln", "--format", "json", "--output"]),
            vec![format!("/output/{VULN_OUTPUT}"), image_ref.clone()],
        ]
        .concat();
        sbom_cmd = Some(convert_cmd(&global_args));
        scan_kind = ScanKind::Image;
        scan_target = image_ref;
    } else if let Some(sbom) = sbom_spec {
        let sbom_path = if sbom.url.trim().is_empty() {
            let upload_id = sbom.upload_id.trim().to_string();
            let download = tokio::time::timeout_at(
                deadline,
                download_upload(&context.http, &assignment.api_base_url, &context.config.token, &upload_id),
            )
            .await
            .unwrap_or_else(|_| Err(anyhow!("sbom download timed out")));
            match download {
                Ok(file) => {
                    let path = file.path().to_path_buf();
                    _upload_holder = Some(file);
                    path
                }
                Err(error) => {
                    send_report(&context, &assignment, TaskReport::failure(error)).await;
                    return;
                }
            }
        } else {
            PathBuf::from(sbom.url.trim())
        };
        let staged = match prepare_sbom_dir(&assignment.task_id, &sbom_path) {
            Ok(staged) => staged,
            Err(error) => {
                send_report(&context, &assignment, TaskReport::failure(error)).await;
                return;
            }
        };
        binds = vec![
            format!("{}:/output", output_dir.path().display()),
            format!("{}:/src:ro", staged.path.display()),
        ];
        vuln_cmd = [
            global_args.clone(),
            cmd(&["sbom", "--scanners", "vuln", "--format", "json", "--output"]),
            vec![format!("/output/{VULN_OUTPUT}"), "/src/sbom.json".to_string()],
        ]
        .concat();
        sbom_content = read_file_safe(&staged.path.join("sbom.json"));
        scan_kind = ScanKind::Sbom;
        scan_target = "sbom.json".to_string();
        _source_holder = Some(staged);
    } else {
        let prepared = tokio::time::timeout_at(
            deadline,
            prepare_source(&context.http, &context.config.token, &assignment),
        )
        .await
        .unwrap_or_else(|_| Err(anyhow!("source preparation timed out")));
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(error) => {
                send_report(&context, &assignment, TaskReport::failure(error)).await;
                return;
            }
        };
        let (scan_dir, notes) =
            match prepare_trivy_scan_dir(&context.config.trivy, &assignment, &prepared.path) {
                Ok(result) => result,
                Err(error) => {
                    send_report(&context, &assignment, TaskReport::failure(error)).await;
                    return;
                }
            };
        prep_notes.extend(notes);
        binds = vec![
            format!("{}:/output", output_dir.path().display()),
            format!("{}:/src:ro", scan_dir.path.display()),
        ];
        vuln_cmd = [
            global_args.clone(),
            cmd(&["fs", "--scanners", "vuln", "--format", "json", "--output"]),
            vec![format!("/output/{VULN_OUTPUT}"), "/src".to_string()],
        ]
        .concat();
        sbom_cmd = Some(convert_cmd(&global_args));
        scan_kind = ScanKind::Fs;
        scan_target = "/src".to_string();
        fs_scan_dir = Some(scan_dir.path.clone());
        _source_holder = Some(prepared);
        _scan_holder = Some(scan_dir);
    }

    if context.config.trivy.inherit_proxy_env {
        inherit_proxy_env(&mut assignment.env);
    }

    let (extra_binds, bind_notes) = trivy_extra_binds(&context.config.trivy);
    binds.extend(extra_binds);
    prep_notes.extend(bind_notes);

    let mut journal = String::new();
    journal.push_str(&format!(
        "[secrux-executor] trivy scan start kind={} target={scan_target}\n",
        scan_kind.as_str()
    ));
    journal.push_str(&format!("[secrux-executor] trivy engine image={}\n", assignment.image));
    journal.push_str(&format!("[secrux-executor] trivy timeout={trivy_timeout_arg}\n"));
    for note in &prep_notes {
        if note.is_empty() {
            continue;
        }
        journal.push_str(note);
        if !note.ends_with('\n') {
            journal.push('\n');
        }
    }
    journal.push_str(&format!("[secrux-executor] vuln output=/output/{VULN_OUTPUT}\n"));
    if sbom_cmd.is_some() {
        journal.push_str(&format!("[secrux-executor] sbom output=/output/{SBOM_OUTPUT}\n"));
    }

    let (mut exit_code, vuln_logs, mut vuln_error) = run_phase(
        &context,
        &assignment,
        vuln_cmd.clone(),
        &binds,
        "trivy-vulns",
        true,
        deadline,
        &mut journal,
    )
    .await;

    let original_exit_code = exit_code;
    if should_retry_offline(scan_kind, exit_code, &vuln_error, &vuln_logs)
        && tokio::time::Instant::now() < deadline
        && !*context.shutdown.borrow()
    {
        journal.push_str("[secrux-executor] trivy timeout detected; retrying with --offline-scan\n");
        let offline_cmd = [vec!["--offline-scan".to_string()], vuln_cmd.clone()].concat();
        let (offline_exit, offline_logs, offline_error) = run_phase(
            &context,
            &assignment,
            offline_cmd,
            &binds,
            "trivy-vulns-offline",
            true,
            deadline,
            &mut journal,
        )
        .await;
        match offline_error {
            Some(error) => {
                if is_offline_scan_unsupported(&offline_logs) {
                    // Old engine: surface the original outcome unchanged.
                    journal.push_str(
                        "[secrux-executor] trivy offline retry skipped: --offline-scan not supported by this Trivy version\n",
                    );
                    exit_code = original_exit_code;
                } else {
                    journal.push_str(&format!(
                        "[secrux-executor] trivy offline retry failed: {error:#}\n"
                    ));
                    exit_code = offline_exit;
                    vuln_error = Some(error);
                }
            }
            None => {
                exit_code = offline_exit;
                vuln_error = None;
            }
        }
    }

    let vuln_output_path = output_dir.path().join(VULN_OUTPUT);

    let mut sbom_error: Option<anyhow::Error> = None;
    if let Some(convert) = sbom_cmd {
        if vuln_output_path.exists() {
            let (_, _, error) = run_phase(
                &context,
                &assignment,
                convert,
                &binds,
                "trivy-sbom",
                false,
                deadline,
                &mut journal,
            )
            .await;
            sbom_error = error;
        } else {
            sbom_error = Some(anyhow!(
                "sbom conversion skipped because /output/{VULN_OUTPUT} was not created"
            ));
        }
        if let Some(error) = &sbom_error {
            journal.push_str(&format!("[secrux-executor] sbom generation warning: {error:#}\n"));
            let direct_cmd = match scan_kind {
                ScanKind::Fs => Some(
                    [
                        global_args.clone(),
                        cmd(&["fs", "--format", "cyclonedx", "--output"]),
                        vec![format!("/output/{SBOM_OUTPUT}"), "/src".to_string()],
                    ]
                    .concat(),
                ),
                ScanKind::Image => Some(
                    [
                        global_args.clone(),
                        cmd(&["image", "--format", "cyclonedx", "--output"]),
                        vec![format!("/output/{SBOM_OUTPUT}"), scan_target.clone()],
                    ]
                    .concat(),
                ),
                ScanKind::Sbom => None,
            };
            if let Some(direct_cmd) = direct_cmd {
                journal.push_str("[secrux-executor] attempting direct sbom generation\n");
                let (_, _, error) = run_phase(
                    &context,
                    &assignment,
                    direct_cmd,
                    &binds,
                    "trivy-sbom-direct",
                    false,
                    deadline,
                    &mut journal,
                )
                .await;
                sbom_error = error;
            }
        }
    }

    let vuln_read = std::fs::read_to_string(&vuln_output_path);
    let vuln_payload = vuln_read
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if sbom_content.is_empty() {
        sbom_content = read_file_safe(&output_dir.path().join(SBOM_OUTPUT));
    }

    let mut artifacts = HashMap::new();
    if !sbom_content.is_empty() {
        artifacts.insert("sbom".to_string(), sbom_content);
    }

    let mut run_error = vuln_error;
    if run_error.is_none() {
        match &vuln_read {
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                run_error = Some(anyhow!(
                    "trivy produced no vulnerability output at /output/{VULN_OUTPUT} (file not created)"
                ));
            }
            Err(error) => {
                run_error = Some(anyhow!(
                    "trivy produced vulnerability output at /output/{VULN_OUTPUT} but it could not be read: {error}"
                ));
            }
            Ok(_) if vuln_payload.is_empty() => {
                run_error = Some(anyhow!(
                    "trivy produced empty vulnerability output at /output/{VULN_OUTPUT}"
                ));
            }
            Ok(_) => {}
        }
    }

    if scan_kind == ScanKind::Fs && !vuln_payload.is_empty() {
        if let Some(scan_dir) = fs_scan_dir {
            let payload = vuln_payload.clone();
            let built = tokio::task::spawn_blocking(move || {
                secrux_sca::build_usage_index(&scan_dir, &payload)
            })
            .await;
            match built {
                Ok(Ok(Some(index))) => match index.to_json() {
                    Ok(json) => {
                        journal.push_str(&format!(
                            "[secrux-executor] usage index generated entries={}\n",
                            index.entries.len()
                        ));
                        artifacts.insert("usage-index".to_string(), json);
                    }
                    Err(error) => journal.push_str(&format!(
                        "[secrux-executor] usage index generation warning: {error:#}\n"
                    )),
                },
                Ok(Ok(None)) => {
                    journal.push_str("[secrux-executor] usage index generation: no matches\n");
                }
                Ok(Err(error)) => journal.push_str(&format!(
                    "[secrux-executor] usage index generation warning: {error:#}\n"
                )),
                Err(error) => journal.push_str(&format!(
                    "[secrux-executor] usage index generation warning: {error}\n"
                )),
            }
        }
    }

    if run_error.is_none() {
        if let Some(error) = &sbom_error {
            journal.push_str(&format!("[secrux-executor] sbom generation warning: {error:#}\n"));
        }
    }
    if let Some(error) = &run_error {
        journal.push_str(&format!("[secrux-executor] trivy scan failed: {error:#}\n"));
    }

    let success = run_error.is_none();
    send_report(
        &context,
        &assignment,
        TaskReport {
            success,
            log: journal,
            result: vuln_payload,
            run_log: String::new(),
            artifacts,
            error: run_error,
            exit_code,
        },
    )
    .await;
}

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn convert_cmd(global_args: &[String]) -> Vec<String> {
    [
        global_args.to_vec(),
        cmd(&["convert", "--format", "cyclonedx", "--output"]),
        vec![format!("/output/{SBOM_OUTPUT}"), format!("/output/{VULN_OUTPUT}")],
    ]
    .concat()
}

/// Run one Trivy command in its own container and journal the result.
/// The vuln phase tolerates exit code 1 (findings); other phases do not.
#[allow(clippy::too_many_arguments)]
async fn run_phase(
    context: &ExecutorContext,
    assignment: &TaskAssignment,
    command: Vec<String>,
    binds: &[String],
    suffix: &str,
    allow_exit_one: bool,
    deadline: tokio::time::Instant,
    journal: &mut String,
) -> (i64, String, Option<anyhow::Error>) {
    journal.push_str(&format!(
        "[secrux-executor] running ({suffix}): trivy {}\n",
        command.join(" ")
    ));
    let outcome = run_engine_container(
        context.runtime.as_ref(),
        assignment,
        &command,
        binds.to_vec(),
        Vec::new(),
        None,
        suffix,
        deadline,
        context.shutdown.subscribe(),
    )
    .await;
    if !outcome.logs.is_empty() {
        journal.push_str(&outcome.logs);
        if !outcome.logs.ends_with('\n') {
            journal.push('\n');
        }
    }
    if let Some(error) = outcome.error {
        return (outcome.exit_code, outcome.logs, Some(error));
    }
    if outcome.exit_code != 0 && !(allow_exit_one && outcome.exit_code == 1) {
        let error = anyhow!("trivy exited with code {}", outcome.exit_code);
        return (outcome.exit_code, outcome.logs, Some(error));
    }
    (outcome.exit_code, outcome.logs, None)
}

fn resolve_trivy_timeout(task_timeout_sec: u64, config_timeout_sec: u64) -> Duration {
    if config_timeout_sec > 0 {
        return Duration::from_secs(config_timeout_sec);
    }
    if task_timeout_sec > 0 {
        return Duration::from_secs(task_timeout_sec);
    }
    DEFAULT_TIMEOUT
}

/// Inner `--timeout` handed to Trivy: total minus a minute of margin for the
/// executor's own work, floored at thirty seconds.
fn inner_trivy_timeout(total: Duration) -> Duration {
    let inner = total.saturating_sub(Duration::from_secs(60));
    let inner = if inner < Duration::from_secs(30) { total } else { inner };
    Duration::from_secs(inner.as_secs())
}

/// Render a duration the way Trivy expects (`19m0s`, `45s`, `1h5m0s`).
fn format_duration_arg(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// A filesystem scan that failed, or "succeeded" with a non-zero exit code,
/// while the logs point at an analyzer timeout gets one retry with
/// `--offline-scan` prepended.
fn should_retry_offline(
    scan_kind: ScanKind,
    exit_code: i64,
    error: &Option<anyhow::Error>,
    logs: &str,
) -> bool {
    if scan_kind != ScanKind::Fs || !has_timeout_hint(logs) {
        return false;
    }
    error.is_some() || exit_code != 0
}

fn has_timeout_hint(logs: &str) -> bool {
    if logs.is_empty() {
        return false;
    }
    let lower = logs.to_lowercase();
    ["analyzer timed out", "provide a higher timeout value", "context deadline exceeded", "timed out"]
        .iter()
        .any(|hint| lower.contains(hint))
}

fn is_offline_scan_unsupported(logs: &str) -> bool {
    if logs.is_empty() {
        return false;
    }
    let lower = logs.to_lowercase();
    lower.contains("unknown flag: --offline-scan")
        || lower.contains("flag provided but not defined: --offline-scan")
}

/// Copy the host proxy settings into the engine env, never overriding values
/// the assignment already set.
fn inherit_proxy_env(env: &mut HashMap<String, String>) {
    for key in ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY", "http_proxy", "https_proxy", "no_proxy"] {
        if env.contains_key(key) {
            continue;
        }
        if let Ok(value) = std::env::var(key) {
            if !value.trim().is_empty() {
                env.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
}

/// Cache and Maven binds for the engine container, with journal notes for
/// anything skipped.
fn trivy_extra_binds(trivy: &secrux_core::config::TrivyConfig) -> (Vec<String>, Vec<String>) {
    let mut binds = Vec::new();
    let mut notes = Vec::new();

    let cache_host = trivy.cache_host_path.trim();
    if !cache_host.is_empty() {
        let cache_host = absolutize(cache_host);
        match std::fs::create_dir_all(&cache_host) {
            Ok(()) => {
                binds.push(format!("{cache_host}:{CONTAINER_CACHE_DIR}"));
                notes.push(format!(
                    "[secrux-executor] trivy cache mounted host={cache_host} container={CONTAINER_CACHE_DIR}"
                ));
            }
            Err(error) => notes.push(format!(
                "[secrux-executor] trivy cache mount skipped (mkdir failed): {error}"
            )),
        }
    }

    let repo_host = trivy.maven_repository_path.trim();
    if !repo_host.is_empty() {
        let repo_host = absolutize(repo_host);
        if std::fs::metadata(&repo_host).map(|m| m.is_dir()).unwrap_or(false) {
            binds.push(format!("{repo_host}:{CONTAINER_MAVEN_REPO_DIR}:ro"));
            notes.push(format!(
                "[secrux-executor] trivy maven repo mounted host={repo_host} container={CONTAINER_MAVEN_REPO_DIR}"
            ));
        } else {
            notes.push(format!(
                "[secrux-executor] trivy maven repo mount skipped (missing): {repo_host}"
            ));
        }
    }

    let settings_host = trivy.maven_settings_path.trim();
    if !settings_host.is_empty() {
        let settings_host = absolutize(settings_host);
        if std::fs::metadata(&settings_host).map(|m| m.is_file()).unwrap_or(false) {
            binds.push(format!("{settings_host}:{CONTAINER_MAVEN_SETTINGS}:ro"));
            notes.push(format!(
                "[secrux-executor] trivy maven settings mounted host={settings_host} container={CONTAINER_MAVEN_SETTINGS}"
            ));
        } else {
            notes.push(format!(
                "[secrux-executor] trivy maven settings mount skipped (missing): {settings_host}"
            ));
        }
    }

    (binds, notes)
}

fn absolutize(path: &str) -> String {
    std::path::Path::new(path)
        .canonicalize()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_resolution() {
        assert_eq!(resolve_trivy_timeout(0, 0), DEFAULT_TIMEOUT);
        assert_eq!(resolve_trivy_timeout(600, 0), Duration::from_secs(600));
        // Config override wins over the task hint.
        assert_eq!(resolve_trivy_timeout(600, 900), Duration::from_secs(900));
    }

    #[test]
    fn test_inner_timeout_margin_and_floor() {
        assert_eq!(
            inner_trivy_timeout(Duration::from_secs(20 * 60)),
            Duration::from_secs(19 * 60)
        );
        // Too small to cut a minute off: the full total is used.
        assert_eq!(inner_trivy_timeout(Duration::from_secs(80)), Duration::from_secs(80));
        assert_eq!(inner_trivy_timeout(Duration::from_secs(90)), Duration::from_secs(30));
    }

    #[test]
    fn test_duration_arg_format() {
        assert_eq!(format_duration_arg(Duration::from_secs(19 * 60)), "19m0s");
        assert_eq!(format_duration_arg(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration_arg(Duration::from_secs(3900)), "1h5m0s");
    }

    #[test]
    fn test_timeout_hints() {
        assert!(has_timeout_hint("FATAL: analyzer timed out after 5m"));
        assert!(has_timeout_hint("please provide a higher timeout value"));
        assert!(!has_timeout_hint("scan completed"));
        assert!(!has_timeout_hint(""));
    }

    #[test]
    fn test_offline_retry_requires_fs_and_timeout_hint() {
        let error = Some(anyhow!("exit 2"));
        assert!(should_retry_offline(ScanKind::Fs, 2, &error, "analyzer timed out"));
        // Exit 1 is tolerated by the vuln phase but still triggers the retry
        // when the logs point at a timeout.
        assert!(should_retry_offline(ScanKind::Fs, 1, &None, "analyzer timed out"));
        assert!(!should_retry_offline(ScanKind::Image, 2, &error, "analyzer timed out"));
        assert!(!should_retry_offline(ScanKind::Fs, 0, &None, "analyzer timed out"));
        assert!(!should_retry_offline(ScanKind::Fs, 2, &error, "all good"));
    }

    #[test]
    fn test_offline_unsupported_detection() {
        assert!(is_offline_scan_unsupported("Error: unknown flag: --offline-scan"));
        assert!(is_offline_scan_unsupported(
            "flag provided but not defined: --offline-scan"
        ));
        assert!(!is_offline_scan_unsupported("some other failure"));
    }

    #[test]
    fn test_proxy_env_does_not_override() {
        let mut env = HashMap::new();
        env.insert("HTTP_PROXY".to_string(), "http://task-proxy:1".to_string());
        inherit_proxy_env(&mut env);
        assert_eq!(env.get("HTTP_PROXY").unwrap(), "http://task-proxy:1");
    }
}
