//! Task workers: one per assignment, dispatched by engine.
//!
//! Workers never propagate errors to the process. Every exit path sends
//! exactly one `task_result` frame carrying the outcome.

pub mod semgrep;
pub mod trivy;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use tempfile::TempDir;
use tracing::warn;

use secrux_core::config::settings::resolve_task_image;
use secrux_core::protocol::{truncate_log, Outbound, TaskResult, MAX_LOG_BYTES};
use secrux_core::task::{sanitize_name, TaskAssignment};

use crate::session::ExecutorContext;
use crate::util::chmod_best_effort;

/// Outcome a worker hands to [`send_report`].
pub(crate) struct TaskReport {
    pub success: bool,
    pub log: String,
    pub result: String,
    pub run_log: String,
    pub artifacts: HashMap<String, String>,
    pub error: Option<anyhow::Error>,
    pub exit_code: i64,
}

impl TaskReport {
    pub(crate) fn failure(error: anyhow::Error) -> Self {
        Self {
            success: false,
            log: String::new(),
            result: String::new(),
            run_log: String::new(),
            artifacts: HashMap::new(),
            error: Some(error),
            exit_code: -1,
        }
    }
}

/// Entry point for one assignment.
pub async fn run_task(context: Arc<ExecutorContext>, mut assignment: TaskAssignment) {
    let _guard = context.worker_guard();

    let mut engine = assignment.engine.trim().to_lowercase();
    if engine.is_empty() {
        engine = "semgrep".to_string();
    }
    assignment.engine = engine.clone();

    match resolve_task_image(&engine, &assignment.image, &context.engine_images) {
        Ok(image) => assignment.image = image,
        Err(error) => {
            warn!(task_id = %assignment.task_id, error = %error, "image resolution failed");
            send_report(&context, &assignment, TaskReport::failure(error)).await;
            return;
        }
    }

    match engine.as_str() {
        "semgrep" => semgrep::run(context, assignment).await,
        "trivy" => trivy::run(context, assignment).await,
        other => {
            let error = anyhow!("unsupported engine {other:?}");
            send_report(&context, &assignment, TaskReport::failure(error)).await;
        }
    }
}

/// Send the terminal `task_result` frame for an assignment.
pub(crate) async fn send_report(
    context: &ExecutorContext,
    assignment: &TaskAssignment,
    report: TaskReport,
) {
    let result = Outbound::TaskResult(TaskResult {
        task_id: assignment.task_id.clone(),
        stage_id: assignment.stage_id.clone(),
        stage_type: assignment.stage_type.clone(),
        success: report.success,
        log: truncate_log(&report.log, MAX_LOG_BYTES),
        result: report.result,
        run_log: report.run_log,
        exit_code: report.exit_code,
        artifacts: report.artifacts,
        error: report.error.map(|e| format!("{e:#}")),
    });
    if let Err(error) = context.sender.send(&result).await {
        warn!(task_id = %assignment.task_id, error = %error, "failed to send task result");
    }
}

/// Create the world-writable output directory an engine container writes to.
pub(crate) fn create_output_dir(task_id: &str) -> anyhow::Result<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix(&format!("secrux-{}-", sanitize_name(task_id)))
        .tempdir()?;
    // The engine runs as a different uid inside the container.
    chmod_best_effort(dir.path(), 0o777);
    Ok(dir)
}
