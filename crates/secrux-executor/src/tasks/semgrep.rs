//! Semgrep SAST task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tracing::warn;

use secrux_core::task::TaskAssignment;

use crate::link::LogStreamer;
use crate::runtime::run_engine_container;
use crate::session::ExecutorContext;
use crate::source::prepare_source;
use crate::tasks::{create_output_dir, send_report, TaskReport};
use crate::util::read_file_safe;

const SARIF_OUTPUT: &str = "semgrep.sarif.json";
const ENGINE_LOG: &str = "semgrep-log.json";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub async fn run(context: Arc<ExecutorContext>, mut assignment: TaskAssignment) {
    let output_dir = match create_output_dir(&assignment.task_id) {
        Ok(dir) => dir,
        Err(error) => {
            warn!(task_id = %assignment.task_id, error = %error, "failed to create output dir");
            send_report(&context, &assignment, TaskReport::failure(error.into())).await;
            return;
        }
    };

    let source = match prepare_source(&context.http, &context.config.token, &assignment).await {
        Ok(source) => source,
        Err(error) => {
            warn!(task_id = %assignment.task_id, error = %error, "failed to prepare source");
            send_report(&context, &assignment, TaskReport::failure(error)).await;
            return;
        }
    };

    let env = &mut assignment.env;
    env.entry("SEMGREP_CONFIG".to_string())
        .or_insert_with(|| "auto".to_string());
    env.insert("SEMGREP_ENABLE_SARIF".to_string(), "true".to_string());
    env.insert(
        "SEMGREP_OUTPUT_FILE".to_string(),
        format!("/output/{SARIF_OUTPUT}"),
    );
    env.insert(
        "SEMGREP_LOG_FILE".to_string(),
        format!("/output/{ENGINE_LOG}"),
    );
    if assignment.use_pro && !assignment.semgrep_token.is_empty() {
        env.insert(
            "SEMGREP_APP_TOKEN".to_string(),
            assignment.semgrep_token.clone(),
        );
        env.insert("SEMGREP_USE_PRO".to_string(), "true".to_string());
    }

    if assignment.command.is_empty() {
        let mut command = vec!["scan".to_string(), "--disable-version-check".to_string()];
        if assignment.use_pro {
            command.push("--dataflow-traces".to_string());
        }
        command.push("/src".to_string());
        assignment.command = command;
    }

    let timeout = if assignment.timeout_sec > 0 {
        Duration::from_secs(assignment.timeout_sec)
    } else {
        DEFAULT_TIMEOUT
    };
    let deadline = tokio::time::Instant::now() + timeout;

    let binds = vec![
        format!("{}:/output", output_dir.path().display()),
        format!("{}:/src:ro", source.path.display()),
    ];
    let streamer = Arc::new(LogStreamer::new(
        Arc::clone(&context.sender),
        &assignment.task_id,
        &assignment.stage_id,
        &assignment.stage_type,
    ));

    let command = assignment.command.clone();
    let outcome = run_engine_container(
        context.runtime.as_ref(),
        &assignment,
        &command,
        binds,
        Vec::new(),
        Some(streamer),
        "semgrep",
        deadline,
        context.shutdown.subscribe(),
    )
    .await;

    let result_payload = read_file_safe(&output_dir.path().join(SARIF_OUTPUT));
    let run_log_payload = read_file_safe(&output_dir.path().join(ENGINE_LOG));

    let mut error = outcome.error;
    // Exit code 1 means findings, not failure.
    let mut success = error.is_none() && (outcome.exit_code == 0 || outcome.exit_code == 1);
    if success && result_payload.is_empty() {
        success = false;
        error = Some(anyhow!("semgrep produced no SARIF output"));
    }

    send_report(
        &context,
        &assignment,
        TaskReport {
            success,
            log: outcome.logs,
            result: result_payload,
            run_log: run_log_payload,
            artifacts: Default::default(),
            error,
            exit_code: outcome.exit_code,
        },
    )
    .await;
}
