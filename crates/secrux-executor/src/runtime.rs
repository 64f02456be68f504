//! Container runtime capability and the engine-container run loop.
//!
//! The executor consumes the runtime through the [`ContainerRuntime`] trait:
//! pull, create, start, wait, logs, stop, remove. [`DockerRuntime`] is the
//! production implementation over the Docker Engine API.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    WaitContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use secrux_core::protocol::LogStream;
use secrux_core::task::{sanitize_name, TaskAssignment};

use crate::link::{ChunkWriter, LogStreamer};

/// Cleanup stop issued to a container gets this long, detached from the task
/// deadline.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// One demultiplexed piece of container output.
pub struct LogPiece {
    pub stream: LogStream,
    pub bytes: Vec<u8>,
}

pub type LogPieceStream = BoxStream<'static, Result<LogPiece>>;

/// Everything needed to create one engine container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub env: Vec<String>,
    pub command: Vec<String>,
    pub entrypoint: Vec<String>,
    pub binds: Vec<String>,
    /// Run as this user inside the container (Trivy needs root).
    pub user: Option<String>,
    pub memory_limit_mb: i64,
    pub cpu_limit: f64,
    pub auto_remove: bool,
}

/// Minimal container runtime capability.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_present(&self, image: &str) -> Result<bool>;
    async fn pull_image(&self, image: &str) -> Result<()>;
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    /// Resolves with the exit code once the container is no longer running.
    async fn wait_container(&self, id: &str) -> Result<i64>;
    /// Follow-mode log stream, demultiplexed into stdout/stderr pieces.
    async fn follow_logs(&self, id: &str) -> Result<LogPieceStream>;
    /// Tail-all logs of a finished container as one string.
    async fn collect_logs(&self, id: &str) -> Result<String>;
    async fn stop_container(&self, id: &str, timeout_secs: i32) -> Result<()>;
    async fn remove_container(&self, id: &str) -> Result<()>;
}

/// Docker Engine implementation of [`ContainerRuntime`].
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("failed to initialize docker client")?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_present(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptionsBuilder::new().from_image(image).build();
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            progress.with_context(|| format!("pulling image {image}"))?;
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            entrypoint: (!spec.entrypoint.is_empty()).then(|| spec.entrypoint.clone()),
            user: spec.user.clone(),
            host_config: Some(HostConfig {
                auto_remove: Some(spec.auto_remove),
                binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
                memory: (spec.memory_limit_mb > 0).then(|| spec.memory_limit_mb * 1024 * 1024),
                nano_cpus: (spec.cpu_limit > 0.0).then(|| (spec.cpu_limit * 1e9) as i64),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };
        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .with_context(|| format!("creating container {}", spec.name))?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .context("starting container")?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let options = WaitContainerOptionsBuilder::new()
            .condition("not-running")
            .build();
        let mut wait = self.docker.wait_container(id, Some(options));
        match wait.next().await {
            Some(Ok(response)) => {
                if let Some(error) = response.error.and_then(|e| e.message) {
                    if !error.is_empty() {
                        return Err(anyhow!(error));
                    }
                }
                Ok(response.status_code)
            }
            // Non-zero exit codes surface as a typed error with the code.
            Some(Err(BollardError::DockerContainerWaitError { error, code })) => {
                if error.is_empty() {
                    Ok(code)
                } else {
                    Err(anyhow!(error))
                }
            }
            Some(Err(error)) => Err(error.into()),
            None => Err(anyhow!("container wait stream ended unexpectedly")),
        }
    }

    async fn follow_logs(&self, id: &str) -> Result<LogPieceStream> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .follow(true)
            .tail("0")
            .build();
        let stream = self.docker.logs(id, Some(options)).filter_map(|item| async {
            match item {
                Ok(output) => demux_log_output(output),
                Err(error) => Some(Err(error.into())),
            }
        });
        Ok(stream.boxed())
    }

    async fn collect_logs(&self, id: &str) -> Result<String> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail("all")
            .build();
        let mut stream = self.docker.logs(id, Some(options));
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(item) = stream.next().await {
            match item? {
                bollard::container::LogOutput::StdOut { message }
                | bollard::container::LogOutput::Console { message } => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                bollard::container::LogOutput::StdErr { message } => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                bollard::container::LogOutput::StdIn { .. } => {}
            }
        }
        Ok(stdout + &stderr)
    }

    async fn stop_container(&self, id: &str, timeout_secs: i32) -> Result<()> {
        let options = StopContainerOptionsBuilder::new().t(timeout_secs).build();
        self.docker.stop_container(id, Some(options)).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::new().force(true).build();
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }
}

fn demux_log_output(output: bollard::container::LogOutput) -> Option<Result<LogPiece>> {
    match output {
        bollard::container::LogOutput::StdOut { message }
        | bollard::container::LogOutput::Console { message } => Some(Ok(LogPiece {
            stream: LogStream::Stdout,
            bytes: message.to_vec(),
        })),
        bollard::container::LogOutput::StdErr { message } => Some(Ok(LogPiece {
            stream: LogStream::Stderr,
            bytes: message.to_vec(),
        })),
        bollard::container::LogOutput::StdIn { .. } => None,
    }
}

/// Outcome of one engine container run.
pub struct RunOutcome {
    /// `-1` when creation or wait failed.
    pub exit_code: i64,
    /// Collected logs; empty when logs were streamed instead.
    pub logs: String,
    pub error: Option<anyhow::Error>,
}

impl RunOutcome {
    fn failed(error: anyhow::Error) -> Self {
        Self {
            exit_code: -1,
            logs: String::new(),
            error: Some(error),
        }
    }
}

/// Run one engine container to completion.
///
/// Ensures the image is available, creates and starts the container, then
/// waits for it under the task deadline. With a streamer the logs are pumped
/// back over the link while the container runs; otherwise they are collected
/// after exit. The container is always stopped (and removed unless
/// auto-remove applies) before this returns, under a detached cleanup
/// timeout so cancellation cannot orphan it.
#[allow(clippy::too_many_arguments)]
pub async fn run_engine_container(
    runtime: &dyn ContainerRuntime,
    assignment: &TaskAssignment,
    command: &[String],
    binds: Vec<String>,
    entrypoint: Vec<String>,
    streamer: Option<Arc<LogStreamer>>,
    name_suffix: &str,
    deadline: tokio::time::Instant,
    mut shutdown: watch::Receiver<bool>,
) -> RunOutcome {
    if let Err(error) = ensure_image_available(runtime, &assignment.image).await {
        return RunOutcome::failed(error);
    }

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let name = format!(
        "secrux-{}-{}-{}",
        sanitize_name(&assignment.task_id),
        sanitize_name(name_suffix),
        nanos
    );

    let auto_remove = streamer.is_some();
    let spec = ContainerSpec {
        image: assignment.image.clone(),
        name,
        env: crate::util::env_map_to_vec(&assignment.env),
        command: command.to_vec(),
        entrypoint,
        binds,
        user: assignment
            .engine
            .eq_ignore_ascii_case("trivy")
            .then(|| "0".to_string()),
        memory_limit_mb: assignment.memory_limit_mb,
        cpu_limit: assignment.cpu_limit,
        auto_remove,
    };

    let id = match runtime.create_container(&spec).await {
        Ok(id) => id,
        Err(error) => return RunOutcome::failed(error),
    };

    if let Err(error) = runtime.start_container(&id).await {
        cleanup_container(runtime, &id, auto_remove).await;
        return RunOutcome::failed(error);
    }

    // Pump follow-mode logs on a separate task so the wait below is free to
    // observe the deadline. The stop signal lets us end the pump after the
    // container exits while still flushing the final chunks.
    let mut log_pump = None;
    if let Some(streamer) = streamer {
        let (stop_tx, stop_rx) = oneshot::channel();
        match runtime.follow_logs(&id).await {
            Ok(stream) => {
                log_pump = Some((
                    stop_tx,
                    tokio::spawn(pump_logs(stream, streamer, stop_rx)),
                ));
            }
            Err(error) => {
                warn!(task_id = %assignment.task_id, error = %error, "failed to stream container logs");
            }
        }
    }

    let (exit_code, wait_error) = tokio::select! {
        result = runtime.wait_container(&id) => match result {
            Ok(code) => (code, None),
            Err(error) => (-1, Some(error)),
        },
        _ = tokio::time::sleep_until(deadline) => (-1, Some(anyhow!("task deadline exceeded"))),
        _ = shutdown.changed() => (-1, Some(anyhow!("task cancelled"))),
    };

    if let Some((stop_tx, handle)) = log_pump {
        let _ = stop_tx.send(());
        if let Err(error) = handle.await {
            debug!(error = %error, "log pump task ended abnormally");
        }
    }

    let mut logs = String::new();
    if !auto_remove {
        match runtime.collect_logs(&id).await {
            Ok(collected) => logs = collected,
            Err(error) => warn!(error = %error, "failed to collect logs"),
        }
    }

    cleanup_container(runtime, &id, auto_remove).await;

    RunOutcome {
        exit_code,
        logs,
        error: wait_error,
    }
}

async fn ensure_image_available(runtime: &dyn ContainerRuntime, image: &str) -> Result<()> {
    if image.is_empty() {
        anyhow::bail!("image ref is empty");
    }
    if runtime.image_present(image).await? {
        return Ok(());
    }
    if image.ends_with(":local") {
        anyhow::bail!(
            "image {image:?} not found locally (tag=:local). Build it first or update executor config"
        );
    }
    runtime.pull_image(image).await
}

async fn pump_logs(
    mut stream: LogPieceStream,
    streamer: Arc<LogStreamer>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut stdout = ChunkWriter::new(Arc::clone(&streamer), LogStream::Stdout);
    let mut stderr = ChunkWriter::new(Arc::clone(&streamer), LogStream::Stderr);
    loop {
        tokio::select! {
            piece = stream.next() => match piece {
                Some(Ok(piece)) => match piece.stream {
                    LogStream::Stdout => stdout.write(&piece.bytes).await,
                    LogStream::Stderr => stderr.write(&piece.bytes).await,
                },
                Some(Err(error)) => {
                    debug!(error = %error, "container log stream error");
                    break;
                }
                None => break,
            },
            _ = &mut stop => break,
        }
    }
    stdout.close().await;
    stderr.close().await;
}

/// Stop (and, when not auto-removed, force-remove) a container. Runs under
/// its own timeout so it survives task cancellation.
async fn cleanup_container(runtime: &dyn ContainerRuntime, id: &str, auto_remove: bool) {
    let cleanup = async {
        let _ = runtime.stop_container(id, 10).await;
        if !auto_remove {
            let _ = runtime.remove_container(id).await;
        }
    };
    if tokio::time::timeout(CLEANUP_TIMEOUT, cleanup).await.is_err() {
        warn!(container = id, "container cleanup timed out");
    }
}
