//! Gateway session: registration, read loop, heartbeat loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use secrux_core::config::ExecutorConfig;
use secrux_core::protocol::{Heartbeat, Outbound, Register};
use secrux_core::task::TaskAssignment;

use crate::link::{FrameReader, MessageSender};
use crate::metrics::HostMetrics;
use crate::runtime::ContainerRuntime;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Read-only runtime context shared by the session loops and task workers.
pub struct ExecutorContext {
    pub config: ExecutorConfig,
    pub engine_images: HashMap<String, String>,
    pub sender: Arc<MessageSender>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub http: reqwest::Client,
    pub metrics: HostMetrics,
    pub shutdown: watch::Sender<bool>,
    active_workers: AtomicUsize,
}

impl ExecutorContext {
    pub fn new(
        config: ExecutorConfig,
        engine_images: HashMap<String, String>,
        sender: Arc<MessageSender>,
        runtime: Arc<dyn ContainerRuntime>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            config,
            engine_images,
            sender,
            runtime,
            http: reqwest::Client::new(),
            metrics: HostMetrics::new(),
            shutdown,
            active_workers: AtomicUsize::new(0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    pub(crate) fn worker_guard(self: &Arc<Self>) -> WorkerGuard {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
        WorkerGuard {
            context: Arc::clone(self),
        }
    }
}

/// Keeps the live-worker count accurate on every task exit path.
pub(crate) struct WorkerGuard {
    context: Arc<ExecutorContext>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.context.active_workers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Announce this executor to the gateway. Called once per connection.
pub async fn register(context: &ExecutorContext) -> Result<()> {
    let host = hostname();
    context
        .sender
        .send(&Outbound::Register(Register {
            token: context.config.token.clone(),
            host,
        }))
        .await
}

/// Read frames off the link and dispatch them until the link breaks or the
/// root context is cancelled. A broken link ends the loop; the process is
/// expected to be supervised and restarted.
pub async fn read_loop<R: AsyncRead + Unpin>(
    context: Arc<ExecutorContext>,
    mut reader: FrameReader<R>,
) {
    let mut shutdown = context.shutdown.subscribe();
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return,
            frame = reader.read_frame() => frame,
        };
        match frame {
            Ok(message) => dispatch(&context, message),
            Err(error) => {
                error!(error = %error, "read error");
                return;
            }
        }
    }
}

fn dispatch(context: &Arc<ExecutorContext>, message: serde_json::Value) {
    let message_type = message
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_string);
    match message_type.as_deref() {
        Some("register_ack") => {
            info!(
                executor_id = %message.get("executorId").and_then(|v| v.as_str()).unwrap_or(""),
                "registered with gateway"
            );
        }
        Some("heartbeat_ack") => {}
        Some("task_assign") => match serde_json::from_value::<TaskAssignment>(message) {
            Ok(assignment) => {
                debug!(task_id = %assignment.task_id, engine = %assignment.engine, "task assigned");
                let context = Arc::clone(context);
                tokio::spawn(async move {
                    crate::tasks::run_task(context, assignment).await;
                });
            }
            Err(error) => {
                warn!(error = %error, "failed to decode task assignment");
            }
        },
        other => {
            warn!(message_type = ?other, "unknown message type");
        }
    }
}

/// Send a heartbeat with host metrics every five seconds. Send failures are
/// logged, never fatal.
pub async fn heartbeat_loop(context: Arc<ExecutorContext>) {
    let mut shutdown = context.shutdown.subscribe();
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so heartbeats trail
    // registration.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
        let snapshot = context.metrics.collect();
        let heartbeat = Outbound::Heartbeat(Heartbeat {
            token: context.config.token.clone(),
            cpu_usage: snapshot.cpu_usage,
            memory_usage_mb: snapshot.memory_usage_mb,
            goroutines: context.worker_count(),
            process_uptime_s: snapshot.uptime_seconds,
        });
        if let Err(error) = context.sender.send(&heartbeat).await {
            warn!(error = %error, "heartbeat send error");
        }
    }
}

fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string())
}
