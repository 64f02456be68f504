//! secrux executor binary entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use secrux_core::config::settings::build_engine_image_map;
use secrux_core::config::ExecutorConfig;
use secrux_executor::link::{FrameReader, MessageSender};
use secrux_executor::runtime::DockerRuntime;
use secrux_executor::session::{self, ExecutorContext};
use secrux_executor::tls;

/// secrux executor - remote scan agent for the secrux control plane.
#[derive(Parser, Debug)]
#[command(name = "secrux-executor", version, about)]
struct Args {
    /// Path to executor config file (JSON).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Executor gateway address.
    #[arg(long)]
    server: Option<String>,

    /// TLS server name override (for certificate verification).
    #[arg(long)]
    server_name: Option<String>,

    /// Path to gateway CA certificate (PEM).
    #[arg(long)]
    ca_cert: Option<String>,

    /// Provisioned executor token.
    #[arg(long, env = "EXECUTOR_TOKEN")]
    token: Option<String>,

    /// Skip TLS verification (dev only).
    #[arg(long)]
    insecure: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_env("SECRUX_LOG").unwrap_or_else(|_| EnvFilter::from_default_env());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config =
        ExecutorConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(server) = args.server {
        config.server_addr = server;
    }
    if let Some(server_name) = args.server_name {
        config.server_name = server_name.trim().to_string();
    }
    if let Some(ca_cert) = args.ca_cert {
        config.ca_cert_path = secrux_core::config::settings::expand_user_path(&ca_cert);
    }
    if let Some(token) = args.token {
        config.token = token;
    }
    if args.insecure {
        config.insecure = true;
    }
    if config.token.is_empty() {
        anyhow::bail!("token is required (obtain from control plane register API)");
    }

    let runtime = DockerRuntime::connect().context("initializing container runtime")?;

    let engine_images = build_engine_image_map(&config.engine_images);
    info!(registry = ?engine_images, "loaded engine registry");
    info!(
        sanitize_pom_repositories = config.trivy.sanitize_pom_repositories,
        filesystem_copy_mode = %config.trivy.filesystem_copy_mode,
        banned_maven_repo_hosts = ?config.trivy.banned_maven_repo_hosts,
        "loaded trivy config"
    );

    let stream = tls::connect(&config)
        .await
        .context("failed to connect to gateway")?;
    info!(gateway = %config.server_addr, "connected to executor gateway");

    let (read_half, write_half) = tokio::io::split(stream);
    let sender = Arc::new(MessageSender::new(write_half));
    let reader = FrameReader::new(read_half);

    let (shutdown_tx, _) = watch::channel(false);
    let context = Arc::new(ExecutorContext::new(
        config,
        engine_images,
        sender,
        Arc::new(runtime),
        shutdown_tx,
    ));

    tokio::spawn(session::read_loop(Arc::clone(&context), reader));
    tokio::spawn(session::heartbeat_loop(Arc::clone(&context)));

    session::register(&context)
        .await
        .context("register message failed")?;

    wait_for_signal().await;
    info!("shutdown signal received");
    if let Err(err) = context.shutdown.send(true) {
        error!(error = %err, "failed to broadcast shutdown");
    }

    // Give in-flight workers a chance to stop their containers and send
    // their terminal results before the process goes away.
    let drain = async {
        while context.worker_count() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), drain)
        .await
        .is_err()
    {
        warn!(workers = context.worker_count(), "shutdown grace period expired");
    }

    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
