#![forbid(unsafe_code)]

//! `agent-runner` — execution-plane runner binary.
//!
//! Bootstraps configuration, connects the event stream to the
//! coordinator, starts the session manager and heartbeats, and serves the
//! local IPC surface for `agent-runner-ctl`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_runner::config::GlobalConfig;
use agent_runner::ipc::server::{spawn_ipc_server, IpcState};
use agent_runner::orchestrator::runner::{Runner, RunnerNotice};
use agent_runner::orchestrator::session_manager::SessionManager;
use agent_runner::stream::transport::WsTransport;
use agent_runner::stream::{EventStream, StreamNotice};
use agent_runner::workspace::LocalWorkspaces;
use agent_runner::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-runner", about = "Execution-plane runner for AI coding agents", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the workspaces root directory.
    #[arg(long)]
    workspaces: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-runner bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(workspaces) = args.workspaces {
        config.workspaces_root = workspaces;
    }
    config.load_credentials().await?;
    let config = Arc::new(config);
    info!(runner_id = config.runner_id, "configuration loaded");

    // ── Wire the components ─────────────────────────────
    let transport = Arc::new(WsTransport);
    let (stream, handles) = EventStream::new(
        config.stream.clone(),
        config.connect_url(),
        transport,
    );
    let workspaces = Arc::new(LocalWorkspaces::new(config.workspaces_root.clone()));
    let manager = SessionManager::new(Arc::clone(&config), Arc::clone(&stream), workspaces);
    let (runner, mut runner_notices) = Runner::new(
        Arc::clone(&config),
        Arc::clone(&manager),
        Arc::clone(&stream),
    );

    // Surface stream notices in the logs; exhaustion needs an operator.
    let mut stream_notices = handles.notices;
    tokio::spawn(async move {
        while let Some(notice) = stream_notices.recv().await {
            match notice {
                StreamNotice::Connected => info!("coordinator connection established"),
                StreamNotice::Reconnecting { attempt, delay } => {
                    warn!(attempt, ?delay, "coordinator connection lost, reconnecting");
                }
                StreamNotice::ReconnectExhausted => {
                    error!("coordinator reconnect attempts exhausted; manual restart required");
                }
                StreamNotice::EventEvicted(event) => {
                    warn!(
                        session_id = event.session_id,
                        seq = event.seq,
                        "event buffer overflow, history gap for coordinator"
                    );
                }
                StreamNotice::Disconnected => info!("coordinator connection closed"),
            }
        }
    });

    tokio::spawn(async move {
        while let Some(notice) = runner_notices.recv().await {
            match notice {
                RunnerNotice::Started { providers } => {
                    for (kind, advert) in providers {
                        info!(
                            kind,
                            installed = advert.installed,
                            version = advert.version.as_deref().unwrap_or("-"),
                            "advertising provider"
                        );
                    }
                }
                RunnerNotice::Stopped => info!("runner reported stopped"),
            }
        }
    });

    // ── Start ───────────────────────────────────────────
    runner.start().await?;
    let command_pump = runner.spawn_command_pump(handles.commands);

    let ct = CancellationToken::new();
    let ipc_state = Arc::new(IpcState {
        runner: Arc::clone(&runner),
        manager: Arc::clone(&manager),
    });
    let ipc_task = spawn_ipc_server(&config.ipc_name, ipc_state, ct.clone())?;

    // ── Wait for shutdown signal ────────────────────────
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!(%err, "failed to listen for shutdown signal"),
    }

    ct.cancel();
    runner.stop().await?;
    command_pump.abort();
    let _ = ipc_task.await;

    info!("agent-runner exited cleanly");
    Ok(())
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder
            .try_init()
            .map_err(|err| AppError::Config(format!("tracing init failed: {err}")))?,
        LogFormat::Json => builder
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("tracing init failed: {err}")))?,
    }
    Ok(())
}
