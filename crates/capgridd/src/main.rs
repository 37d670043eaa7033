//! capgridd: the capgrid daemon.
//!
//! Assembles every subsystem in one process:
//! - State store (redb)
//! - Policy document (validated at startup, reloaded on SIGHUP or via API)
//! - Reconcile loop and disruption loop
//! - REST API + Prometheus exposition
//!
//! # Usage
//!
//! ```text
//! capgridd run --config /etc/capgrid/capgrid.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use capgrid_config::{ConfigError, PolicyDocument};
use capgrid_controller::{ControlError, Controller, ControllerConfig};
use capgrid_disruption::{Evictor, RecordingEvictor, ReportedEvictor};
use capgrid_reconciler::SimulatedProvisioner;
use capgrid_state::StateStore;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "capgridd", about = "capgrid capacity controller daemon", version)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EvictorKind {
    /// Workload sets are reported by the cluster scheduler over the API.
    Reported,
    /// In-process simulation; workloads leave as soon as they are evicted.
    Simulated,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller and serve the API.
    Run {
        /// Policy document.
        #[arg(long, short, default_value = "capgrid.toml")]
        config: PathBuf,

        /// Override `controller.listen`.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Override `controller.state_path`.
        #[arg(long)]
        state: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "reported")]
        evictor: EvictorKind,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.log_json) {
        eprintln!("failed to initialise logging: {e}");
        return ExitCode::from(2);
    }

    let result = match cli.command {
        Command::Run {
            config,
            listen,
            state,
            evictor,
        } => run(&config, listen, state, evictor).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "capgridd failed");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,capgrid=debug"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// 1 for a rejected policy, 2 for everything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<ControlError>() {
        return e.exit_code() as u8;
    }
    match err.downcast_ref::<ConfigError>() {
        Some(ConfigError::Io { .. }) | None => 2,
        Some(_) => 1,
    }
}

async fn run(
    config_path: &Path,
    listen: Option<SocketAddr>,
    state_path: Option<PathBuf>,
    evictor: EvictorKind,
) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "capgrid daemon starting");

    // ── Policy ─────────────────────────────────────────────────
    let policy = match PolicyDocument::load(config_path) {
        Ok(policy) => policy,
        Err(e) => {
            for message in e.messages() {
                error!(%message, "policy validation error");
            }
            return Err(e.into());
        }
    };
    let settings = policy.settings.clone();

    // ── State store ────────────────────────────────────────────
    let db_path = state_path.unwrap_or_else(|| settings.state_path.clone());
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create state directory {}", parent.display()))?;
    }
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Controller ─────────────────────────────────────────────
    let evictor: Arc<dyn Evictor> = match evictor {
        EvictorKind::Reported => Arc::new(ReportedEvictor::new(state.clone())),
        EvictorKind::Simulated => Arc::new(RecordingEvictor::new()),
    };
    let controller = Controller::new(
        state,
        policy.clone(),
        ControllerConfig::from_settings(&settings),
        Arc::new(SimulatedProvisioner::new()),
        evictor,
    );
    controller.apply_policy(policy, &config_path.display().to_string())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller_handle = tokio::spawn({
        let controller = controller.clone();
        let shutdown = shutdown_rx.clone();
        async move { controller.run(shutdown).await }
    });
    let reload_handle = tokio::spawn(reload_on_hangup(
        controller.clone(),
        config_path.to_path_buf(),
        shutdown_rx,
    ));

    // ── API server ─────────────────────────────────────────────
    let router = capgrid_api::build_router(controller, Some(config_path.to_path_buf()));
    let addr = match listen {
        Some(addr) => addr,
        None => settings
            .listen
            .parse()
            .with_context(|| format!("invalid listen address {}", settings.listen))?,
    };
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = controller_handle.await;
    let _ = reload_handle.await;
    info!("capgrid daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn reload_on_hangup(
    controller: Controller,
    path: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "SIGHUP reload unavailable");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!(path = %path.display(), "SIGHUP: reloading policy");
                if let Err(e) = controller.reload(&path) {
                    error!(error = %e, "policy reload rejected; previous policy stays in force");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(
    _controller: Controller,
    _path: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = shutdown.changed().await;
}
