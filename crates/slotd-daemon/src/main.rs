//! slotd - single-host zero-downtime deployment daemon.
//!
//! Serves a git repository's application through a retargetable
//! reverse proxy, promoting commits into `live` via the
//! start-before-drain protocol. Driven over a localhost control API.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use slotd_daemon::{api, deploy, recovery, Orchestrator};
use slotd_core::DeployConfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// slotd daemon - zero-downtime deploys on a single machine
#[derive(Parser, Debug)]
#[command(name = "slotd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to slot-machine.json (default: <repo>/slot-machine.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the application git repository
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Data directory (default: <repo>/.slot-machine)
    #[arg(long)]
    data: Option<PathBuf>,

    /// Control API port (overrides the config's api_port)
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let repo_dir = std::fs::canonicalize(&args.repo)
        .with_context(|| format!("cannot resolve repo path {}", args.repo.display()))?;
    let config_path = args
        .config
        .unwrap_or_else(|| repo_dir.join("slot-machine.json"));
    let data_dir = args.data.unwrap_or_else(|| repo_dir.join(".slot-machine"));

    let cfg = DeployConfig::from_file(&config_path)
        .with_context(|| format!("cannot load {}", config_path.display()))?;
    let api_port = args.port.unwrap_or(cfg.api_port);

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;

    let orch = Orchestrator::new(cfg, repo_dir, data_dir, None);

    // The public port must answer from the start, 503 until something
    // is live.
    orch.start_proxies().await;

    // Rediscover state from symlinks; fall back to deploying HEAD.
    recovery::recover(&orch).await;
    if !orch.has_live() {
        auto_deploy_head(&orch).await;
    }

    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, api_port))
        .await
        .with_context(|| format!("cannot bind control api on port {api_port}"))?;
    info!(port = api_port, "control api listening");

    // Graceful shutdown: drain every slot process, stop the proxies,
    // then let the API server finish.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let shutdown_orch = Arc::clone(&orch);
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                error!(%err, "cannot install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                error!(%err, "cannot install SIGINT handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }

        shutdown_orch.drain_all().await;
        shutdown_orch.shutdown_proxies().await;
        let _ = shutdown_tx.send(true);
    });

    axum::serve(listener, api::router(Arc::clone(&orch)))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        })
        .await
        .context("control api server failed")?;

    info!("daemon stopped");
    Ok(())
}

/// Deploy the repository's HEAD commit, best-effort. A failure leaves
/// the daemon running with no live slot; the operator can deploy over
/// the API.
async fn auto_deploy_head(orch: &Arc<Orchestrator>) {
    let Some(head) = orch.worktrees().head_commit(orch.repo_dir()).await else {
        warn!("cannot determine HEAD, skipping auto-deploy");
        return;
    };

    info!(commit = %head, "auto-deploying HEAD");
    match deploy::deploy(orch, &head).await {
        Ok(promotion) => info!(commit = %promotion.commit, slot = %promotion.slot, "auto-deploy complete"),
        Err(err) => warn!(%err, "auto-deploy failed"),
    }
}
