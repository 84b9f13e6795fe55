//! Deploy and rollback pipelines.
//!
//! Both pipelines follow start-before-drain: the new process is
//! spawned on fresh ports and health-checked while the old live keeps
//! serving through the proxy; only after the proxy is retargeted and
//! the state swapped does the old process get drained.
//!
//! Sequencing inside the pipeline is load-bearing. State is written
//! under the lock *before* the old live is drained, so the old slot's
//! exit watcher can no longer clear the proxy target that was just set
//! for the new slot.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use slotd_core::persist::{self, JournalAction, LIVE_LINK, PREV_LINK, STAGING_SLOT};
use slotd_core::process::{self, ProcessError};
use slotd_core::worktree::WorktreeError;
use thiserror::Error;
use tracing::{info, warn};

use crate::state::{Orchestrator, Slot};

/// Result of a successful deploy or rollback.
#[derive(Debug, Clone)]
pub struct Promotion {
    /// Directory basename now serving as live.
    pub slot: String,
    /// The commit now live.
    pub commit: String,
    /// The commit that was live before; empty for the first deploy.
    pub previous_commit: String,
}

/// Why a deploy or rollback did not promote.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Another deploy or rollback holds the pipeline.
    #[error("deploy in progress")]
    Busy,

    /// Rollback requested with no previous slot.
    #[error("no previous slot")]
    NoPrevious,

    /// The new process started but never became healthy. The old
    /// state is untouched.
    #[error("health check failed")]
    Unhealthy,

    /// No ephemeral port could be allocated.
    #[error("free port: {0}")]
    PortAlloc(std::io::Error),

    /// The setup command failed.
    #[error("setup: {0}")]
    Setup(ProcessError),

    /// The application process could not be spawned.
    #[error("start: {0}")]
    Start(ProcessError),

    /// A worktree operation failed.
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
}

/// Clears the `deploying` flag on every pipeline exit path.
struct PipelineGuard {
    orch: Arc<Orchestrator>,
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        self.orch.state.lock().deploying = false;
    }
}

/// Atomically acquire the pipeline and snapshot `live`/`prev`.
fn acquire(
    orch: &Arc<Orchestrator>,
) -> Result<(PipelineGuard, Option<Arc<Slot>>, Option<Arc<Slot>>), DeployError> {
    let mut state = orch.state.lock();
    if state.deploying {
        return Err(DeployError::Busy);
    }
    state.deploying = true;
    let live = state.live.clone();
    let prev = state.prev.clone();
    drop(state);

    Ok((
        PipelineGuard {
            orch: Arc::clone(orch),
        },
        live,
        prev,
    ))
}

fn alloc_ports() -> Result<(u16, u16), DeployError> {
    let app_port = process::alloc_port().map_err(DeployError::PortAlloc)?;
    let int_port = process::alloc_port().map_err(DeployError::PortAlloc)?;
    Ok((app_port, int_port))
}

/// Deploy `commit`: build it in staging, start it, health-check it,
/// and promote it to live while the old live keeps serving.
///
/// # Errors
///
/// See [`DeployError`]. On [`DeployError::Unhealthy`] the new process
/// has been killed and the previous state is fully preserved.
pub async fn deploy(orch: &Arc<Orchestrator>, commit: &str) -> Result<Promotion, DeployError> {
    let (_guard, old_live, old_prev) = acquire(orch)?;
    info!(commit, "deploy started");

    let staging = orch.data_dir().join(STAGING_SLOT);

    // 1. Pin staging to the commit, with shared dirs in place before
    // setup or the app touch them.
    orch.worktrees().prepare_slot(&staging, commit).await?;
    orch.worktrees()
        .apply_shared_dirs(&staging, &orch.config().shared_dirs);

    // 2. Fresh ports for this slot instance.
    let (app_port, int_port) = alloc_ports()?;

    // 3. Setup command, if configured.
    if let Some(setup) = &orch.config().setup_command {
        let env = slotd_core::env::compose_env(
            orch.repo_dir(),
            orch.config().env_file.as_deref(),
            app_port,
            int_port,
        );
        process::run_setup(setup, &staging, &env)
            .await
            .map_err(DeployError::Setup)?;
    }

    // 4. Start the new process; the old live is still serving.
    let slot = orch
        .start_process(&staging, commit, app_port, int_port)
        .await
        .map_err(DeployError::Start)?;

    // 5. Health check against the internal port.
    if !orch.health_check(&slot).await {
        warn!(commit, "deploy rejected: health check failed");
        orch.kill_slot(&slot).await;
        return Err(DeployError::Unhealthy);
    }

    // 6. Healthy - promote.
    let mut slot_name = persist::slot_name(commit);
    let mut slot_dir = orch.data_dir().join(&slot_name);

    // GC the old prev first so a re-deploy of the same commit cannot
    // collide with its directory name.
    if let Some(prev) = &old_prev {
        orch.drain_slot(prev).await;
        orch.worktrees().remove(&prev.dir()).await;
    }

    // Re-deploy of the live commit: move the occupied directory
    // aside. The old process keeps running; the rename does not
    // invalidate its open file handles.
    let mut draining_dir: Option<PathBuf> = None;
    if slot_dir.exists() {
        let aside = orch
            .data_dir()
            .join(format!("{slot_name}.draining"));
        let _ = std::fs::remove_dir_all(&aside);
        if std::fs::rename(&slot_dir, &aside).is_ok() {
            draining_dir = Some(aside);
        }
    }

    let mut promoted = true;
    if let Err(err) = orch.worktrees().promote_staging(&staging, &slot_dir).await {
        // Non-fatal: the process already runs from the staging path,
        // so serve from there and let the next deploy overwrite it.
        warn!(%err, "staging promotion failed, serving from staging path");
        slot_name = STAGING_SLOT.to_string();
        slot_dir = staging.clone();
        promoted = false;
    }
    slot.set_ident(slot_name.clone(), slot_dir.clone());

    // 7. The traffic switch.
    orch.app_proxy.set_target(app_port).await;
    orch.int_proxy.set_target(int_port).await;

    // 8. State before drain: once `live` points at the new slot, an
    // exit of the old one cannot clear the fresh proxy target.
    let previous_commit = old_live
        .as_ref()
        .map(|live| live.commit().to_string())
        .unwrap_or_default();
    {
        let mut state = orch.state.lock();
        state.prev = old_live.clone();
        state.live = Some(Arc::clone(&slot));
        state.last_deploy = Some(Utc::now());
    }

    // 9. Drain the demoted live.
    if let Some(old) = &old_live {
        orch.drain_slot(old).await;
    }
    if let Some(aside) = draining_dir {
        let _ = std::fs::remove_dir_all(aside);
    }

    // 10. Persist, restage, journal. When the slot stayed at the
    // staging path there is nothing to restage.
    update_links(orch, &slot_name, old_live.as_deref());
    if promoted {
        orch.worktrees()
            .create_staging(&slot_dir, &orch.data_dir().join(STAGING_SLOT), commit)
            .await;
        orch.worktrees().apply_shared_dirs(
            &orch.data_dir().join(STAGING_SLOT),
            &orch.config().shared_dirs,
        );
    }
    orch.journal
        .append(JournalAction::Deploy, commit, &slot_name, &previous_commit);

    info!(commit, slot = %slot_name, "deploy complete");
    Ok(Promotion {
        slot: slot_name,
        commit: commit.to_string(),
        previous_commit,
    })
}

/// Roll back to the previous slot: start its directory on fresh
/// ports, health-check, and swap live/prev.
///
/// # Errors
///
/// [`DeployError::Busy`] while a pipeline runs,
/// [`DeployError::NoPrevious`] with nothing to roll back to, and
/// [`DeployError::Unhealthy`] when the previous code no longer boots
/// healthy (the current live keeps serving).
pub async fn rollback(orch: &Arc<Orchestrator>) -> Result<Promotion, DeployError> {
    let (_guard, old_live, old_prev) = acquire(orch)?;
    let Some(prev) = old_prev else {
        return Err(DeployError::NoPrevious);
    };
    info!(commit = prev.commit(), "rollback started");

    let (app_port, int_port) = alloc_ports()?;

    let slot = orch
        .start_process(&prev.dir(), prev.commit(), app_port, int_port)
        .await
        .map_err(DeployError::Start)?;

    if !orch.health_check(&slot).await {
        warn!(commit = prev.commit(), "rollback rejected: health check failed");
        orch.kill_slot(&slot).await;
        return Err(DeployError::Unhealthy);
    }

    orch.app_proxy.set_target(app_port).await;
    orch.int_proxy.set_target(int_port).await;

    // State before drain, same reasoning as the deploy pipeline.
    slot.set_ident(prev.name(), prev.dir());
    let previous_commit = old_live
        .as_ref()
        .map(|live| live.commit().to_string())
        .unwrap_or_default();
    {
        let mut state = orch.state.lock();
        state.live = Some(Arc::clone(&slot));
        state.prev = old_live.clone();
        state.last_deploy = Some(Utc::now());
    }

    if let Some(old) = &old_live {
        orch.drain_slot(old).await;
    }

    update_links(orch, &slot.name(), old_live.as_deref());
    orch.worktrees()
        .create_staging(
            &slot.dir(),
            &orch.data_dir().join(STAGING_SLOT),
            slot.commit(),
        )
        .await;
    orch.worktrees().apply_shared_dirs(
        &orch.data_dir().join(STAGING_SLOT),
        &orch.config().shared_dirs,
    );
    orch.journal.append(
        JournalAction::Rollback,
        slot.commit(),
        &slot.name(),
        &previous_commit,
    );

    info!(commit = slot.commit(), slot = %slot.name(), "rollback complete");
    Ok(Promotion {
        slot: slot.name(),
        commit: slot.commit().to_string(),
        previous_commit,
    })
}

/// Atomically update the `live` and `prev` symlinks. Best-effort, like
/// the journal: a failed link never fails a promotion that already
/// switched traffic.
fn update_links(orch: &Arc<Orchestrator>, live_name: &str, old_live: Option<&Slot>) {
    let live_link = orch.data_dir().join(LIVE_LINK);
    if let Err(err) = persist::atomic_symlink(&live_link, live_name) {
        warn!(%err, "failed to update live symlink");
    }
    if let Some(old) = old_live {
        let prev_link = orch.data_dir().join(PREV_LINK);
        if let Err(err) = persist::atomic_symlink(&prev_link, &old.name()) {
            warn!(%err, "failed to update prev symlink");
        }
    }
}
