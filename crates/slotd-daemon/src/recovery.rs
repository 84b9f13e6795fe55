//! Startup recovery from on-disk state.
//!
//! A daemon restart rediscovers the live slot through the `live`
//! symlink: the worktree's HEAD commit identifies what was running, a
//! fresh process is started on fresh ports and health-checked, and
//! only then adopted. The `prev` symlink becomes a cold slot so a
//! rollback can still start it.

use std::sync::Arc;

use slotd_core::persist::{read_slot_link, LIVE_LINK, PREV_LINK};
use slotd_core::process;
use tracing::{info, warn};

use crate::state::{Orchestrator, Slot};

/// Recover orchestrator state from the data directory symlinks.
///
/// Best-effort: any failure leaves the daemon with no live slot (the
/// caller may then auto-deploy HEAD). Dangling symlinks are pruned as
/// a side effect of resolution.
pub async fn recover(orch: &Arc<Orchestrator>) {
    recover_live(orch).await;
    recover_prev(orch).await;
}

async fn recover_live(orch: &Arc<Orchestrator>) {
    let Some(target) = read_slot_link(orch.data_dir(), LIVE_LINK) else {
        return;
    };
    let slot_dir = orch.data_dir().join(&target);

    let Some(commit) = orch.worktrees().head_commit(&slot_dir).await else {
        warn!(slot = %target, "live slot has no readable HEAD, skipping recovery");
        return;
    };

    let ports = process::alloc_port().and_then(|app| process::alloc_port().map(|int| (app, int)));
    let Ok((app_port, int_port)) = ports else {
        warn!("cannot allocate ports for recovery");
        return;
    };

    let slot = match orch
        .start_process(&slot_dir, &commit, app_port, int_port)
        .await
    {
        Ok(slot) => slot,
        Err(err) => {
            warn!(%err, slot = %target, "failed to restart live slot");
            return;
        }
    };

    if orch.health_check(&slot).await {
        slot.set_ident(target.clone(), slot_dir);
        orch.state.lock().live = Some(Arc::clone(&slot));
        orch.app_proxy.set_target(app_port).await;
        orch.int_proxy.set_target(int_port).await;
        info!(slot = %target, commit, "recovered live slot");
    } else {
        warn!(slot = %target, "recovered slot failed its health check");
        orch.kill_slot(&slot).await;
    }
}

async fn recover_prev(orch: &Arc<Orchestrator>) {
    let Some(target) = read_slot_link(orch.data_dir(), PREV_LINK) else {
        return;
    };
    let prev_dir = orch.data_dir().join(&target);

    let Some(commit) = orch.worktrees().head_commit(&prev_dir).await else {
        return;
    };

    // Cold: bootable directory, no process, exit pre-fired, so a
    // rollback can start it.
    orch.state.lock().prev = Some(Slot::cold(&target, &commit, prev_dir));
    info!(slot = %target, commit, "recovered previous slot as rollback target");
}
