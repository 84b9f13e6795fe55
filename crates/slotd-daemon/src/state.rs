//! Orchestrator state: slots and the single mutex that guards them.
//!
//! The orchestrator is the only writer of `live`/`prev` and the only
//! caller of proxy retargeting during a deploy. Slots are values owned
//! by the orchestrator behind `Arc`; the per-slot exit watcher holds an
//! orchestrator handle rather than a back-pointer, and identifies "am I
//! still live?" by slot id.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};
use slotd_core::persist::Journal;
use slotd_core::process::{self, ExitSignal, ProcessError};
use slotd_core::proxy::Intercept;
use slotd_core::{DeployConfig, DynamicProxy, WorktreeManager};
use tracing::{debug, info};

/// Process-wide slot instance counter. Ids are never reused, so the
/// exit watcher can safely decide whether the slot it watched is still
/// the live one.
static NEXT_SLOT_ID: AtomicU64 = AtomicU64::new(1);

/// Name and directory of a slot. Interior-mutable because promotion
/// renames the staging directory under a running process.
#[derive(Debug, Clone)]
struct SlotIdent {
    name: String,
    dir: PathBuf,
}

/// A running or bootable instance of the application.
#[derive(Debug)]
pub struct Slot {
    id: u64,
    commit: String,
    app_port: u16,
    int_port: u16,
    /// Process group leader; `None` for a cold slot.
    pid: Option<Pid>,
    /// Cleared by the exit watcher, which is its sole writer.
    alive: AtomicBool,
    exit: ExitSignal,
    ident: RwLock<SlotIdent>,
}

impl Slot {
    /// Construct a cold slot: a bootable directory with no process and
    /// a pre-fired exit signal, used for the recovered `prev`.
    #[must_use]
    pub fn cold(name: &str, commit: &str, dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed),
            commit: commit.to_string(),
            app_port: 0,
            int_port: 0,
            pid: None,
            alive: AtomicBool::new(false),
            exit: ExitSignal::fired(),
            ident: RwLock::new(SlotIdent {
                name: name.to_string(),
                dir,
            }),
        })
    }

    /// Directory basename (`slot-<hash>`, or `slot-staging` before
    /// promotion).
    #[must_use]
    pub fn name(&self) -> String {
        self.ident.read().name.clone()
    }

    /// Absolute worktree path.
    #[must_use]
    pub fn dir(&self) -> PathBuf {
        self.ident.read().dir.clone()
    }

    /// Commit pinned to this slot.
    #[must_use]
    pub fn commit(&self) -> &str {
        &self.commit
    }

    /// Dynamic public port of this slot instance.
    #[must_use]
    pub const fn app_port(&self) -> u16 {
        self.app_port
    }

    /// Dynamic internal port of this slot instance.
    #[must_use]
    pub const fn int_port(&self) -> u16 {
        self.int_port
    }

    /// Whether the process group is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Exit signal of this slot instance.
    #[must_use]
    pub fn exit(&self) -> &ExitSignal {
        &self.exit
    }

    pub(crate) fn set_ident(&self, name: String, dir: PathBuf) {
        *self.ident.write() = SlotIdent { name, dir };
    }
}

/// Mutable orchestrator state, guarded by one mutex.
#[derive(Default)]
pub(crate) struct OrchState {
    pub(crate) live: Option<Arc<Slot>>,
    pub(crate) prev: Option<Arc<Slot>>,
    pub(crate) deploying: bool,
    pub(crate) last_deploy: Option<DateTime<Utc>>,
}

/// The deployment orchestrator. One per daemon run.
pub struct Orchestrator {
    pub(crate) cfg: DeployConfig,
    pub(crate) repo_dir: PathBuf,
    pub(crate) data_dir: PathBuf,
    pub(crate) worktrees: WorktreeManager,
    pub(crate) journal: Journal,
    pub(crate) app_proxy: DynamicProxy,
    pub(crate) int_proxy: DynamicProxy,
    pub(crate) state: Mutex<OrchState>,
}

impl Orchestrator {
    /// Build an orchestrator over a repository and data directory.
    ///
    /// The public proxy listens on `cfg.port`; a second listener is
    /// only bound when `internal_port` is distinct. The intercept
    /// capability, if any, is installed on the public proxy.
    #[must_use]
    pub fn new(
        cfg: DeployConfig,
        repo_dir: PathBuf,
        data_dir: PathBuf,
        intercept: Option<Arc<dyn Intercept>>,
    ) -> Arc<Self> {
        let app_addr = (cfg.port > 0).then(|| ([0, 0, 0, 0], cfg.port).into());
        let int_addr = cfg
            .internal_listener_port()
            .map(|port| ([0, 0, 0, 0], port).into());

        Arc::new(Self {
            worktrees: WorktreeManager::new(&repo_dir),
            journal: Journal::new(&data_dir),
            app_proxy: DynamicProxy::new(app_addr, intercept),
            int_proxy: DynamicProxy::new(int_addr, None),
            cfg,
            repo_dir,
            data_dir,
            state: Mutex::new(OrchState::default()),
        })
    }

    /// Daemon configuration.
    #[must_use]
    pub fn config(&self) -> &DeployConfig {
        &self.cfg
    }

    /// The data directory holding slots, symlinks, logs and journal.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The application repository directory.
    #[must_use]
    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Worktree manager for the repository.
    #[must_use]
    pub fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    /// Bind the proxy listeners so the public port answers (with 503)
    /// even before the first deploy succeeds.
    pub async fn start_proxies(&self) {
        self.app_proxy.start().await;
        self.int_proxy.start().await;
    }

    /// Stop both proxy listeners. Called on daemon shutdown.
    pub async fn shutdown_proxies(&self) {
        self.app_proxy.shutdown().await;
        self.int_proxy.shutdown().await;
    }

    /// Whether anything is currently live.
    #[must_use]
    pub fn has_live(&self) -> bool {
        self.state.lock().live.is_some()
    }

    /// Spawn the application in `dir`, register its exit watcher, and
    /// return the provisional slot.
    ///
    /// The watcher is the sole writer of `alive = false`; when the
    /// exiting slot is still the current live it also clears both
    /// proxy targets, forcing 503s until the next deploy.
    ///
    /// # Errors
    ///
    /// Returns an error when the process cannot be spawned.
    pub(crate) async fn start_process(
        self: &Arc<Self>,
        dir: &Path,
        commit: &str,
        app_port: u16,
        int_port: u16,
    ) -> Result<Arc<Slot>, ProcessError> {
        let env = slotd_core::env::compose_env(
            &self.repo_dir,
            self.cfg.env_file.as_deref(),
            app_port,
            int_port,
        );

        let name = dir
            .file_name()
            .map_or_else(|| "slot".to_string(), |n| n.to_string_lossy().into_owned());
        let log_path = self.data_dir.join(format!("{name}.log"));

        let mut child = process::spawn_shell(&self.cfg.start_command, dir, &env, &log_path)?;
        let raw_pid = child.id().ok_or(ProcessError::NoPid)?;
        let pid = Pid::from_raw(raw_pid.try_into().map_err(|_| ProcessError::NoPid)?);

        let (notifier, exit) = ExitSignal::arm();
        let slot = Arc::new(Slot {
            id: NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed),
            commit: commit.to_string(),
            app_port,
            int_port,
            pid: Some(pid),
            alive: AtomicBool::new(true),
            exit,
            ident: RwLock::new(SlotIdent {
                name,
                dir: dir.to_path_buf(),
            }),
        });
        info!(slot = %slot.name(), commit, app_port, int_port, %pid, "started slot process");

        let orch = Arc::clone(self);
        let watched = Arc::clone(&slot);
        tokio::spawn(async move {
            let _ = child.wait().await;
            watched.alive.store(false, Ordering::Release);

            let was_live = {
                let state = orch.state.lock();
                state.live.as_ref().is_some_and(|live| live.id == watched.id)
            };
            if was_live {
                info!(slot = %watched.name(), "live slot exited, clearing proxy targets");
                orch.app_proxy.clear_target();
                orch.int_proxy.clear_target();
            } else {
                debug!(slot = %watched.name(), "slot process exited");
            }
            notifier.fire();
        });

        Ok(slot)
    }

    /// Health-check a freshly started slot against its internal port.
    pub(crate) async fn health_check(&self, slot: &Slot) -> bool {
        slotd_core::health::probe(
            slot.int_port,
            &self.cfg.health_endpoint,
            self.cfg.health_timeout(),
            &slot.exit,
        )
        .await
    }

    /// Drain a slot with the graceful protocol. A no-op for cold
    /// slots.
    pub(crate) async fn drain_slot(&self, slot: &Slot) {
        if let Some(pid) = slot.pid {
            debug!(slot = %slot.name(), %pid, "draining slot");
            process::drain_group(pid, &slot.exit, self.cfg.drain_timeout()).await;
        }
    }

    /// SIGKILL a slot's process group and wait for it to be reaped.
    /// Used when a new slot fails its health check.
    pub(crate) async fn kill_slot(&self, slot: &Slot) {
        if let Some(pid) = slot.pid {
            process::kill_group_and_wait(pid, &slot.exit).await;
        }
    }

    /// Drain every slot that still has a process. Called on daemon
    /// shutdown so no spawned process outlives the daemon.
    pub async fn drain_all(&self) {
        let slots = {
            let state = self.state.lock();
            [state.live.clone(), state.prev.clone()]
        };
        for slot in slots.into_iter().flatten() {
            self.drain_slot(&slot).await;
        }
    }

    /// Snapshot of live/prev/deploying for the control API.
    pub(crate) fn snapshot(&self) -> StateSnapshot {
        let state = self.state.lock();
        StateSnapshot {
            live: state.live.clone(),
            prev: state.prev.clone(),
            last_deploy: state.last_deploy,
        }
    }
}

/// Point-in-time view of orchestrator state.
pub(crate) struct StateSnapshot {
    pub(crate) live: Option<Arc<Slot>>,
    pub(crate) prev: Option<Arc<Slot>>,
    pub(crate) last_deploy: Option<DateTime<Utc>>,
}
