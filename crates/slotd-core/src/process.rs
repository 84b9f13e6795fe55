//! Subprocess lifecycle primitives.
//!
//! Application processes are spawned via `/bin/sh -c` in their own
//! process group so that signalling the group terminates the whole
//! tree. Exit is observed through a single-shot [`ExitSignal`] that any
//! number of tasks can wait on, and shutdown follows the
//! graceful-then-forced drain protocol.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Single-shot signal fired exactly once when a process exits.
///
/// Cheap to clone; every clone observes the same firing. A signal can
/// be constructed pre-fired for slots that have no running process.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    rx: watch::Receiver<bool>,
}

/// Write half of an [`ExitSignal`], held by the exit watcher.
#[derive(Debug)]
pub struct ExitNotifier {
    tx: watch::Sender<bool>,
}

impl ExitSignal {
    /// Create a fresh signal and its notifier.
    #[must_use]
    pub fn arm() -> (ExitNotifier, Self) {
        let (tx, rx) = watch::channel(false);
        (ExitNotifier { tx }, Self { rx })
    }

    /// Create a signal that has already fired (cold slot, no process).
    #[must_use]
    pub fn fired() -> Self {
        let (_, rx) = watch::channel(true);
        Self { rx }
    }

    /// Wait until the signal fires. Returns immediately if it already
    /// has.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // If the notifier is dropped without firing, the process
        // watcher is gone; treat that as exited.
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }
}

impl ExitNotifier {
    /// Fire the signal, waking every waiter.
    pub fn fire(self) {
        let _ = self.tx.send(true);
    }
}

/// Process errors.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The child could not be spawned.
    #[error("spawn failed: {0}")]
    Spawn(std::io::Error),

    /// The spawned child has no PID (already reaped).
    #[error("spawned process has no pid")]
    NoPid,

    /// The setup command exited non-zero.
    #[error("setup command failed ({status}): {stderr_tail}")]
    SetupFailed {
        /// Exit status description.
        status: String,
        /// Tail of the command's stderr.
        stderr_tail: String,
    },

    /// The setup command could not be executed at all.
    #[error("setup command failed: {0}")]
    SetupIo(std::io::Error),
}

/// Allocate a fresh ephemeral TCP port.
///
/// Binds `127.0.0.1:0`, reads the assigned port, and immediately
/// closes the socket. The kernel may hand the port to someone else
/// before the child binds it; that race surfaces as an unhealthy start
/// and is accepted.
///
/// # Errors
///
/// Returns an error if no port can be bound at all.
pub fn alloc_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Spawn `command` via `/bin/sh -c` in its own process group.
///
/// `env` pairs are overlaid on the inherited daemon environment in
/// order. Stdout and stderr are appended to `log_path`; if the log
/// file cannot be opened the output is discarded instead of failing
/// the spawn.
///
/// # Errors
///
/// Returns [`ProcessError::Spawn`] if the shell cannot be started.
pub fn spawn_shell(
    command: &str,
    cwd: &Path,
    env: &[(String, String)],
    log_path: &Path,
) -> Result<Child, ProcessError> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(false)
        .process_group(0);

    match open_log(log_path) {
        Some((out, err)) => {
            cmd.stdout(out).stderr(err);
        }
        None => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    cmd.spawn().map_err(ProcessError::Spawn)
}

/// Open the slot log for appending, returning stdio handles for both
/// streams. Best-effort: `None` means "discard output".
fn open_log(path: &Path) -> Option<(Stdio, Stdio)> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()?;
    let clone = file.try_clone().ok()?;
    Some((Stdio::from(file), Stdio::from(clone)))
}

/// Run a setup command to completion in `cwd` with the composed
/// environment, capturing output.
///
/// # Errors
///
/// Returns [`ProcessError::SetupFailed`] with the stderr tail when the
/// command exits non-zero, or [`ProcessError::SetupIo`] when it cannot
/// be executed.
pub async fn run_setup(
    command: &str,
    cwd: &Path,
    env: &[(String, String)],
) -> Result<(), ProcessError> {
    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(ProcessError::SetupIo)?;

    if output.status.success() {
        return Ok(());
    }

    Err(ProcessError::SetupFailed {
        status: output.status.to_string(),
        stderr_tail: tail(&output.stderr, 2048),
    })
}

/// Last `max` bytes of `bytes` as lossy UTF-8.
fn tail(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

/// Send a signal to a process group, ignoring "no such process".
pub fn signal_group(pid: Pid, signal: Signal) {
    match killpg(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(%pid, ?signal, %err, "failed to signal process group"),
    }
}

/// Drain a process group: SIGTERM, wait for exit or `timeout`, then
/// SIGKILL and wait unconditionally.
pub async fn drain_group(pid: Pid, exit: &ExitSignal, timeout: Duration) {
    signal_group(pid, Signal::SIGTERM);

    if tokio::time::timeout(timeout, exit.wait()).await.is_err() {
        debug!(%pid, ?timeout, "drain timed out, sending SIGKILL");
        signal_group(pid, Signal::SIGKILL);
        exit.wait().await;
    }
}

/// SIGKILL a process group and wait for the exit signal. Used when a
/// new slot fails its health check.
pub async fn kill_group_and_wait(pid: Pid, exit: &ExitSignal) {
    signal_group(pid, Signal::SIGKILL);
    exit.wait().await;
}
