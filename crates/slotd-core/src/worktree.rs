//! Git worktree management for deployment slots.
//!
//! Every slot is a detached git worktree of the application repository,
//! so all slots share one object store. The manager drives the `git`
//! binary and does the filesystem surgery a rename-based promotion
//! needs: worktree metadata lives under `<repo>/.git/worktrees/<name>`
//! and cross-references the slot's `.git` pointer file, so both sides
//! must be rewritten when a slot changes its name.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Budget for a single git operation.
const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Manages the worktrees of one repository.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_dir: PathBuf,
}

impl WorktreeManager {
    /// Create a manager rooted at `repo_dir`.
    #[must_use]
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    /// The repository directory this manager operates on.
    #[must_use]
    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Pin `dir` to `commit`.
    ///
    /// If `dir` is already a worktree, an in-place force-detach
    /// checkout is enough. Otherwise any leftover directory is
    /// removed, stale worktree metadata pruned, and a fresh detached
    /// worktree added.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkout or worktree creation fails.
    pub async fn prepare_slot(&self, dir: &Path, commit: &str) -> Result<(), WorktreeError> {
        if dir.join(".git").exists() {
            self.git(dir, &["checkout", "--force", "--detach", commit])
                .await?;
            return Ok(());
        }

        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        let _ = self.git(&self.repo_dir, &["worktree", "prune"]).await;

        let dir_str = dir.display().to_string();
        self.git(
            &self.repo_dir,
            &["worktree", "add", "--detach", &dir_str, commit],
        )
        .await?;
        Ok(())
    }

    /// Rename a staging worktree to its promoted name and repair the
    /// worktree metadata on both sides of the rename.
    ///
    /// # Errors
    ///
    /// Returns an error when the rename or the metadata rewrite fails.
    /// The caller treats this as non-fatal and keeps serving from the
    /// old path.
    pub async fn promote_staging(&self, old: &Path, new: &Path) -> Result<(), WorktreeError> {
        std::fs::rename(old, new)?;

        // The slot's .git pointer file names the metadata directory.
        let git_file = new.join(".git");
        let pointer = std::fs::read_to_string(&git_file)?;
        let meta_dir = PathBuf::from(
            pointer
                .trim()
                .strip_prefix("gitdir:")
                .ok_or_else(|| WorktreeError::BadGitPointer {
                    path: git_file.display().to_string(),
                })?
                .trim(),
        );

        // Point the metadata back at the renamed checkout.
        let abs_git_file = absolute(&git_file);
        std::fs::write(
            meta_dir.join("gitdir"),
            format!("{}\n", abs_git_file.display()),
        )?;

        // Rename the metadata directory to match the new basename and
        // update the pointer file accordingly.
        if let (Some(parent), Some(name)) = (meta_dir.parent(), new.file_name()) {
            let new_meta_dir = parent.join(name);
            if new_meta_dir != meta_dir {
                std::fs::rename(&meta_dir, &new_meta_dir)?;
                let abs_meta = absolute(&new_meta_dir);
                std::fs::write(&git_file, format!("gitdir: {}\n", abs_meta.display()))?;
            }
        }

        Ok(())
    }

    /// Create a fresh staging worktree at `dst`, preferably as a
    /// copy-on-write clone of `src` (the just-promoted slot), falling
    /// back to a plain detached worktree. Best-effort: a failed clone
    /// never fails the deploy.
    pub async fn create_staging(&self, src: &Path, dst: &Path, commit: &str) {
        if src == dst {
            return;
        }
        // A leftover staging dir would make the copy nest inside it.
        if dst.exists() {
            let _ = std::fs::remove_dir_all(dst);
        }
        if cow_copy(src, dst).await {
            match self.fix_cloned_worktree(dst, commit).await {
                Ok(()) => return,
                Err(err) => {
                    debug!(%err, "clone metadata repair failed, falling back");
                    let _ = std::fs::remove_dir_all(dst);
                }
            }
        }

        if dst.exists() {
            let _ = std::fs::remove_dir_all(dst);
        }
        let _ = self.git(&self.repo_dir, &["worktree", "prune"]).await;
        let dst_str = dst.display().to_string();
        if let Err(err) = self
            .git(
                &self.repo_dir,
                &["worktree", "add", "--detach", &dst_str, commit],
            )
            .await
        {
            warn!(%err, "failed to create staging worktree");
        }
    }

    /// Synthesize worktree metadata for a filesystem clone.
    ///
    /// The copied `.git` pointer still references the source slot's
    /// metadata; left alone, git operations inside the clone would
    /// corrupt the repository. Writes `HEAD`, `commondir` and `gitdir`
    /// under `<repo>/.git/worktrees/<staging>`, rewrites the clone's
    /// `.git` pointer, and rebuilds the index.
    async fn fix_cloned_worktree(&self, wt_dir: &Path, commit: &str) -> Result<(), WorktreeError> {
        let git_file = wt_dir.join(".git");
        let _ = std::fs::remove_file(&git_file);

        let repo_git = self.repo_dir.join(".git");
        if !repo_git.is_dir() {
            return Err(WorktreeError::BadGitPointer {
                path: repo_git.display().to_string(),
            });
        }

        let name = wt_dir
            .file_name()
            .ok_or_else(|| WorktreeError::BadGitPointer {
                path: wt_dir.display().to_string(),
            })?;
        let meta_dir = repo_git.join("worktrees").join(name);
        if meta_dir.exists() {
            std::fs::remove_dir_all(&meta_dir)?;
        }
        std::fs::create_dir_all(&meta_dir)?;

        let abs_git_file = absolute(&git_file);
        let abs_meta_dir = absolute(&meta_dir);

        std::fs::write(meta_dir.join("HEAD"), format!("{commit}\n"))?;
        std::fs::write(meta_dir.join("commondir"), "../..\n")?;
        std::fs::write(
            meta_dir.join("gitdir"),
            format!("{}\n", abs_git_file.display()),
        )?;
        std::fs::write(&git_file, format!("gitdir: {}\n", abs_meta_dir.display()))?;

        // Rebuild the index from HEAD so the clone starts clean.
        self.git(wt_dir, &["reset", "--quiet"]).await?;
        Ok(())
    }

    /// Replace each shared directory in `slot_dir` with a symlink to
    /// the canonical location in the repository, so every slot sees
    /// the same underlying storage.
    ///
    /// Names that are absolute or escape the slot (`.`, `..`) are
    /// rejected. On first use the canonical directory is seeded from
    /// the slot's own checkout contents when possible.
    pub fn apply_shared_dirs(&self, slot_dir: &Path, names: &[String]) {
        for name in names {
            if !valid_shared_name(name) {
                warn!(name, "ignoring invalid shared dir");
                continue;
            }

            let target = self.repo_dir.join(name);
            let slot_path = slot_dir.join(name);

            if !target.exists() {
                // First use: adopt the slot's real directory as the
                // canonical contents when there is one to adopt.
                let seeded = slot_path.is_dir()
                    && !slot_path.is_symlink()
                    && target
                        .parent()
                        .is_some_and(|p| std::fs::create_dir_all(p).is_ok())
                    && std::fs::rename(&slot_path, &target).is_ok();
                if !seeded {
                    if let Err(err) = std::fs::create_dir_all(&target) {
                        warn!(name, %err, "cannot create shared dir");
                        continue;
                    }
                }
            }

            // Clear whatever the checkout or a CoW clone left behind.
            if slot_path.is_symlink() || slot_path.is_file() {
                let _ = std::fs::remove_file(&slot_path);
            } else if slot_path.is_dir() {
                let _ = std::fs::remove_dir_all(&slot_path);
            }
            if let Some(parent) = slot_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            let abs_target = absolute(&target);
            if let Err(err) = std::os::unix::fs::symlink(&abs_target, &slot_path) {
                warn!(name, %err, "cannot link shared dir");
            }
        }
    }

    /// Remove a slot worktree: `git worktree remove --force`, falling
    /// back to a plain directory removal plus metadata prune.
    pub async fn remove(&self, dir: &Path) {
        let dir_str = dir.display().to_string();
        if self
            .git(&self.repo_dir, &["worktree", "remove", "--force", &dir_str])
            .await
            .is_ok()
        {
            return;
        }
        let _ = std::fs::remove_dir_all(dir);
        let _ = self.git(&self.repo_dir, &["worktree", "prune"]).await;
    }

    /// HEAD commit of the worktree at `dir`, or `None` when it cannot
    /// be determined.
    pub async fn head_commit(&self, dir: &Path) -> Option<String> {
        let out = self.git(dir, &["rev-parse", "HEAD"]).await.ok()?;
        let commit = out.trim().to_string();
        (!commit.is_empty()).then_some(commit)
    }

    /// Run a git command in `cwd`, capturing combined output.
    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String, WorktreeError> {
        let mut cmd = Command::new("git");
        cmd.current_dir(cwd).args(args);

        let command = format!("git {}", args.join(" "));
        let output = tokio::time::timeout(GIT_TIMEOUT, cmd.output())
            .await
            .map_err(|_| WorktreeError::Timeout {
                command: command.clone(),
            })?
            .map_err(WorktreeError::Io)?;

        if !output.status.success() {
            let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if detail.is_empty() {
                detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            return Err(WorktreeError::Git { command, detail });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Recursive copy-on-write copy, where the platform supports one.
/// Returns `false` when the copy failed (caller falls back).
async fn cow_copy(src: &Path, dst: &Path) -> bool {
    let src = src.display().to_string();
    let dst = dst.display().to_string();

    #[cfg(target_os = "macos")]
    let args = ["-c", "-R", src.as_str(), dst.as_str()];
    #[cfg(not(target_os = "macos"))]
    let args = ["-a", "--reflink=always", src.as_str(), dst.as_str()];

    match Command::new("cp").args(args).output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// A shared dir name must stay inside the slot: relative, and free of
/// `.`/`..` components.
fn valid_shared_name(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Best-effort absolute form of a path that may not exist yet.
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Worktree errors.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// Filesystem error during worktree surgery.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A git command exited non-zero.
    #[error("{command}: {detail}")]
    Git {
        /// The command that failed.
        command: String,
        /// Combined stderr/stdout of the failure.
        detail: String,
    },

    /// A git command exceeded its budget.
    #[error("{command}: timed out")]
    Timeout {
        /// The command that timed out.
        command: String,
    },

    /// A `.git` pointer file did not have the expected shape.
    #[error("unexpected .git layout at {path}")]
    BadGitPointer {
        /// The offending path.
        path: String,
    },
}
