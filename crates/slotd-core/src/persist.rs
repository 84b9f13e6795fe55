//! Crash-safe on-disk deployment state.
//!
//! The data directory is authoritative across daemon restarts: `live`
//! and `prev` symlinks name the slot directories, and `journal.ndjson`
//! records every promotion. Symlink updates go through
//! write-temp-then-rename so an observer never sees a broken link.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Basename of the symlink naming the live slot.
pub const LIVE_LINK: &str = "live";

/// Basename of the symlink naming the rollback target.
pub const PREV_LINK: &str = "prev";

/// Basename of the staging workspace slot.
pub const STAGING_SLOT: &str = "slot-staging";

/// Slot directory basename for a commit: `slot-` plus the first eight
/// hex characters.
#[must_use]
pub fn slot_name(commit: &str) -> String {
    let short = commit.get(..8).unwrap_or(commit);
    format!("slot-{short}")
}

/// Replace `link` so it points at `target`, atomically.
///
/// A temporary symlink is created next to the final one and renamed
/// into place; readers observe either the old or the new target.
///
/// # Errors
///
/// Returns an error if the temporary link cannot be created or
/// renamed.
pub fn atomic_symlink(link: &Path, target: &str) -> std::io::Result<()> {
    let mut tmp = link.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let _ = std::fs::remove_file(&tmp);
    std::os::unix::fs::symlink(target, &tmp)?;
    std::fs::rename(&tmp, link)
}

/// Resolve a slot symlink to its target basename.
///
/// Returns `None` when the link is absent or points at a directory
/// that no longer exists; a dangling link is removed so the next
/// startup does not trip over it.
#[must_use]
pub fn read_slot_link(data_dir: &Path, link_name: &str) -> Option<String> {
    let link = data_dir.join(link_name);
    let target = std::fs::read_link(&link).ok()?;
    let target = target.to_string_lossy().into_owned();

    if data_dir.join(&target).is_dir() {
        Some(target)
    } else {
        let _ = std::fs::remove_file(&link);
        None
    }
}

/// What a journal entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalAction {
    /// A commit was promoted to live.
    Deploy,
    /// The previous slot was promoted back to live.
    Rollback,
}

/// One line of `journal.ndjson`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// RFC3339 timestamp.
    pub time: String,
    /// What happened.
    pub action: JournalAction,
    /// The commit now live.
    pub commit: String,
    /// Basename of the slot directory serving it.
    pub slot_dir: String,
    /// The commit that was live before, empty for the first deploy.
    pub prev_commit: String,
}

/// Append-only NDJSON event log. Advisory: nothing reads it back, and
/// appends never fail the pipeline.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    /// Journal for a data directory.
    #[must_use]
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("journal.ndjson"),
        }
    }

    /// Append one event. Best-effort; failures are logged at debug.
    pub fn append(&self, action: JournalAction, commit: &str, slot_dir: &str, prev_commit: &str) {
        let entry = JournalEntry {
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            action,
            commit: commit.to_string(),
            slot_dir: slot_dir.to_string(),
            prev_commit: prev_commit.to_string(),
        };

        let Ok(mut line) = serde_json::to_string(&entry) else {
            return;
        };
        line.push('\n');

        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| std::io::Write::write_all(&mut file, line.as_bytes()));
        if let Err(err) = result {
            debug!(path = %self.path.display(), %err, "journal append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_names_use_the_short_hash() {
        assert_eq!(
            slot_name("0123456789abcdef0123456789abcdef01234567"),
            "slot-01234567"
        );
        assert_eq!(slot_name("abc"), "slot-abc");
    }

    #[test]
    fn atomic_symlink_replaces_existing_links() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join(LIVE_LINK);

        atomic_symlink(&link, "slot-aaaaaaaa").unwrap();
        assert_eq!(
            std::fs::read_link(&link).unwrap().to_string_lossy(),
            "slot-aaaaaaaa"
        );

        // Replacing must not require unlinking first.
        atomic_symlink(&link, "slot-bbbbbbbb").unwrap();
        assert_eq!(
            std::fs::read_link(&link).unwrap().to_string_lossy(),
            "slot-bbbbbbbb"
        );
    }

    #[test]
    fn read_slot_link_resolves_valid_targets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("slot-cccccccc")).unwrap();
        atomic_symlink(&dir.path().join(LIVE_LINK), "slot-cccccccc").unwrap();

        assert_eq!(
            read_slot_link(dir.path(), LIVE_LINK).as_deref(),
            Some("slot-cccccccc")
        );
    }

    #[test]
    fn read_slot_link_prunes_dangling_links() {
        let dir = tempfile::tempdir().unwrap();
        atomic_symlink(&dir.path().join(PREV_LINK), "slot-gone").unwrap();

        assert_eq!(read_slot_link(dir.path(), PREV_LINK), None);
        // The dangling link was cleaned up.
        assert!(!dir.path().join(PREV_LINK).is_symlink());
    }

    #[test]
    fn read_slot_link_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_slot_link(dir.path(), LIVE_LINK), None);
    }

    #[test]
    fn journal_appends_parseable_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path());

        journal.append(JournalAction::Deploy, "aaaa", "slot-aaaa", "");
        journal.append(JournalAction::Rollback, "bbbb", "slot-bbbb", "aaaa");

        let data = std::fs::read_to_string(dir.path().join("journal.ndjson")).unwrap();
        let entries: Vec<JournalEntry> = data
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, JournalAction::Deploy);
        assert_eq!(entries[0].commit, "aaaa");
        assert_eq!(entries[0].prev_commit, "");
        assert_eq!(entries[1].action, JournalAction::Rollback);
        assert_eq!(entries[1].slot_dir, "slot-bbbb");
        // Timestamps are RFC3339.
        assert!(chrono::DateTime::parse_from_rfc3339(&entries[0].time).is_ok());
    }
}
