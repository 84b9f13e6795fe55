//! Environment composition for application processes.
//!
//! Every spawned process inherits the daemon's environment, extended
//! with the configured env file, and finally three authoritative
//! variables that always win: `SLOT_MACHINE=1`, `PORT` and
//! `INTERNAL_PORT`.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Parse an env file into key/value pairs.
///
/// One `KEY=VALUE` per line. Blank lines and `#` comments are ignored,
/// surrounding whitespace is trimmed, and lines without `=` are
/// skipped.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn load_env_file(path: &Path) -> std::io::Result<Vec<(String, String)>> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut pairs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        pairs.push((key.to_string(), value.to_string()));
    }
    Ok(pairs)
}

/// Compose the environment extension for a slot process.
///
/// Returns the pairs to overlay on the inherited daemon environment:
/// the env file contents (if configured and readable) followed by the
/// authoritative `SLOT_MACHINE`, `PORT` and `INTERNAL_PORT` variables.
/// Later entries override earlier ones when applied, so the
/// authoritative variables beat anything the env file set.
///
/// Relative `env_file` paths resolve against `repo_dir`. A missing or
/// unreadable env file is skipped.
#[must_use]
pub fn compose_env(
    repo_dir: &Path,
    env_file: Option<&str>,
    app_port: u16,
    int_port: u16,
) -> Vec<(String, String)> {
    let mut env = Vec::new();

    if let Some(env_file) = env_file {
        let path = if Path::new(env_file).is_absolute() {
            PathBuf::from(env_file)
        } else {
            repo_dir.join(env_file)
        };
        match load_env_file(&path) {
            Ok(pairs) => env.extend(pairs),
            Err(err) => debug!(path = %path.display(), %err, "skipping env file"),
        }
    }

    env.push(("SLOT_MACHINE".to_string(), "1".to_string()));
    env.push(("PORT".to_string(), app_port.to_string()));
    env.push(("INTERNAL_PORT".to_string(), int_port.to_string()));
    env
}
