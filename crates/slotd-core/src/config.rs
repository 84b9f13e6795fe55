//! Deployment configuration.
//!
//! Loaded from `slot-machine.json` at the repository root. Unknown
//! fields are accepted so older daemons tolerate configs written by
//! newer tooling.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for one daemon run. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Command run in the staging worktree before the app starts
    /// (dependency install, asset build). Optional.
    #[serde(default)]
    pub setup_command: Option<String>,

    /// Command that starts the application, run via `/bin/sh -c`.
    pub start_command: String,

    /// Public port the reverse proxy listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Internal port for the second proxy. A listener is only bound
    /// when this differs from `port`.
    #[serde(default)]
    pub internal_port: Option<u16>,

    /// Health check path polled on the slot's internal port.
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,

    /// Total budget for the health check loop.
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,

    /// Budget for graceful shutdown before SIGKILL.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Env file loaded into every application process. Relative paths
    /// resolve against the repository directory.
    #[serde(default)]
    pub env_file: Option<String>,

    /// Port for the localhost control API.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Directory names (relative) that persist across deploys. Each is
    /// replaced in every slot by a symlink to a canonical location.
    #[serde(default)]
    pub shared_dirs: Vec<String>,
}

const fn default_port() -> u16 {
    3000
}

fn default_health_endpoint() -> String {
    "/healthz".to_string()
}

const fn default_health_timeout_ms() -> u64 {
    10_000
}

const fn default_drain_timeout_ms() -> u64 {
    5_000
}

const fn default_api_port() -> u16 {
    9100
}

impl DeployConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse as
    /// a config object.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(config)
    }

    /// Health check loop budget as a [`Duration`].
    #[must_use]
    pub const fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Graceful drain budget as a [`Duration`].
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Port for the internal proxy listener, if one should be bound.
    ///
    /// `None` when `internal_port` is absent, zero, or equal to the
    /// public port (in which case the internal proxy only tracks its
    /// target without listening).
    #[must_use]
    pub fn internal_listener_port(&self) -> Option<u16> {
        self.internal_port
            .filter(|&p| p != 0 && p != self.port)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid JSON for this schema.
    #[error("cannot parse {path}: {source}")]
    Parse {
        /// Path that was attempted.
        path: String,
        /// Underlying parse error.
        source: serde_json::Error,
    },
}
