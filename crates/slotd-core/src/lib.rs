//! # slotd-core
//!
//! Core library for slotd - a single-host zero-downtime deployment
//! daemon.
//!
//! This crate provides the building blocks the daemon composes into the
//! deploy pipeline:
//!
//! - **Process supervision**: spawn application processes in their own
//!   process groups, watch for exit, and drain them gracefully
//! - **Health checks**: poll an HTTP health endpoint until it answers
//! - **Dynamic reverse proxy**: a listener whose upstream target is
//!   retargeted atomically at promotion time
//! - **Git worktrees**: one checkout per deployment slot, sharing the
//!   repository's object store
//! - **Persistent state**: symlinks and a journal so a daemon restart
//!   rediscovers what is live
//!
//! ## Example
//!
//! ```rust,no_run
//! use slotd_core::DeployConfig;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DeployConfig::from_file("slot-machine.json")?;
//! println!("public port: {}", config.port);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod env;
pub mod health;
pub mod persist;
pub mod process;
pub mod proxy;
pub mod worktree;

pub use config::DeployConfig;
pub use process::ExitSignal;
pub use proxy::DynamicProxy;
pub use worktree::WorktreeManager;
