//! Shared harness for daemon integration tests.
//!
//! Builds a scratch git repository, compiles the standalone test app
//! fixture once per test binary, and runs a real orchestrator plus
//! control API on ephemeral ports.

#![allow(dead_code)] // each test binary uses a subset of the harness

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;

use slotd_core::process::alloc_port;
use slotd_core::DeployConfig;
use slotd_daemon::{api, recovery, Orchestrator};
use tokio::sync::watch;

/// Compile the test app fixture with rustc, once per test binary.
pub fn testapp() -> PathBuf {
    static TESTAPP: OnceLock<PathBuf> = OnceLock::new();
    TESTAPP
        .get_or_init(|| {
            let src = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/testapp.rs");
            let out_dir =
                std::env::temp_dir().join(format!("slotd-testapp-{}", std::process::id()));
            std::fs::create_dir_all(&out_dir).unwrap();
            let bin = out_dir.join("testapp");

            let output = std::process::Command::new("rustc")
                .args(["--edition", "2021", "-O"])
                .arg(&src)
                .arg("-o")
                .arg(&bin)
                .output()
                .expect("rustc not found");
            assert!(
                output.status.success(),
                "testapp compile failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            bin
        })
        .clone()
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = std::process::Command::new("git")
        .current_dir(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .expect("git not found");
    assert!(
        output.status.success(),
        "git {args:?}: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Scratch repo, data dir and port allocations shared by one test.
pub struct TestEnv {
    pub repo: tempfile::TempDir,
    pub data: tempfile::TempDir,
    /// Commit hashes, oldest first. Commit `i` writes `v{i+1}` into
    /// `version.txt`.
    pub commits: Vec<String>,
    pub public_port: u16,
    pub internal_port: u16,
}

impl TestEnv {
    /// Create a repo with `n` commits and allocate proxy ports.
    pub fn new(n: usize) -> Self {
        let repo = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();

        git(repo.path(), &["init", "-q", "-b", "main"]);
        let mut commits = Vec::new();
        for i in 1..=n {
            std::fs::write(repo.path().join("version.txt"), format!("v{i}\n")).unwrap();
            git(repo.path(), &["add", "."]);
            git(repo.path(), &["commit", "-q", "-m", &format!("commit {i}")]);
            commits.push(git(repo.path(), &["rev-parse", "HEAD"]));
        }

        Self {
            repo,
            data,
            commits,
            public_port: alloc_port().unwrap(),
            internal_port: alloc_port().unwrap(),
        }
    }

    /// Write the repo's `.env` file (read by the daemon at spawn
    /// time, not from the slot checkout).
    pub fn set_env_file(&self, content: &str) {
        std::fs::write(self.repo.path().join(".env"), content).unwrap();
    }

    /// Reset the `.env` file to empty.
    pub fn clear_env_file(&self) {
        self.set_env_file("");
    }

    pub fn public_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.public_port, path)
    }

    pub fn internal_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.internal_port, path)
    }
}

/// Pipeline knobs for a daemon launch.
pub struct Opts {
    pub health_timeout_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            health_timeout_ms: 8_000,
            drain_timeout_ms: 5_000,
        }
    }
}

/// A running orchestrator with its control API bound on an ephemeral
/// port.
pub struct TestDaemon {
    pub orch: Arc<Orchestrator>,
    pub api: String,
    pub client: reqwest::Client,
    shutdown: watch::Sender<bool>,
}

/// Launch a daemon over the test env: proxies bound, state recovered
/// from disk (a no-op on a fresh data dir), no auto-deploy.
pub async fn launch(env: &TestEnv, opts: &Opts) -> TestDaemon {
    let cfg: DeployConfig = serde_json::from_value(serde_json::json!({
        "start_command": format!("exec {}", testapp().display()),
        "port": env.public_port,
        "internal_port": env.internal_port,
        "health_endpoint": "/healthz",
        "health_timeout_ms": opts.health_timeout_ms,
        "drain_timeout_ms": opts.drain_timeout_ms,
        "env_file": ".env",
    }))
    .unwrap();

    let orch = Orchestrator::new(
        cfg,
        env.repo.path().canonicalize().unwrap(),
        env.data.path().to_path_buf(),
        None,
    );
    orch.start_proxies().await;
    recovery::recover(&orch).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, mut rx) = watch::channel(false);
    let router = api::router(Arc::clone(&orch));
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = rx.wait_for(|stop| *stop).await;
            })
            .await
            .unwrap();
    });

    TestDaemon {
        orch,
        api: format!("http://127.0.0.1:{}", addr.port()),
        client: reqwest::Client::new(),
        shutdown,
    }
}

impl TestDaemon {
    pub async fn deploy(&self, commit: &str) -> (reqwest::StatusCode, api::DeployResponse) {
        let response = self
            .client
            .post(format!("{}/deploy", self.api))
            .json(&serde_json::json!({ "commit": commit }))
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    pub async fn rollback(&self) -> (reqwest::StatusCode, api::RollbackResponse) {
        let response = self
            .client
            .post(format!("{}/rollback", self.api))
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    pub async fn status(&self) -> api::StatusResponse {
        self.client
            .get(format!("{}/status", self.api))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Stop like the daemon's signal path: drain every slot, stop the
    /// proxies, then the API server.
    pub async fn stop(self) {
        self.orch.drain_all().await;
        self.orch.shutdown_proxies().await;
        let _ = self.shutdown.send(true);
    }
}

/// Poll `f` until it returns true or `budget` elapses.
pub async fn eventually<F, Fut>(budget: std::time::Duration, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if f().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    false
}
