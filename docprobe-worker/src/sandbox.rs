//! Execution sandbox contract
//!
//! A sandbox is an isolated, resource-bounded container that runs one agent
//! command against a read-only repository and a writable output directory.
//! The worker only relies on the operations of [`SandboxRuntime`]; the
//! container engine behind it is an implementation detail.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Mount point of the cloned repository inside every sandbox
pub const REPO_MOUNT: &str = "/workspace/repo";

/// Mount point of the writable output directory inside every sandbox
pub const DATA_MOUNT: &str = "/workspace/data";

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The container engine itself cannot be reached; nothing can run
    #[error("sandbox runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("failed to start sandbox: {0}")]
    StartFailed(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox command failed: {0}")]
    Command(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether the error affects every sandbox rather than a single one
    pub fn is_fatal(&self) -> bool {
        matches!(self, SandboxError::RuntimeUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Opaque identifier assigned by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxId(pub String);

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }

    pub fn read_write(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }
}

/// Everything needed to launch one sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    /// Memory limit in engine syntax (e.g. `1g`)
    pub memory: String,
    /// CPU quota in fractional CPUs
    pub cpus: f64,
    pub working_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Running,
    Exited(i32),
}

/// Operations the worker needs from a container engine
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Checks that the engine is reachable
    async fn ping(&self) -> Result<()>;

    /// Launches a sandbox detached and returns immediately
    async fn start(&self, spec: &SandboxSpec) -> Result<SandboxId>;

    async fn inspect(&self, id: &SandboxId) -> Result<SandboxState>;

    /// Combined stdout and stderr captured so far
    async fn logs(&self, id: &SandboxId) -> Result<String>;

    /// Forcibly stops a sandbox; stopping an exited sandbox is not an error
    async fn kill(&self, id: &SandboxId) -> Result<()>;

    async fn remove(&self, id: &SandboxId) -> Result<()>;
}

/// How a watched sandbox stopped being active
#[derive(Debug)]
pub enum WatchResult {
    Exited(i32),
    TimedOut,
    Cancelled,
    Failed(SandboxError),
}

/// Polls `id` until it exits, times out, fails to inspect, or `cancel` fires
///
/// # Arguments
/// * `poll_interval` - Delay between two inspections; the first is immediate
/// * `timeout` - Hard limit measured from the call
pub async fn watch(
    runtime: &dyn SandboxRuntime,
    id: &SandboxId,
    poll_interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> WatchResult {
    let deadline = Instant::now() + timeout;
    let mut ticker = time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return WatchResult::Cancelled,
            _ = time::sleep_until(deadline) => return WatchResult::TimedOut,
            _ = ticker.tick() => {}
        }

        match runtime.inspect(id).await {
            Ok(SandboxState::Running) => continue,
            Ok(SandboxState::Exited(code)) => return WatchResult::Exited(code),
            Err(e) => return WatchResult::Failed(e),
        }
    }
}

/// Kills, collects logs from and removes a sandbox, logging failures
///
/// # Returns
/// The captured logs, if they could be read
pub async fn teardown(runtime: &dyn SandboxRuntime, id: &SandboxId, kill: bool) -> Option<String> {
    if kill {
        if let Err(e) = runtime.kill(id).await {
            tracing::warn!("Failed to kill sandbox {}: {}", id, e);
        }
    }

    let logs = match runtime.logs(id).await {
        Ok(logs) => Some(logs),
        Err(e) => {
            tracing::warn!("Failed to read logs of sandbox {}: {}", id, e);
            None
        }
    };

    if let Err(e) = runtime.remove(id).await {
        tracing::warn!("Failed to remove sandbox {}: {}", id, e);
    }

    logs
}
