//! Container engine CLI runtime
//!
//! Implements [`SandboxRuntime`] by shelling out to `podman` or `docker`:
//! - `run -d` with resource limits and mounts to start a sandbox
//! - `inspect` to poll its state
//! - `logs`, `kill` and `rm -f` to collect and clean up
//!
//! Every sandbox started through a [`ContainerCli`] is tracked until it is
//! removed, and anything still tracked is force-removed on drop.

use async_trait::async_trait;
use std::collections::HashSet;
use std::process::Output;
use std::sync::Mutex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::sandbox::{Result, SandboxError, SandboxId, SandboxRuntime, SandboxSpec, SandboxState};

pub struct ContainerCli {
    engine: String,
    live: Mutex<HashSet<String>>,
}

impl ContainerCli {
    /// Creates a runtime for the given engine binary (e.g. "podman", "docker")
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            live: Mutex::new(HashSet::new()),
        }
    }

    fn track(&self, id: &str, live: bool) {
        let mut set = match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if live {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }

    async fn run(&self, args: &[String]) -> Result<Output> {
        let output = Command::new(&self.engine)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                SandboxError::RuntimeUnavailable(format!("failed to execute {}: {}", self.engine, e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stdout.trim().is_empty() {
            debug!("{} {} stdout: {}", self.engine, args[0], stdout.trim());
        }
        if !stderr.trim().is_empty() {
            debug!("{} {} stderr: {}", self.engine, args[0], stderr.trim());
        }

        Ok(output)
    }
}

/// Builds the `run` argument list for a spec
fn run_args(spec: &SandboxSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--memory".to_string(),
        spec.memory.clone(),
        "--cpus".to_string(),
        spec.cpus.to_string(),
        "-w".to_string(),
        spec.working_dir.clone(),
    ];

    for mount in &spec.mounts {
        let mode = if mount.read_only { "ro" } else { "rw" };
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}:{}",
            mount.source.display(),
            mount.target,
            mode
        ));
    }

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Parses `inspect --format "{{.State.Running}} {{.State.ExitCode}}"` output
fn parse_state(output: &str) -> Option<SandboxState> {
    let mut parts = output.split_whitespace();
    let running = parts.next()?;
    let exit_code = parts.next()?.parse::<i32>().ok()?;

    match running {
        "true" => Some(SandboxState::Running),
        "false" => Some(SandboxState::Exited(exit_code)),
        _ => None,
    }
}

/// Whether a failed engine call means the engine daemon is unreachable
fn is_connection_error(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("cannot connect") || stderr.contains("connection refused")
}

fn is_missing(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such") || stderr.contains("no container")
}

#[async_trait]
impl SandboxRuntime for ContainerCli {
    async fn ping(&self) -> Result<()> {
        let output = self.run(&["version".to_string()]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::RuntimeUnavailable(format!(
                "{} is not working correctly: {}",
                self.engine,
                stderr.trim()
            )));
        }

        info!("Container engine {} is available", self.engine);
        Ok(())
    }

    async fn start(&self, spec: &SandboxSpec) -> Result<SandboxId> {
        info!("Starting sandbox {} from image {}", spec.name, spec.image);

        let output = self.run(&run_args(spec)).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let message = format!(
                "sandbox {}: exit_code={}, stderr='{}'",
                spec.name,
                exit_code,
                stderr.trim()
            );
            if is_connection_error(&stderr) {
                return Err(SandboxError::RuntimeUnavailable(message));
            }
            return Err(SandboxError::StartFailed(message));
        }

        let container_id = stdout.trim().to_string();
        let id = if container_id.is_empty() {
            spec.name.clone()
        } else {
            container_id
        };
        self.track(&id, true);

        debug!("Sandbox {} started with ID {}", spec.name, id);
        Ok(SandboxId(id))
    }

    async fn inspect(&self, id: &SandboxId) -> Result<SandboxState> {
        let output = self
            .run(&[
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.Running}} {{.State.ExitCode}}".to_string(),
                id.0.clone(),
            ])
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            if is_connection_error(&stderr) {
                return Err(SandboxError::RuntimeUnavailable(stderr.trim().to_string()));
            }
            if is_missing(&stderr) {
                return Err(SandboxError::NotFound(id.0.clone()));
            }
            return Err(SandboxError::Command(format!(
                "inspect {}: {}",
                id,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_state(&stdout).ok_or_else(|| {
            SandboxError::Command(format!("unexpected inspect output: '{}'", stdout.trim()))
        })
    }

    async fn logs(&self, id: &SandboxId) -> Result<String> {
        let output = self.run(&["logs".to_string(), id.0.clone()]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::Command(format!(
                "logs {}: {}",
                id,
                stderr.trim()
            )));
        }

        let mut logs = String::from_utf8_lossy(&output.stdout).to_string();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    async fn kill(&self, id: &SandboxId) -> Result<()> {
        let output = self.run(&["kill".to_string(), id.0.clone()]).await?;
        if !output.status.success() {
            // Already exited
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("kill {} returned non-zero: {}", id, stderr.trim());
        }
        Ok(())
    }

    async fn remove(&self, id: &SandboxId) -> Result<()> {
        let output = self
            .run(&["rm".to_string(), "-f".to_string(), id.0.clone()])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !is_missing(&stderr) {
                return Err(SandboxError::Command(format!(
                    "rm {}: {}",
                    id,
                    stderr.trim()
                )));
            }
        }
        self.track(&id.0, false);
        debug!("Sandbox {} removed", id);
        Ok(())
    }
}

impl Drop for ContainerCli {
    fn drop(&mut self) {
        let live = match self.live.get_mut() {
            Ok(set) => std::mem::take(set),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        if live.is_empty() {
            return;
        }

        info!("Cleaning up {} leftover sandbox(es)", live.len());
        for id in live {
            match std::process::Command::new(&self.engine)
                .args(["rm", "-f", &id])
                .output()
            {
                Ok(output) if output.status.success() => debug!("Sandbox {} removed", id),
                Ok(output) => warn!(
                    "Failed to remove sandbox {}: {}",
                    id,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => warn!("Failed to remove sandbox {}: {}", id, e),
            }
        }
    }
}
