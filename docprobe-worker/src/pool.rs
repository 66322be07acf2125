//! Sandbox pool manager
//!
//! Drains a [`UseCaseQueue`] through at most `pool_size` concurrently running
//! sandboxes. The controller is a single task; each running sandbox gets a
//! watcher task that polls the runtime and sends exactly one exit on a shared
//! channel. Exits that arrive together are reported to the [`ProgressSink`]
//! in a single call.
//!
//! The pool never touches the job store. Everything it learns goes through
//! the sink, which also decides whether the run may continue (lease held,
//! no cancellation requested).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docprobe_core::domain::error::ErrorDetail;
use docprobe_core::domain::execution::{ExecutionSummary, UseCaseOutcome};
use docprobe_core::domain::use_case::UseCaseStatus;
use docprobe_store::StoreError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{PoolConfig, SandboxConfig};
use crate::layout::{self, DESCRIPTOR_FILE};
use crate::queue::{QueueItem, UseCaseQueue};
use crate::sandbox::{self, SandboxError, SandboxId, SandboxRuntime, WatchResult};

#[derive(Debug, Error)]
pub enum PoolError {
    /// The container engine failed for every sandbox; active ones were cleaned up
    #[error(transparent)]
    Runtime(#[from] SandboxError),

    #[error("failed to record progress: {0}")]
    Store(#[from] StoreError),

    /// The job lease was lost to another worker; nothing more was written
    #[error("job lease lost")]
    LeaseLost,

    /// Worker shutdown; in-flight use cases were left as they were
    #[error("execution interrupted by shutdown")]
    Interrupted,
}

/// Answer of a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Continue,
    CancelRequested,
    LeaseLost,
}

/// Receiver of execution progress
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Called right before a sandbox is started for `index`
    async fn use_case_started(&self, index: u32, started_at: DateTime<Utc>)
    -> Result<(), StoreError>;

    /// Called with every outcome collected in one controller wake-up
    async fn use_cases_finished(&self, outcomes: &[UseCaseOutcome]) -> Result<(), StoreError>;

    /// Called periodically while sandboxes are running
    async fn heartbeat(&self) -> Result<Heartbeat, StoreError>;
}

/// One execution run
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: Uuid,
    /// Cloned repository, mounted read-only into every sandbox
    pub repo_path: PathBuf,
    /// Parent of the per-use-case output directories
    pub output_dir: PathBuf,
    pub include_folders: Vec<String>,
    pub pool_size: usize,
}

struct ActiveSandbox {
    item: QueueItem,
    id: SandboxId,
    started_at: DateTime<Utc>,
    output_dir: PathBuf,
    watcher: JoinHandle<()>,
    _permit: Option<OwnedSemaphorePermit>,
}

struct SandboxExit {
    attempt_id: Uuid,
    result: WatchResult,
}

enum Launch {
    Started(ActiveSandbox),
    Failed(UseCaseOutcome),
    Fatal(SandboxError),
}

pub struct PoolManager {
    runtime: Arc<dyn SandboxRuntime>,
    sandbox: SandboxConfig,
    config: PoolConfig,
    global_limit: Option<Arc<Semaphore>>,
}

impl PoolManager {
    /// Creates a pool manager
    ///
    /// # Arguments
    /// * `global_limit` - Semaphore shared with other pools to cap sandboxes
    ///   across jobs
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        sandbox: SandboxConfig,
        config: PoolConfig,
        global_limit: Option<Arc<Semaphore>>,
    ) -> Self {
        Self {
            runtime,
            sandbox,
            config,
            global_limit,
        }
    }

    /// Runs every queued use case to completion
    ///
    /// # Returns
    /// The summary of this run, sorted by index. A run cancelled through the
    /// sink returns normally with the dropped use cases recorded as failed.
    pub async fn run(
        &self,
        request: ExecutionRequest,
        queue: &UseCaseQueue,
        sink: &dyn ProgressSink,
        shutdown: CancellationToken,
    ) -> Result<ExecutionSummary, PoolError> {
        let pool_size = request.pool_size.max(1);
        let mut summary = ExecutionSummary {
            total: queue.remaining_count() as u32,
            ..Default::default()
        };

        info!(
            "Executing {} use case(s) for job {} with pool size {}",
            summary.total, request.job_id, pool_size
        );

        if summary.total == 0 {
            return Ok(summary);
        }

        self.runtime.ping().await?;

        let watchers = shutdown.child_token();
        let (exit_tx, mut exit_rx) = mpsc::channel::<SandboxExit>(pool_size);
        let mut active: HashMap<Uuid, ActiveSandbox> = HashMap::new();

        let mut housekeeping = time::interval(self.config.heartbeat_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        housekeeping.tick().await;

        // Global slot taken while waiting in the select below, used by the next backfill
        let mut reserved: Option<OwnedSemaphorePermit> = None;

        loop {
            // Backfill free slots
            while active.len() < pool_size && !queue.is_empty() {
                let permit = match reserved.take() {
                    Some(permit) => Some(permit),
                    None => match self.try_global_permit() {
                        GlobalPermit::Granted(permit) => permit,
                        GlobalPermit::Busy => break,
                    },
                };
                let Some(item) = queue.dequeue() else { break };

                let started_at = Utc::now();
                if let Err(e) = sink.use_case_started(item.index, started_at).await {
                    self.abandon(&mut active, &watchers).await;
                    return Err(e.into());
                }

                match self
                    .launch(&request, item, started_at, permit, &exit_tx, &watchers)
                    .await
                {
                    Launch::Started(sandbox) => {
                        active.insert(sandbox.item.attempt_id, sandbox);
                    }
                    Launch::Failed(outcome) => {
                        if let Err(e) = sink.use_cases_finished(std::slice::from_ref(&outcome)).await
                        {
                            self.abandon(&mut active, &watchers).await;
                            return Err(e.into());
                        }
                        summary.record(outcome);
                    }
                    Launch::Fatal(e) => {
                        error!("Sandbox runtime failed: {}", e);
                        self.abandon(&mut active, &watchers).await;
                        return Err(PoolError::Runtime(e));
                    }
                }
            }

            if active.is_empty() && queue.is_empty() {
                break;
            }

            let slot_wanted = self.global_limit.is_some()
                && reserved.is_none()
                && active.len() < pool_size
                && !queue.is_empty();

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(
                        "Shutdown requested, abandoning {} running use case(s) of job {}",
                        active.len(),
                        request.job_id
                    );
                    self.abandon(&mut active, &watchers).await;
                    return Err(PoolError::Interrupted);
                }

                _ = housekeeping.tick() => {
                    match sink.heartbeat().await {
                        Ok(Heartbeat::Continue) => {}
                        Ok(Heartbeat::CancelRequested) => {
                            info!("Cancellation requested for job {}", request.job_id);
                            let outcomes = self.cancel_all(&mut active, queue, &watchers).await;
                            sink.use_cases_finished(&outcomes).await?;
                            for outcome in outcomes {
                                summary.record(outcome);
                            }
                            return Ok(summary);
                        }
                        Ok(Heartbeat::LeaseLost) => {
                            warn!("Lost lease on job {}, stopping", request.job_id);
                            self.abandon(&mut active, &watchers).await;
                            return Err(PoolError::LeaseLost);
                        }
                        Err(e) => warn!("Heartbeat failed for job {}: {}", request.job_id, e),
                    }
                }

                Some(exit) = exit_rx.recv(), if !active.is_empty() => {
                    let mut exits = vec![exit];
                    while let Ok(exit) = exit_rx.try_recv() {
                        exits.push(exit);
                    }

                    let mut outcomes = Vec::with_capacity(exits.len());
                    let mut fatal = None;
                    for exit in exits {
                        let Some(sandbox) = active.remove(&exit.attempt_id) else {
                            continue;
                        };
                        match self.reap(sandbox, exit.result).await {
                            Ok(Some(outcome)) => outcomes.push(outcome),
                            Ok(None) => {}
                            Err(e) => fatal = Some(e),
                        }
                    }

                    if !outcomes.is_empty() {
                        debug!("Reporting {} finished use case(s)", outcomes.len());
                        if let Err(e) = sink.use_cases_finished(&outcomes).await {
                            self.abandon(&mut active, &watchers).await;
                            return Err(e.into());
                        }
                        for outcome in outcomes {
                            summary.record(outcome);
                        }
                    }

                    if let Some(e) = fatal {
                        error!("Sandbox runtime failed: {}", e);
                        self.abandon(&mut active, &watchers).await;
                        return Err(PoolError::Runtime(e));
                    }

                    if shutdown.is_cancelled() {
                        self.abandon(&mut active, &watchers).await;
                        return Err(PoolError::Interrupted);
                    }
                }

                permit = self.wait_global_permit(), if slot_wanted => match permit {
                    Some(permit) => reserved = Some(permit),
                    None => {
                        warn!("Global sandbox limit closed, stopping job {}", request.job_id);
                        self.abandon(&mut active, &watchers).await;
                        return Err(PoolError::Interrupted);
                    }
                },
            }
        }

        if !summary.is_complete() {
            warn!(
                "Job {} finished with {} of {} use case(s) unaccounted for",
                request.job_id,
                summary
                    .total
                    .saturating_sub(summary.completed_count + summary.failed_count),
                summary.total
            );
        }
        info!(
            "Job {} executed: {} completed, {} failed",
            request.job_id, summary.completed_count, summary.failed_count
        );
        Ok(summary)
    }

    fn try_global_permit(&self) -> GlobalPermit {
        let Some(limit) = &self.global_limit else {
            return GlobalPermit::Granted(None);
        };
        match Arc::clone(limit).try_acquire_owned() {
            Ok(permit) => GlobalPermit::Granted(Some(permit)),
            Err(_) => GlobalPermit::Busy,
        }
    }

    /// Waits for a global slot; `None` if the semaphore was closed
    async fn wait_global_permit(&self) -> Option<OwnedSemaphorePermit> {
        match &self.global_limit {
            Some(limit) => Arc::clone(limit).acquire_owned().await.ok(),
            None => std::future::pending().await,
        }
    }

    /// Prepares the output directory and starts the sandbox for one item
    async fn launch(
        &self,
        request: &ExecutionRequest,
        item: QueueItem,
        started_at: DateTime<Utc>,
        permit: Option<OwnedSemaphorePermit>,
        exit_tx: &mpsc::Sender<SandboxExit>,
        watchers: &CancellationToken,
    ) -> Launch {
        let output_dir = layout::use_case_dir(&request.output_dir, item.index);

        if let Err(e) = write_descriptor(&output_dir, &item).await {
            warn!(
                "Failed to prepare output for use case {}: {}",
                item.index, e
            );
            return Launch::Failed(start_failure(&item, started_at, "workspace", e.to_string()));
        }

        let spec = self.sandbox.execution_spec(
            request.job_id,
            &item,
            &request.repo_path,
            &output_dir,
            &request.include_folders,
        );

        let id = match self.runtime.start(&spec).await {
            Ok(id) => id,
            Err(e) if e.is_fatal() => return Launch::Fatal(e),
            Err(e) => {
                warn!("Failed to start sandbox for use case {}: {}", item.index, e);
                return Launch::Failed(start_failure(&item, started_at, "start", e.to_string()));
            }
        };

        debug!("Use case {} running in sandbox {}", item.index, id);

        let watcher = {
            let runtime = Arc::clone(&self.runtime);
            let exit_tx = exit_tx.clone();
            let token = watchers.clone();
            let id = id.clone();
            let attempt_id = item.attempt_id;
            let poll_interval = self.config.poll_interval;
            let timeout = self.config.sandbox_timeout;

            tokio::spawn(async move {
                let result =
                    sandbox::watch(runtime.as_ref(), &id, poll_interval, timeout, &token).await;
                let _ = exit_tx.send(SandboxExit { attempt_id, result }).await;
            })
        };

        Launch::Started(ActiveSandbox {
            item,
            id,
            started_at,
            output_dir,
            watcher,
            _permit: permit,
        })
    }

    /// Classifies an exited sandbox and cleans it up
    ///
    /// # Returns
    /// `Ok(None)` if the watcher stopped because of shutdown, and the runtime
    /// error if it is fatal for the whole pool
    async fn reap(
        &self,
        sandbox: ActiveSandbox,
        result: WatchResult,
    ) -> Result<Option<UseCaseOutcome>, SandboxError> {
        let runtime = self.runtime.as_ref();
        let finished_at = Utc::now();

        let (status, exit_code, log, error) = match result {
            WatchResult::Exited(code) => {
                let log = sandbox::teardown(runtime, &sandbox.id, false).await;
                if code == 0 {
                    (UseCaseStatus::Completed, Some(code), log, None)
                } else {
                    let error = ErrorDetail::new(
                        "exit_code",
                        format!("sandbox exited with code {}", code),
                    );
                    (UseCaseStatus::Failed, Some(code), log, Some(error))
                }
            }
            WatchResult::TimedOut => {
                warn!(
                    "Use case {} timed out after {:?}, killing sandbox {}",
                    sandbox.item.index, self.config.sandbox_timeout, sandbox.id
                );
                let log = sandbox::teardown(runtime, &sandbox.id, true).await;
                let error = ErrorDetail::new(
                    "timeout",
                    format!(
                        "use case exceeded {} seconds",
                        self.config.sandbox_timeout.as_secs()
                    ),
                );
                (UseCaseStatus::Failed, None, log, Some(error))
            }
            WatchResult::Cancelled => {
                sandbox::teardown(runtime, &sandbox.id, true).await;
                return Ok(None);
            }
            WatchResult::Failed(e) if e.is_fatal() => {
                sandbox::teardown(runtime, &sandbox.id, true).await;
                return Err(e);
            }
            WatchResult::Failed(e) => {
                let log = sandbox::teardown(runtime, &sandbox.id, true).await;
                let error = ErrorDetail::new("sandbox", e.to_string());
                (UseCaseStatus::Failed, None, log, Some(error))
            }
        };

        let result = read_results(&sandbox.output_dir, sandbox.item.index).await;

        info!(
            "Use case {} ({}) {}",
            sandbox.item.index, sandbox.item.use_case.name, status
        );

        Ok(Some(UseCaseOutcome {
            index: sandbox.item.index,
            name: sandbox.item.use_case.name,
            status,
            exit_code,
            started_at: Some(sandbox.started_at),
            finished_at,
            log,
            result,
            error,
        }))
    }

    /// Kills every running sandbox and drops the backlog, all as failed
    async fn cancel_all(
        &self,
        active: &mut HashMap<Uuid, ActiveSandbox>,
        queue: &UseCaseQueue,
        watchers: &CancellationToken,
    ) -> Vec<UseCaseOutcome> {
        watchers.cancel();
        let mut outcomes = Vec::new();

        for (_, sandbox) in active.drain() {
            sandbox.watcher.abort();
            let log = sandbox::teardown(self.runtime.as_ref(), &sandbox.id, true).await;
            outcomes.push(UseCaseOutcome {
                index: sandbox.item.index,
                name: sandbox.item.use_case.name,
                status: UseCaseStatus::Failed,
                exit_code: None,
                started_at: Some(sandbox.started_at),
                finished_at: Utc::now(),
                log,
                result: None,
                error: Some(cancelled_error()),
            });
        }

        for item in queue.drain() {
            outcomes.push(UseCaseOutcome {
                index: item.index,
                name: item.use_case.name,
                status: UseCaseStatus::Failed,
                exit_code: None,
                started_at: None,
                finished_at: Utc::now(),
                log: None,
                result: None,
                error: Some(cancelled_error()),
            });
        }

        outcomes
    }

    /// Best-effort teardown of every running sandbox without reporting
    async fn abandon(&self, active: &mut HashMap<Uuid, ActiveSandbox>, watchers: &CancellationToken) {
        watchers.cancel();
        for (_, sandbox) in active.drain() {
            sandbox.watcher.abort();
            sandbox::teardown(self.runtime.as_ref(), &sandbox.id, true).await;
        }
    }
}

enum GlobalPermit {
    Granted(Option<OwnedSemaphorePermit>),
    Busy,
}

fn cancelled_error() -> ErrorDetail {
    ErrorDetail::new("cancelled", "job cancelled by request")
}

fn start_failure(
    item: &QueueItem,
    started_at: DateTime<Utc>,
    kind: &str,
    message: String,
) -> UseCaseOutcome {
    UseCaseOutcome {
        index: item.index,
        name: item.use_case.name.clone(),
        status: UseCaseStatus::Failed,
        exit_code: None,
        started_at: Some(started_at),
        finished_at: Utc::now(),
        log: None,
        result: None,
        error: Some(ErrorDetail::new(kind, message)),
    }
}

/// Writes the use case descriptor the execution agent reads
async fn write_descriptor(output_dir: &Path, item: &QueueItem) -> std::io::Result<()> {
    tokio::fs::create_dir_all(output_dir).await?;
    let body = serde_json::to_vec_pretty(&serde_json::json!({
        "index": item.index,
        "name": item.use_case.name,
        "description": item.use_case.description,
        "success_criteria": item.use_case.success_criteria,
        "difficulty_level": item.use_case.difficulty.to_string(),
        "documentation_source": item.use_case.documentation_source,
    }))?;
    tokio::fs::write(output_dir.join(DESCRIPTOR_FILE), body).await
}

/// Reads the optional results document of a use case
async fn read_results(output_dir: &Path, index: u32) -> Option<serde_json::Value> {
    let path = output_dir.join(layout::results_file_name(index));
    let contents = tokio::fs::read(&path).await.ok()?;
    match serde_json::from_slice(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Ignoring unparseable results at {}: {}", path.display(), e);
            None
        }
    }
}
