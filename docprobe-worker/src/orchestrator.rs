//! Job orchestrator
//!
//! Drives one job through clone -> extract -> execute -> finalize while
//! holding the job lease. It is the only writer of the job record: the pool
//! reports through [`JobProgress`], which turns every report into a single
//! read-modify-write.
//!
//! Every step starts from the persisted phase, so processing the same job
//! again after a crash or a redelivery resumes instead of duplicating work:
//! - terminal phases are left untouched
//! - `pending`, `cloning`, `extracting` discard partial directories and rerun
//! - `executing` fails the use cases that were running and requeues the rest

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docprobe_core::domain::error::ErrorDetail;
use docprobe_core::domain::execution::UseCaseOutcome;
use docprobe_core::domain::job::{Job, JobPhase};
use docprobe_core::domain::report::QualityReport;
use docprobe_core::domain::use_case::UseCaseStatus;
use docprobe_store::{JobStore, StoreError};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::extraction::{self, ExtractionError};
use crate::git::{self, CloneError};
use crate::layout::JobLayout;
use crate::pool::{ExecutionRequest, Heartbeat, PoolError, PoolManager, ProgressSink};
use crate::queue::UseCaseQueue;
use crate::sandbox::{SandboxError, SandboxRuntime};

pub const NO_USE_CASES_MESSAGE: &str = "No use cases found in documentation";

/// Error kind of a job whose task ran out of delivery attempts
pub const ATTEMPTS_EXHAUSTED: &str = "attempts_exhausted";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("workspace error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Category recorded in the job's error detail
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::JobNotFound(_) => "not_found",
            OrchestratorError::Store(_) => "store",
            OrchestratorError::Sandbox(_) => "runtime",
            OrchestratorError::Io(_) => "workspace",
        }
    }
}

/// What happened to a job delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The job reached a terminal phase during this delivery
    Finished(JobPhase),
    /// The job was already terminal; nothing was done
    AlreadyTerminal(JobPhase),
    /// Another worker holds the lease
    LeaseHeld,
    /// The lease expired and was taken over while processing
    LeaseLost,
    /// Worker shutdown; the job is left in a resumable phase
    Interrupted,
}

impl ProcessOutcome {
    /// Whether the task that delivered the job is done with
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ProcessOutcome::Finished(_) | ProcessOutcome::AlreadyTerminal(_)
        )
    }
}

/// Result of [`JobOrchestrator::abandon`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abandon {
    /// The job was failed by this call
    Failed,
    /// Already terminal or gone; nothing to do
    Settled,
    /// Another worker holds the lease and may still settle the job
    LeaseHeld,
}

/// Why a guarded phase stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Shutdown,
    CancelRequested,
    LeaseLost,
}

enum Step<T> {
    Continue(T),
    Stop(ProcessOutcome),
}

pub struct JobOrchestrator {
    config: Config,
    store: JobStore,
    runtime: Arc<dyn SandboxRuntime>,
    pool: PoolManager,
}

impl JobOrchestrator {
    pub fn new(config: Config, store: JobStore, runtime: Arc<dyn SandboxRuntime>) -> Self {
        let global_limit = config
            .pool
            .global_sandbox_limit
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let pool = PoolManager::new(
            Arc::clone(&runtime),
            config.sandbox.clone(),
            config.pool.clone(),
            global_limit,
        );

        Self {
            config,
            store,
            runtime,
            pool,
        }
    }

    /// Processes one delivery of a job
    ///
    /// # Arguments
    /// * `shutdown` - Cancelled when the worker stops; the job is then left
    ///   non-terminal so a later delivery resumes it
    ///
    /// # Returns
    /// The delivery outcome, or the error the job was failed with
    pub async fn process(
        &self,
        job_id: Uuid,
        shutdown: CancellationToken,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        let owner = self.config.worker_id.as_str();
        if !self
            .store
            .acquire_lease(job_id, owner, self.config.lease_ttl)
            .await?
        {
            info!("Job {} is leased by another worker, skipping", job_id);
            return Ok(ProcessOutcome::LeaseHeld);
        }

        let result = self.process_leased(job_id, &shutdown).await;

        if !matches!(result, Ok(ProcessOutcome::LeaseLost)) {
            if let Err(e) = self.store.release_lease(job_id, owner).await {
                warn!("Failed to release lease on job {}: {}", job_id, e);
            }
        }

        result
    }

    async fn process_leased(
        &self,
        job_id: Uuid,
        shutdown: &CancellationToken,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;

        if job.phase.is_terminal() {
            info!("Job {} already {}, nothing to do", job_id, job.phase);
            return Ok(ProcessOutcome::AlreadyTerminal(job.phase));
        }

        info!(
            "Processing job {} ({}@{}) from phase {}",
            job_id, job.params.repository_url, job.params.branch, job.phase
        );

        let layout = JobLayout::new(&self.config.data_root, job_id);
        match self.drive(job, &layout, shutdown).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!("Job {} failed: {}", job_id, e);
                let detail = ErrorDetail::new(e.kind(), e.to_string());
                if let Err(store_err) = self
                    .store
                    .update(job_id, |job| job.fail(JobPhase::Failed, detail))
                    .await
                {
                    warn!("Failed to record failure of job {}: {}", job_id, store_err);
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        job: Job,
        layout: &JobLayout,
        shutdown: &CancellationToken,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        let job_id = job.id;

        if self.store.cancel_requested(job_id).await? {
            return self.finish_cancelled(job_id).await;
        }

        let phase = job.phase;
        if phase == JobPhase::NoUseCases {
            return self.finish_without_use_cases(job_id).await;
        }

        let before_execution = phase.rank() <= JobPhase::Extracting.rank();
        if matches!(phase, JobPhase::Pending | JobPhase::Cloning) || !layout.has_repository() {
            if let Step::Stop(outcome) = self
                .clone_phase(&job, layout, shutdown, before_execution)
                .await?
            {
                return Ok(outcome);
            }
        }

        if before_execution {
            match self.extract_phase(&job, layout, shutdown).await? {
                Step::Continue(true) => {}
                Step::Continue(false) => return self.finish_without_use_cases(job_id).await,
                Step::Stop(outcome) => return Ok(outcome),
            }
        }

        self.execute_phase(job_id, layout, shutdown).await
    }

    // =========================================================================
    // Phases
    // =========================================================================

    async fn clone_phase(
        &self,
        job: &Job,
        layout: &JobLayout,
        shutdown: &CancellationToken,
        announce: bool,
    ) -> Result<Step<()>, OrchestratorError> {
        if announce {
            self.store
                .update(job.id, |j| j.set_phase(JobPhase::Cloning))
                .await?;
        }

        layout.reset_repository().await?;
        let repo_dir = layout.repo_dir();
        let timeout = self.config.clone_timeout;

        let result = self
            .guarded(job.id, shutdown, |token| {
                git::clone_repository(
                    &job.params.repository_url,
                    &job.params.branch,
                    &repo_dir,
                    timeout,
                    token,
                )
            })
            .await?;

        match result {
            Err(reason) => Ok(Step::Stop(self.interrupted(job.id, reason).await?)),
            Ok(Ok(())) => Ok(Step::Continue(())),
            Ok(Err(CloneError::Cancelled)) => Ok(Step::Stop(ProcessOutcome::Interrupted)),
            Ok(Err(e)) => {
                warn!("Clone of job {} failed: {}", job.id, e);
                let detail = ErrorDetail::new("clone", e.to_string());
                self.store
                    .update(job.id, |j| j.fail(JobPhase::Failed, detail))
                    .await?;
                Ok(Step::Stop(ProcessOutcome::Finished(JobPhase::Failed)))
            }
        }
    }

    /// # Returns
    /// `Continue(true)` once use cases were recorded, `Continue(false)` if
    /// there are none
    async fn extract_phase(
        &self,
        job: &Job,
        layout: &JobLayout,
        shutdown: &CancellationToken,
    ) -> Result<Step<bool>, OrchestratorError> {
        self.store
            .update(job.id, |j| j.set_phase(JobPhase::Extracting))
            .await?;
        layout.reset_data().await?;

        let repo_dir = layout.repo_dir();
        let include_folders = &job.params.include_folders;

        let doc_files = extraction::find_doc_files(&repo_dir, include_folders);
        let use_cases = if doc_files.is_empty() {
            info!("No documentation files found for job {}", job.id);
            Vec::new()
        } else {
            info!(
                "Found {} documentation file(s) for job {}",
                doc_files.len(),
                job.id
            );
            let spec = self.config.sandbox.extraction_spec(
                job.id,
                &repo_dir,
                &layout.data_dir(),
                include_folders,
            );
            let runtime = Arc::clone(&self.runtime);
            let poll_interval = self.config.pool.poll_interval;
            let timeout = self.config.extraction_timeout;

            let result = self
                .guarded(job.id, shutdown, |token| async move {
                    extraction::run_extraction(runtime.as_ref(), &spec, poll_interval, timeout, token)
                        .await
                })
                .await?;

            let failure = match result {
                Err(reason) => return Ok(Step::Stop(self.interrupted(job.id, reason).await?)),
                Ok(Err(ExtractionError::Cancelled)) => {
                    return Ok(Step::Stop(ProcessOutcome::Interrupted));
                }
                Ok(Err(ExtractionError::Sandbox(e))) if e.is_fatal() => return Err(e.into()),
                Ok(Err(e)) => Some(e),
                Ok(Ok(_)) => None,
            };

            let parsed = match failure {
                Some(e) => Err(e),
                None => extraction::read_use_cases(&layout.use_cases_file()).await,
            };

            match parsed {
                Ok(use_cases) => use_cases,
                Err(e) => {
                    warn!("Extraction of job {} failed: {}", job.id, e);
                    let detail = ErrorDetail::new("extraction", e.to_string());
                    self.store
                        .update(job.id, |j| j.fail(JobPhase::ExtractionFailed, detail))
                        .await?;
                    return Ok(Step::Stop(ProcessOutcome::Finished(
                        JobPhase::ExtractionFailed,
                    )));
                }
            }
        };

        if use_cases.is_empty() {
            self.store
                .update(job.id, |j| j.set_phase(JobPhase::NoUseCases))
                .await?;
            return Ok(Step::Continue(false));
        }

        info!("Extracted {} use case(s) for job {}", use_cases.len(), job.id);
        self.store
            .update(job.id, |j| {
                j.populate_use_cases(use_cases);
                j.set_phase(JobPhase::Queued);
            })
            .await?;

        Ok(Step::Continue(true))
    }

    async fn execute_phase(
        &self,
        job_id: Uuid,
        layout: &JobLayout,
        shutdown: &CancellationToken,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        let now = Utc::now();
        let job = self
            .store
            .update(job_id, |j| {
                for index in j.running_indexes() {
                    let outcome = interrupted_outcome(j, index, now);
                    if let Err(e) = j.apply_outcome(&outcome) {
                        warn!("Cannot fail interrupted use case {}: {}", index, e);
                    }
                }
                j.set_phase(JobPhase::Executing);
            })
            .await?;

        let queue = UseCaseQueue::new();
        queue.enqueue(
            job.pending_indexes()
                .into_iter()
                .filter_map(|index| {
                    job.use_cases
                        .get(&index)
                        .map(|record| (index, record.use_case.clone()))
                }),
        );

        layout.ensure_data().await?;
        let request = ExecutionRequest {
            job_id,
            repo_path: layout.repo_dir(),
            output_dir: layout.data_dir(),
            include_folders: job.params.include_folders.clone(),
            pool_size: self.config.pool.pool_size,
        };
        let progress = JobProgress::new(
            self.store.clone(),
            job_id,
            self.config.worker_id.clone(),
            self.config.lease_ttl,
        );

        match self
            .pool
            .run(request, &queue, &progress, shutdown.clone())
            .await
        {
            Ok(_) if progress.cancel_seen() => self.finish_cancelled(job_id).await,
            Ok(_) => self.finalize(job_id, layout).await,
            Err(PoolError::Interrupted) => Ok(ProcessOutcome::Interrupted),
            Err(PoolError::LeaseLost) => Ok(ProcessOutcome::LeaseLost),
            Err(PoolError::Runtime(e)) => Err(e.into()),
            Err(PoolError::Store(e)) => Err(e.into()),
        }
    }

    // =========================================================================
    // Terminal transitions
    // =========================================================================

    async fn finalize(
        &self,
        job_id: Uuid,
        layout: &JobLayout,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        let job = self
            .store
            .update(job_id, |j| {
                j.recount();
                j.report = Some(QualityReport::generate(j.use_cases.values()));
                let phase = if j.counts.failed > 0 {
                    JobPhase::CompletedWithErrors
                } else {
                    JobPhase::Completed
                };
                j.set_phase(phase);
            })
            .await?;

        if let Some(report) = &job.report {
            match serde_json::to_vec_pretty(report) {
                Ok(body) => {
                    if let Err(e) = tokio::fs::write(layout.report_file(), body).await {
                        warn!("Failed to write report for job {}: {}", job_id, e);
                    }
                }
                Err(e) => warn!("Failed to serialize report for job {}: {}", job_id, e),
            }
        }

        info!(
            "Job {} {}: {} completed, {} failed",
            job_id, job.phase, job.counts.completed, job.counts.failed
        );
        Ok(ProcessOutcome::Finished(job.phase))
    }

    async fn finish_without_use_cases(
        &self,
        job_id: Uuid,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        self.store
            .update(job_id, |j| {
                j.message = Some(NO_USE_CASES_MESSAGE.to_string());
                j.set_phase(JobPhase::Completed);
            })
            .await?;

        info!("Job {} completed: {}", job_id, NO_USE_CASES_MESSAGE);
        Ok(ProcessOutcome::Finished(JobPhase::Completed))
    }

    async fn finish_cancelled(&self, job_id: Uuid) -> Result<ProcessOutcome, OrchestratorError> {
        let now = Utc::now();
        self.store
            .update(job_id, |j| {
                let open: Vec<u32> = j
                    .use_cases
                    .values()
                    .filter(|r| !r.status.is_terminal())
                    .map(|r| r.index)
                    .collect();
                for index in open {
                    let mut outcome = interrupted_outcome(j, index, now);
                    outcome.error = Some(ErrorDetail::new("cancelled", "job cancelled by request"));
                    if let Err(e) = j.apply_outcome(&outcome) {
                        warn!("Cannot cancel use case {}: {}", index, e);
                    }
                }
                j.message = Some("Cancelled by request".to_string());
                j.set_phase(JobPhase::Cancelled);
            })
            .await?;

        if let Err(e) = self.store.clear_cancel(job_id).await {
            warn!("Failed to clear cancel flag of job {}: {}", job_id, e);
        }

        info!("Job {} cancelled", job_id);
        Ok(ProcessOutcome::Finished(JobPhase::Cancelled))
    }

    /// Fails a job whose task ran out of delivery attempts
    ///
    /// Open use cases are failed along with it. A terminal job, a missing
    /// job or one leased by another worker is left alone.
    pub async fn abandon(&self, job_id: Uuid, reason: &str) -> Result<Abandon, OrchestratorError> {
        let owner = self.config.worker_id.as_str();
        if !self
            .store
            .acquire_lease(job_id, owner, self.config.lease_ttl)
            .await?
        {
            warn!("Job {} is leased by another worker, not abandoning it", job_id);
            return Ok(Abandon::LeaseHeld);
        }

        let result = self.abandon_leased(job_id, reason).await;

        if let Err(e) = self.store.release_lease(job_id, owner).await {
            warn!("Failed to release lease on job {}: {}", job_id, e);
        }
        result
    }

    async fn abandon_leased(&self, job_id: Uuid, reason: &str) -> Result<Abandon, OrchestratorError> {
        match self.store.get(job_id).await? {
            Some(job) if !job.phase.is_terminal() => {}
            _ => return Ok(Abandon::Settled),
        }

        let now = Utc::now();
        let detail = ErrorDetail::new(ATTEMPTS_EXHAUSTED, reason);
        self.store
            .update(job_id, |j| {
                let open: Vec<u32> = j
                    .use_cases
                    .values()
                    .filter(|r| !r.status.is_terminal())
                    .map(|r| r.index)
                    .collect();
                for index in open {
                    let mut outcome = interrupted_outcome(j, index, now);
                    outcome.error = Some(detail.clone());
                    if let Err(e) = j.apply_outcome(&outcome) {
                        warn!("Cannot fail use case {}: {}", index, e);
                    }
                }
                j.fail(JobPhase::Failed, detail.clone());
            })
            .await?;

        error!("Job {} failed: {}", job_id, reason);
        Ok(Abandon::Failed)
    }

    async fn interrupted(
        &self,
        job_id: Uuid,
        reason: Interruption,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        match reason {
            Interruption::Shutdown => {
                info!("Job {} interrupted by shutdown", job_id);
                Ok(ProcessOutcome::Interrupted)
            }
            Interruption::LeaseLost => {
                warn!("Lost lease on job {}", job_id);
                Ok(ProcessOutcome::LeaseLost)
            }
            Interruption::CancelRequested => self.finish_cancelled(job_id).await,
        }
    }

    // =========================================================================
    // Lease keeping
    // =========================================================================

    /// Runs `work` while renewing the lease and watching the cancel flag
    ///
    /// The token handed to `work` is cancelled on shutdown, on a cancel
    /// request or when the lease is lost; `work` is then awaited to let it
    /// clean up.
    ///
    /// # Returns
    /// `Err(reason)` if `work` was interrupted, else its output
    async fn guarded<W, F, T>(
        &self,
        job_id: Uuid,
        shutdown: &CancellationToken,
        work: W,
    ) -> Result<Result<T, Interruption>, OrchestratorError>
    where
        W: FnOnce(CancellationToken) -> F,
        F: Future<Output = T>,
    {
        let token = shutdown.child_token();
        let fut = work(token.clone());
        tokio::pin!(fut);

        let mut ticker = time::interval(self.config.pool.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let beat = JobProgress::new(
            self.store.clone(),
            job_id,
            self.config.worker_id.clone(),
            self.config.lease_ttl,
        );
        let mut stop: Option<Interruption> = None;

        loop {
            tokio::select! {
                output = &mut fut => {
                    if let Some(reason) = stop {
                        return Ok(Err(reason));
                    }
                    if shutdown.is_cancelled() {
                        return Ok(Err(Interruption::Shutdown));
                    }
                    return Ok(Ok(output));
                }
                _ = ticker.tick(), if stop.is_none() => {
                    match beat.heartbeat().await {
                        Ok(Heartbeat::Continue) => {}
                        Ok(Heartbeat::CancelRequested) => {
                            stop = Some(Interruption::CancelRequested);
                            token.cancel();
                        }
                        Ok(Heartbeat::LeaseLost) => {
                            stop = Some(Interruption::LeaseLost);
                            token.cancel();
                        }
                        Err(e) => warn!("Heartbeat failed for job {}: {}", job_id, e),
                    }
                }
            }
        }
    }
}

/// Failure outcome for a use case that never reported back
fn interrupted_outcome(job: &Job, index: u32, now: DateTime<Utc>) -> UseCaseOutcome {
    let record = job.use_cases.get(&index);
    UseCaseOutcome {
        index,
        name: record.map(|r| r.use_case.name.clone()).unwrap_or_default(),
        status: UseCaseStatus::Failed,
        exit_code: None,
        started_at: record.and_then(|r| r.started_at),
        finished_at: now,
        log: record.and_then(|r| r.log.clone()),
        result: None,
        error: Some(ErrorDetail::new(
            "interrupted",
            "worker stopped before the use case finished",
        )),
    }
}

// =============================================================================
// Progress sink
// =============================================================================

/// Persists pool progress into the job record
pub struct JobProgress {
    store: JobStore,
    job_id: Uuid,
    owner: String,
    lease_ttl: std::time::Duration,
    cancel_seen: AtomicBool,
}

impl JobProgress {
    pub fn new(store: JobStore, job_id: Uuid, owner: String, lease_ttl: std::time::Duration) -> Self {
        Self {
            store,
            job_id,
            owner,
            lease_ttl,
            cancel_seen: AtomicBool::new(false),
        }
    }

    /// Whether a heartbeat observed a cancellation request
    pub fn cancel_seen(&self) -> bool {
        self.cancel_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProgressSink for JobProgress {
    async fn use_case_started(
        &self,
        index: u32,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store
            .update(self.job_id, |j| {
                if let Err(e) = j.mark_running(index, started_at) {
                    warn!("Ignoring start of use case {}: {}", index, e);
                }
            })
            .await?;
        Ok(())
    }

    async fn use_cases_finished(&self, outcomes: &[UseCaseOutcome]) -> Result<(), StoreError> {
        if outcomes.is_empty() {
            return Ok(());
        }

        self.store
            .update(self.job_id, |j| {
                for outcome in outcomes {
                    if let Err(e) = j.apply_outcome(outcome) {
                        warn!("Ignoring outcome of use case {}: {}", outcome.index, e);
                    }
                }
            })
            .await?;
        Ok(())
    }

    async fn heartbeat(&self) -> Result<Heartbeat, StoreError> {
        if !self
            .store
            .renew_lease(self.job_id, &self.owner, self.lease_ttl)
            .await?
        {
            return Ok(Heartbeat::LeaseLost);
        }

        if self.store.cancel_requested(self.job_id).await? {
            self.cancel_seen.store(true, Ordering::SeqCst);
            return Ok(Heartbeat::CancelRequested);
        }

        Ok(Heartbeat::Continue)
    }
}
