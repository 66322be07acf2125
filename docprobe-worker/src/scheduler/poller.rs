//! Task poller
//!
//! Claims `analyze_repository` tasks and runs one job per task, up to
//! `max_concurrent_jobs` at a time. While a job runs its task's visibility
//! window is extended so no other worker receives it.
//!
//! A task that runs out of delivery attempts fails its job with kind
//! `attempts_exhausted`, so the job record always reaches a terminal phase.
//! Deliveries interrupted by shutdown are released without using an attempt.

use anyhow::Result;
use docprobe_core::dto::task::{ANALYZE_REPOSITORY_TASK, AnalyzeTaskArgs};
use docprobe_store::{ClaimedTask, TaskQueue};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::orchestrator::{Abandon, JobOrchestrator, OrchestratorError, ProcessOutcome};

/// What the poller did with a delivered task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Nacked,
    /// Requeued without using up an attempt
    Released,
    /// Left claimed; the worker holding the job lease settles it
    Left,
}

/// Task poller that continuously claims and executes analysis jobs
pub struct TaskPoller {
    config: Config,
    queue: Arc<dyn TaskQueue>,
    orchestrator: Arc<JobOrchestrator>,
    semaphore: Arc<Semaphore>,
}

impl TaskPoller {
    /// Creates a new task poller
    pub fn new(
        config: Config,
        queue: Arc<dyn TaskQueue>,
        orchestrator: Arc<JobOrchestrator>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Self {
            config,
            queue,
            orchestrator,
            semaphore,
        }
    }

    /// Starts the polling loop
    ///
    /// Returns once `shutdown` is cancelled and every running job has
    /// stopped.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Starting task poller (interval: {:?}, max concurrent jobs: {})",
            self.config.task_poll_interval, self.config.max_concurrent_jobs
        );

        let mut interval = time::interval(self.config.task_poll_interval);
        let mut running = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    warn!("Job task panicked: {}", e);
                }
            }

            debug!("Polling for analysis tasks");

            match self.claim_batch(&mut running, &shutdown).await {
                Ok(claimed) if claimed > 0 => info!("Started {} job(s) this cycle", claimed),
                Ok(_) => {}
                Err(e) => error!("Error during poll cycle: {:#}", e),
            }
        }

        info!("Waiting for {} running job(s) to stop", running.len());
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                warn!("Job task panicked: {}", e);
            }
        }

        info!("Task poller stopped");
        Ok(())
    }

    /// Claims tasks until the queue is empty or every job slot is taken
    async fn claim_batch(
        &self,
        running: &mut JoinSet<Disposition>,
        shutdown: &CancellationToken,
    ) -> Result<usize> {
        let mut claimed = 0;

        loop {
            // Skip claiming when at max capacity
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                debug!("Max concurrent jobs reached");
                break;
            };

            let Some(task) = self
                .queue
                .claim(&self.config.worker_id, self.config.task_visibility)
                .await?
            else {
                break;
            };

            info!(
                "Claimed task {} ({}, attempt {})",
                task.id, task.name, task.attempt
            );
            running.spawn(Self::handle_task(
                task,
                Arc::clone(&self.queue),
                Arc::clone(&self.orchestrator),
                self.config.task_visibility,
                shutdown.clone(),
                permit,
            ));
            claimed += 1;
        }

        Ok(claimed)
    }

    /// Runs the job behind one task and settles the task
    pub async fn handle_task(
        task: ClaimedTask,
        queue: Arc<dyn TaskQueue>,
        orchestrator: Arc<JobOrchestrator>,
        visibility: Duration,
        shutdown: CancellationToken,
        _permit: OwnedSemaphorePermit,
    ) -> Disposition {
        if task.name != ANALYZE_REPOSITORY_TASK {
            warn!("Unknown task {} ({})", task.name, task.id);
            return Self::nack(queue.as_ref(), task.id, &format!("unknown task {}", task.name))
                .await;
        }

        let args: AnalyzeTaskArgs = match serde_json::from_value(task.args.clone()) {
            Ok(args) => args,
            Err(e) => {
                warn!("Invalid arguments for task {}: {}", task.id, e);
                return Self::nack(queue.as_ref(), task.id, &format!("invalid arguments: {}", e))
                    .await;
            }
        };

        if task.is_exhausted() {
            warn!(
                "Task {} used all {} attempt(s), failing job {}",
                task.id, task.max_attempts, args.job_id
            );
            let reason = format!(
                "no delivery finished within {} attempt(s)",
                task.max_attempts
            );
            return match Self::give_up(&orchestrator, args.job_id, &reason).await {
                Some(Abandon::Failed | Abandon::Settled) => {
                    Self::nack(queue.as_ref(), task.id, "attempts exhausted").await
                }
                // Try again on a later poll, once the lease expires or the store is back
                Some(Abandon::LeaseHeld) | None => Self::release(queue.as_ref(), task.id).await,
            };
        }

        let extender = Self::spawn_visibility_extender(Arc::clone(&queue), task.id, visibility);
        let result = orchestrator.process(args.job_id, shutdown).await;
        extender.abort();

        match result {
            Ok(outcome) if outcome.is_settled() => {
                info!("Job {} settled: {:?}", args.job_id, outcome);
                Self::ack(queue.as_ref(), task.id).await
            }
            Ok(ProcessOutcome::Interrupted) => Self::release(queue.as_ref(), task.id).await,
            Ok(outcome) => {
                info!(
                    "Leaving task {} to the lease holder of job {} ({:?})",
                    task.id, args.job_id, outcome
                );
                Disposition::Left
            }
            Err(OrchestratorError::JobNotFound(id)) => {
                warn!("Job {} no longer exists, dropping task {}", id, task.id);
                Self::ack(queue.as_ref(), task.id).await
            }
            Err(e) => {
                if task.is_final_attempt() {
                    let reason = format!("final attempt {} failed: {}", task.attempt, e);
                    Self::give_up(&orchestrator, args.job_id, &reason).await;
                }
                Self::nack(queue.as_ref(), task.id, &e.to_string()).await
            }
        }
    }

    /// Fails the job of a task that will not be delivered again
    ///
    /// # Returns
    /// `None` if the job store could not be updated
    async fn give_up(orchestrator: &JobOrchestrator, job_id: Uuid, reason: &str) -> Option<Abandon> {
        match orchestrator.abandon(job_id, reason).await {
            Ok(abandon) => {
                debug!("Abandoning job {}: {:?}", job_id, abandon);
                Some(abandon)
            }
            Err(e) => {
                error!("Failed to mark job {} as failed: {}", job_id, e);
                None
            }
        }
    }

    async fn ack(queue: &dyn TaskQueue, task_id: Uuid) -> Disposition {
        if let Err(e) = queue.ack(task_id).await {
            warn!("Failed to ack task {}: {}", task_id, e);
        }
        Disposition::Acked
    }

    async fn nack(queue: &dyn TaskQueue, task_id: Uuid, reason: &str) -> Disposition {
        if let Err(e) = queue.nack(task_id, reason).await {
            warn!("Failed to nack task {}: {}", task_id, e);
        }
        Disposition::Nacked
    }

    async fn release(queue: &dyn TaskQueue, task_id: Uuid) -> Disposition {
        if let Err(e) = queue.release(task_id).await {
            warn!("Failed to release task {}: {}", task_id, e);
        }
        Disposition::Released
    }

    /// Spawns a background task that keeps the claim alive
    fn spawn_visibility_extender(
        queue: Arc<dyn TaskQueue>,
        task_id: Uuid,
        visibility: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval((visibility / 3).max(Duration::from_secs(1)));
            ticker.tick().await;

            loop {
                ticker.tick().await;

                debug!("Extending visibility of task {}", task_id);

                if let Err(e) = queue.extend(task_id, visibility).await {
                    warn!("Failed to extend task {}: {}", task_id, e);
                }
            }
        })
    }
}
