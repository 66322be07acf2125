mod common;

use chrono::Utc;
use common::{
    CheckedStore, FakeRuntime, Script, checked_store, origin_repo, submit_job, test_config,
    use_cases_json,
};
use docprobe_core::domain::job::JobPhase;
use docprobe_core::domain::use_case::{Difficulty, UseCase, UseCaseStatus};
use docprobe_store::JobStore;
use docprobe_worker::config::Config;
use docprobe_worker::layout::JobLayout;
use docprobe_worker::orchestrator::{
    ATTEMPTS_EXHAUSTED, Abandon, JobOrchestrator, NO_USE_CASES_MESSAGE, OrchestratorError,
    ProcessOutcome,
};
use docprobe_worker::sandbox::SandboxRuntime;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    data: TempDir,
    origin: TempDir,
    store: JobStore,
    checked: Arc<CheckedStore>,
    runtime: Arc<FakeRuntime>,
    config: Config,
}

impl Harness {
    fn new(runtime: FakeRuntime, with_docs: bool) -> Self {
        let data = tempfile::tempdir().unwrap();
        let config = test_config(data.path());
        let (store, checked) = checked_store();
        Self {
            origin: origin_repo(with_docs),
            data,
            store,
            checked,
            runtime: Arc::new(runtime),
            config,
        }
    }

    /// Every job write kept counters in line and statuses moving forward
    fn assert_writes_consistent(&self) {
        let violations = self.checked.violations();
        assert!(violations.is_empty(), "{:#?}", violations);
    }

    fn orchestrator(&self) -> JobOrchestrator {
        JobOrchestrator::new(
            self.config.clone(),
            self.store.clone(),
            Arc::clone(&self.runtime) as Arc<dyn SandboxRuntime>,
        )
    }

    async fn submit(&self, branch: &str) -> uuid::Uuid {
        submit_job(&self.store, self.origin.path(), branch).await
    }
}

#[tokio::test]
async fn test_full_run_with_seven_use_cases() {
    let h = Harness::new(
        FakeRuntime::new()
            .with_use_cases(use_cases_json(7))
            .with_execution(|i| Script::ok(20 + 5 * i as u64)),
        true,
    );
    let job_id = h.submit("main").await;

    let outcome = h
        .orchestrator()
        .process(job_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Finished(JobPhase::Completed));

    let job = h.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.phase, JobPhase::Completed);
    assert_eq!(job.counts.total, 7);
    assert_eq!(job.counts.completed, 7);
    assert_eq!(job.counts.failed, 0);
    assert!(job.counts.is_consistent());
    assert!(job.use_cases.values().all(|r| {
        r.status == UseCaseStatus::Completed && r.duration_seconds.is_some() && r.result.is_some()
    }));
    // Phases, extraction, seven starts and at least one finished batch
    assert!(h.checked.job_writes() >= 11);
    h.assert_writes_consistent();

    let report = job.report.expect("report");
    assert_eq!(report.total_use_cases, 7);
    assert_eq!(report.successful_executions, 7);
    assert_eq!(report.success_rate, 1.0);

    assert_eq!(h.runtime.extractions(), 1);
    assert_eq!(h.runtime.executions(), 7);
    assert!(h.runtime.max_live() <= 5);
    assert_eq!(h.runtime.live(), 0);

    let layout = JobLayout::new(h.data.path(), job_id);
    assert!(layout.report_file().exists());
    assert!(layout.data_dir().join("use_case_7/use_case.json").exists());

    // The lease is released once the job is settled
    assert!(
        h.store
            .acquire_lease(job_id, "someone-else", Duration::from_secs(5))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_failed_use_cases_complete_with_errors() {
    let h = Harness::new(
        FakeRuntime::new()
            .with_use_cases(use_cases_json(3))
            .with_execution(|i| if i == 2 { Script::fail(1, 10) } else { Script::ok(10) }),
        true,
    );
    let job_id = h.submit("main").await;

    let outcome = h
        .orchestrator()
        .process(job_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Finished(JobPhase::CompletedWithErrors));

    let job = h.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.counts.completed, 2);
    assert_eq!(job.counts.failed, 1);
    assert_eq!(job.use_cases[&2].exit_code, Some(1));
    let report = job.report.unwrap();
    assert_eq!(report.failed_executions, 1);
    h.assert_writes_consistent();
    assert!(!report.issues.is_empty());
}

#[tokio::test]
async fn test_empty_extraction_completes_without_execution() {
    let h = Harness::new(FakeRuntime::new().with_use_cases("[]"), true);
    let job_id = h.submit("main").await;

    let outcome = h
        .orchestrator()
        .process(job_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Finished(JobPhase::Completed));

    let job = h.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.message.as_deref(), Some(NO_USE_CASES_MESSAGE));
    assert_eq!(job.counts.total, 0);
    assert_eq!(h.runtime.extractions(), 1);
    assert_eq!(h.runtime.executions(), 0);
}

#[tokio::test]
async fn test_missing_extraction_output_means_no_use_cases() {
    let h = Harness::new(FakeRuntime::new(), true);
    let job_id = h.submit("main").await;

    let outcome = h
        .orchestrator()
        .process(job_id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ProcessOutcome::Finished(JobPhase::Completed));
    let job = h.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.message.as_deref(), Some(NO_USE_CASES_MESSAGE));
}

#[tokio::test]
async fn test_no_documentation_skips_extraction() {
    let h = Harness::new(FakeRuntime::new().with_use_cases(use_cases_json(2)), false);
    let job_id = h.submit("main").await;

    let outcome = h
        .orchestrator()
        .process(job_id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ProcessOutcome::Finished(JobPhase::Completed));
    assert_eq!(h.runtime.extractions(), 0);
    assert_eq!(h.runtime.executions(), 0);
}

#[tokio::test]
async fn test_unknown_branch_fails_job() {
    let h = Harness::new(FakeRuntime::new().with_use_cases(use_cases_json(2)), true);
    let job_id = h.submit("does-not-exist").await;

    let outcome = h
        .orchestrator()
        .process(job_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Finished(JobPhase::Failed));

    let job = h.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.error.unwrap().kind, "clone");
    assert_eq!(h.runtime.extractions(), 0);
}

#[tokio::test]
async fn test_extraction_exit_code_fails_extraction() {
    let h = Harness::new(
        FakeRuntime::new()
            .with_use_cases(use_cases_json(2))
            .with_extraction(Script::fail(3, 10)),
        true,
    );
    let job_id = h.submit("main").await;

    let outcome = h
        .orchestrator()
        .process(job_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Finished(JobPhase::ExtractionFailed));

    let job = h.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.error.unwrap().kind, "extraction");
    assert_eq!(h.runtime.executions(), 0);
}

#[tokio::test]
async fn test_corrupt_extraction_output_fails_extraction() {
    let h = Harness::new(FakeRuntime::new().with_use_cases("{not json"), true);
    let job_id = h.submit("main").await;

    let outcome = h
        .orchestrator()
        .process(job_id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ProcessOutcome::Finished(JobPhase::ExtractionFailed));
}

#[tokio::test]
async fn test_unavailable_runtime_fails_job() {
    let h = Harness::new(FakeRuntime::new().with_use_cases(use_cases_json(2)), true);
    h.runtime.set_unavailable(true);
    let job_id = h.submit("main").await;

    let err = h
        .orchestrator()
        .process(job_id, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Sandbox(_)));

    let job = h.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.phase, JobPhase::Failed);
    assert_eq!(job.error.unwrap().kind, "runtime");
}

#[tokio::test]
async fn test_redelivery_of_finished_job_is_noop() {
    let h = Harness::new(FakeRuntime::new().with_use_cases(use_cases_json(2)), true);
    let job_id = h.submit("main").await;
    let orchestrator = h.orchestrator();

    orchestrator
        .process(job_id, CancellationToken::new())
        .await
        .unwrap();
    let before = h.store.get(job_id).await.unwrap().unwrap();

    let outcome = orchestrator
        .process(job_id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ProcessOutcome::AlreadyTerminal(JobPhase::Completed));
    assert_eq!(h.runtime.extractions(), 1);
    assert_eq!(h.runtime.executions(), 2);
    let after = h.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(after.updated_at, before.updated_at);
}

#[tokio::test]
async fn test_resume_after_crash_during_execution() {
    let h = Harness::new(FakeRuntime::new(), true);
    let job_id = h.submit("main").await;

    let use_case = |i: u32| UseCase {
        name: format!("Use case {}", i + 1),
        description: "step".to_string(),
        success_criteria: vec!["ok".to_string()],
        difficulty: Difficulty::Intermediate,
        documentation_source: vec!["docs/getting-started.md".to_string()],
    };
    h.store
        .update(job_id, |job| {
            job.populate_use_cases((0..3).map(use_case).collect());
            job.mark_running(0, Utc::now()).unwrap();
            job.set_phase(JobPhase::Executing);
        })
        .await
        .unwrap();

    let outcome = h
        .orchestrator()
        .process(job_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Finished(JobPhase::CompletedWithErrors));

    let job = h.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.use_cases[&0].status, UseCaseStatus::Failed);
    assert_eq!(job.use_cases[&0].error.as_ref().unwrap().kind, "interrupted");
    assert_eq!(job.use_cases[&1].status, UseCaseStatus::Completed);
    assert_eq!(job.use_cases[&2].status, UseCaseStatus::Completed);
    assert!(job.counts.is_consistent());

    // Only the pending use cases ran again, and extraction was not repeated
    assert_eq!(h.runtime.extractions(), 0);
    assert_eq!(h.runtime.executions(), 2);
    h.assert_writes_consistent();
}

#[tokio::test]
async fn test_cancel_before_start() {
    let h = Harness::new(FakeRuntime::new().with_use_cases(use_cases_json(2)), true);
    let job_id = h.submit("main").await;
    h.store.request_cancel(job_id).await.unwrap();

    let outcome = h
        .orchestrator()
        .process(job_id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ProcessOutcome::Finished(JobPhase::Cancelled));
    assert_eq!(h.runtime.extractions(), 0);
    assert!(!h.store.cancel_requested(job_id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_during_execution() {
    let h = Harness::new(
        FakeRuntime::new()
            .with_use_cases(use_cases_json(4))
            .with_execution(|_| Script::Hang),
        true,
    );
    let job_id = h.submit("main").await;

    let store = h.store.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let job = store.get(job_id).await.unwrap().unwrap();
            if job.phase == JobPhase::Executing && job.counts.running > 0 {
                store.request_cancel(job_id).await.unwrap();
                break;
            }
        }
    });

    let outcome = h
        .orchestrator()
        .process(job_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Finished(JobPhase::Cancelled));

    let job = h.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.counts.failed, 4);
    assert!(job.counts.is_consistent());
    assert!(
        job.use_cases
            .values()
            .all(|r| r.error.as_ref().unwrap().kind == "cancelled")
    );
    assert_eq!(h.runtime.live(), 0);
    h.assert_writes_consistent();
}

#[tokio::test]
async fn test_shutdown_leaves_job_resumable() {
    let h = Harness::new(
        FakeRuntime::new()
            .with_use_cases(use_cases_json(3))
            .with_execution(|_| Script::Hang),
        true,
    );
    let job_id = h.submit("main").await;
    let shutdown = CancellationToken::new();

    let store = h.store.clone();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let job = store.get(job_id).await.unwrap().unwrap();
            if job.counts.running > 0 {
                trigger.cancel();
                break;
            }
        }
    });

    let outcome = h.orchestrator().process(job_id, shutdown).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Interrupted);

    let job = h.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.phase, JobPhase::Executing);
    assert!(!job.phase.is_terminal());
    assert_eq!(h.runtime.live(), 0);
}

#[tokio::test]
async fn test_lease_held_by_other_worker() {
    let h = Harness::new(FakeRuntime::new().with_use_cases(use_cases_json(2)), true);
    let job_id = h.submit("main").await;
    h.store
        .acquire_lease(job_id, "other-worker", Duration::from_secs(60))
        .await
        .unwrap();

    let outcome = h
        .orchestrator()
        .process(job_id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ProcessOutcome::LeaseHeld);
    let job = h.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.phase, JobPhase::Pending);
    assert_eq!(h.runtime.extractions(), 0);
}

#[tokio::test]
async fn test_jobs_sharing_global_limit_keep_their_leases() {
    let mut h = Harness::new(
        FakeRuntime::new()
            .with_use_cases(use_cases_json(1))
            .with_execution(|_| Script::ok(1000)),
        true,
    );
    h.config.pool.global_sandbox_limit = Some(1);
    h.config.lease_ttl = Duration::from_millis(300);
    h.config.pool.heartbeat_interval = Duration::from_millis(50);

    let first = h.submit("main").await;
    let second = h.submit("main").await;
    let orchestrator = h.orchestrator();

    // One job waits about a second for the only slot, well past the lease TTL
    let (a, b) = tokio::join!(
        orchestrator.process(first, CancellationToken::new()),
        orchestrator.process(second, CancellationToken::new()),
    );

    assert_eq!(a.unwrap(), ProcessOutcome::Finished(JobPhase::Completed));
    assert_eq!(b.unwrap(), ProcessOutcome::Finished(JobPhase::Completed));
    for id in [first, second] {
        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.counts.completed, 1);
        assert_eq!(job.counts.running, 0);
    }
    assert_eq!(h.runtime.executions(), 2);
    h.assert_writes_consistent();
}

#[tokio::test]
async fn test_abandon_fails_open_job_once() {
    let h = Harness::new(FakeRuntime::new(), true);
    let job_id = h.submit("main").await;
    h.store
        .update(job_id, |job| job.set_phase(JobPhase::Cloning))
        .await
        .unwrap();
    let orchestrator = h.orchestrator();

    let first = orchestrator
        .abandon(job_id, "no delivery finished within 3 attempt(s)")
        .await
        .unwrap();
    assert_eq!(first, Abandon::Failed);

    let job = h.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.phase, JobPhase::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.kind, ATTEMPTS_EXHAUSTED);
    assert!(error.message.contains("3 attempt(s)"));

    let again = orchestrator.abandon(job_id, "again").await.unwrap();
    assert_eq!(again, Abandon::Settled);
    let missing = orchestrator.abandon(uuid::Uuid::new_v4(), "gone").await.unwrap();
    assert_eq!(missing, Abandon::Settled);
    h.assert_writes_consistent();
}
