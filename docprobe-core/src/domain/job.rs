//! Job aggregate
//!
//! One job per submitted repository. The whole aggregate, including every
//! use case record, is stored as a single document, so all mutation goes
//! through the methods here to keep the counters consistent with the map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::error::ErrorDetail;
use super::execution::UseCaseOutcome;
use super::report::QualityReport;
use super::use_case::{UseCase, UseCaseRecord, UseCaseStatus};

/// Job phase
///
/// `pending -> cloning -> extracting -> (no_use_cases | queued) -> executing
/// -> {completed, completed_with_errors}`, with `failed`, `extraction_failed`
/// and `cancelled` as terminal exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Pending,
    Cloning,
    Extracting,
    NoUseCases,
    Queued,
    Executing,
    Completed,
    CompletedWithErrors,
    Failed,
    ExtractionFailed,
    Cancelled,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobPhase::Completed
                | JobPhase::CompletedWithErrors
                | JobPhase::Failed
                | JobPhase::ExtractionFailed
                | JobPhase::Cancelled
        )
    }

    /// Position along the happy path, used to decide whether a phase has
    /// already been passed. Terminal phases rank last.
    pub fn rank(self) -> u8 {
        match self {
            JobPhase::Pending => 0,
            JobPhase::Cloning => 1,
            JobPhase::Extracting => 2,
            JobPhase::NoUseCases | JobPhase::Queued => 3,
            JobPhase::Executing => 4,
            JobPhase::Completed
            | JobPhase::CompletedWithErrors
            | JobPhase::Failed
            | JobPhase::ExtractionFailed
            | JobPhase::Cancelled => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Pending => "pending",
            JobPhase::Cloning => "cloning",
            JobPhase::Extracting => "extracting",
            JobPhase::NoUseCases => "no_use_cases",
            JobPhase::Queued => "queued",
            JobPhase::Executing => "executing",
            JobPhase::Completed => "completed",
            JobPhase::CompletedWithErrors => "completed_with_errors",
            JobPhase::Failed => "failed",
            JobPhase::ExtractionFailed => "extraction_failed",
            JobPhase::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable parameters supplied at submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    pub repository_url: String,
    pub branch: String,
    pub include_folders: Vec<String>,
    pub user_id: String,
    pub project_id: Option<String>,
}

/// Aggregate use case counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseCaseCounts {
    pub total: u32,
    pub pending: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
}

impl UseCaseCounts {
    /// `pending + running + completed + failed == total`
    pub fn is_consistent(&self) -> bool {
        self.pending + self.running + self.completed + self.failed == self.total
    }
}

/// Errors raised when a mutation would break the aggregate's invariants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStateError {
    UnknownUseCase(u32),
    InvalidTransition {
        index: u32,
        from: UseCaseStatus,
        to: UseCaseStatus,
    },
}

impl std::fmt::Display for JobStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStateError::UnknownUseCase(index) => write!(f, "unknown use case index {}", index),
            JobStateError::InvalidTransition { index, from, to } => write!(
                f,
                "use case {} cannot move from {} to {}",
                index, from, to
            ),
        }
    }
}

impl std::error::Error for JobStateError {}

/// Job aggregate root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub params: JobParams,
    pub phase: JobPhase,
    pub counts: UseCaseCounts,
    pub use_cases: BTreeMap<u32, UseCaseRecord>,
    pub error: Option<ErrorDetail>,
    pub message: Option<String>,
    pub report: Option<QualityReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: Uuid, params: JobParams) -> Self {
        let now = Utc::now();
        Self {
            id,
            params,
            phase: JobPhase::Pending,
            counts: UseCaseCounts::default(),
            use_cases: BTreeMap::new(),
            error: None,
            message: None,
            report: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the job to `phase` and stamps `updated_at`
    pub fn set_phase(&mut self, phase: JobPhase) {
        self.phase = phase;
        self.touch();
    }

    /// Marks the job failed with `phase` (`failed` or `extraction_failed`)
    pub fn fail(&mut self, phase: JobPhase, error: ErrorDetail) {
        self.error = Some(error);
        self.set_phase(phase);
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Creates one pending record per use case, in extraction order
    ///
    /// Returns `false` without touching anything if records already exist,
    /// so a redelivered extraction never duplicates them.
    pub fn populate_use_cases(&mut self, use_cases: Vec<UseCase>) -> bool {
        if !self.use_cases.is_empty() {
            return false;
        }

        for (index, use_case) in use_cases.into_iter().enumerate() {
            let index = index as u32;
            self.use_cases
                .insert(index, UseCaseRecord::pending(index, use_case));
        }
        self.recount();
        true
    }

    /// Recomputes the counters from the record map
    pub fn recount(&mut self) {
        let mut counts = UseCaseCounts {
            total: self.use_cases.len() as u32,
            ..Default::default()
        };
        for record in self.use_cases.values() {
            match record.status {
                UseCaseStatus::Pending => counts.pending += 1,
                UseCaseStatus::Running => counts.running += 1,
                UseCaseStatus::Completed => counts.completed += 1,
                UseCaseStatus::Failed => counts.failed += 1,
            }
        }
        self.counts = counts;
    }

    /// Records that a sandbox was dispatched for `index`
    pub fn mark_running(
        &mut self,
        index: u32,
        started_at: DateTime<Utc>,
    ) -> Result<(), JobStateError> {
        let record = self
            .use_cases
            .get_mut(&index)
            .ok_or(JobStateError::UnknownUseCase(index))?;

        check_transition(record, UseCaseStatus::Running)?;
        record.status = UseCaseStatus::Running;
        record.started_at = Some(started_at);

        self.recount();
        self.touch();
        Ok(())
    }

    /// Applies a terminal outcome reported by the pool
    pub fn apply_outcome(&mut self, outcome: &UseCaseOutcome) -> Result<(), JobStateError> {
        let record = self
            .use_cases
            .get_mut(&outcome.index)
            .ok_or(JobStateError::UnknownUseCase(outcome.index))?;

        check_transition(record, outcome.status)?;
        record.status = outcome.status;
        record.started_at = outcome.started_at.or(record.started_at);
        record.finished_at = Some(outcome.finished_at);
        record.duration_seconds = record
            .started_at
            .map(|start| (outcome.finished_at - start).num_milliseconds() as f64 / 1000.0);
        record.exit_code = outcome.exit_code;
        record.log = outcome.log.clone();
        record.result = outcome.result.clone();
        record.error = outcome.error.clone();

        self.recount();
        self.touch();
        Ok(())
    }

    /// Indexes of records still waiting for a sandbox
    pub fn pending_indexes(&self) -> Vec<u32> {
        self.records_with(UseCaseStatus::Pending)
    }

    /// Indexes of records that were dispatched but never reported back
    pub fn running_indexes(&self) -> Vec<u32> {
        self.records_with(UseCaseStatus::Running)
    }

    fn records_with(&self, status: UseCaseStatus) -> Vec<u32> {
        self.use_cases
            .values()
            .filter(|r| r.status == status)
            .map(|r| r.index)
            .collect()
    }
}

fn check_transition(record: &UseCaseRecord, to: UseCaseStatus) -> Result<(), JobStateError> {
    if record.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(JobStateError::InvalidTransition {
            index: record.index,
            from: record.status,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::use_case::Difficulty;

    fn params() -> JobParams {
        JobParams {
            repository_url: "https://github.com/example/lib".to_string(),
            branch: "main".to_string(),
            include_folders: vec!["docs".to_string()],
            user_id: "user-1".to_string(),
            project_id: None,
        }
    }

    fn use_case(name: &str) -> UseCase {
        UseCase {
            name: name.to_string(),
            description: format!("{} description", name),
            success_criteria: vec!["works".to_string()],
            difficulty: Difficulty::Beginner,
            documentation_source: vec!["docs/README.md".to_string()],
        }
    }

    fn outcome(index: u32, status: UseCaseStatus) -> UseCaseOutcome {
        UseCaseOutcome {
            index,
            name: format!("uc-{}", index),
            status,
            exit_code: Some(if status == UseCaseStatus::Completed { 0 } else { 1 }),
            started_at: None,
            finished_at: Utc::now(),
            log: Some("log".to_string()),
            result: None,
            error: None,
        }
    }

    #[test]
    fn test_new_job_has_zero_counts() {
        let job = Job::new(Uuid::new_v4(), params());
        assert_eq!(job.phase, JobPhase::Pending);
        assert_eq!(job.counts, UseCaseCounts::default());
        assert!(job.counts.is_consistent());
    }

    #[test]
    fn test_populate_preserves_order_and_is_idempotent() {
        let mut job = Job::new(Uuid::new_v4(), params());
        assert!(job.populate_use_cases(vec![use_case("a"), use_case("b"), use_case("c")]));
        assert_eq!(job.counts.total, 3);
        assert_eq!(job.counts.pending, 3);
        assert_eq!(job.use_cases[&0].use_case.name, "a");
        assert_eq!(job.use_cases[&2].use_case.name, "c");

        assert!(!job.populate_use_cases(vec![use_case("x")]));
        assert_eq!(job.counts.total, 3);
        assert_eq!(job.use_cases[&0].use_case.name, "a");
    }

    #[test]
    fn test_counts_follow_transitions() {
        let mut job = Job::new(Uuid::new_v4(), params());
        job.populate_use_cases(vec![use_case("a"), use_case("b")]);

        job.mark_running(0, Utc::now()).unwrap();
        assert_eq!(job.counts.running, 1);
        assert!(job.counts.is_consistent());

        job.apply_outcome(&outcome(0, UseCaseStatus::Completed))
            .unwrap();
        assert_eq!(job.counts.completed, 1);
        assert_eq!(job.counts.pending, 1);
        assert!(job.counts.is_consistent());

        let record = &job.use_cases[&0];
        assert!(record.finished_at.is_some());
        assert!(record.duration_seconds.is_some());
    }

    #[test]
    fn test_status_never_regresses() {
        let mut job = Job::new(Uuid::new_v4(), params());
        job.populate_use_cases(vec![use_case("a")]);
        job.mark_running(0, Utc::now()).unwrap();
        job.apply_outcome(&outcome(0, UseCaseStatus::Failed)).unwrap();

        let err = job.mark_running(0, Utc::now()).unwrap_err();
        assert!(matches!(err, JobStateError::InvalidTransition { .. }));
        assert!(job.apply_outcome(&outcome(0, UseCaseStatus::Completed)).is_err());
        assert_eq!(job.use_cases[&0].status, UseCaseStatus::Failed);
    }

    #[test]
    fn test_start_failure_goes_straight_to_failed() {
        let mut job = Job::new(Uuid::new_v4(), params());
        job.populate_use_cases(vec![use_case("a")]);
        job.apply_outcome(&outcome(0, UseCaseStatus::Failed)).unwrap();
        assert_eq!(job.counts.failed, 1);
        assert!(job.use_cases[&0].duration_seconds.is_none());
    }

    #[test]
    fn test_unknown_index() {
        let mut job = Job::new(Uuid::new_v4(), params());
        assert_eq!(
            job.mark_running(7, Utc::now()),
            Err(JobStateError::UnknownUseCase(7))
        );
    }

    #[test]
    fn test_phase_rank_and_terminal() {
        assert!(JobPhase::Cloning.rank() < JobPhase::Extracting.rank());
        assert!(JobPhase::Extracting.rank() < JobPhase::Executing.rank());
        assert!(JobPhase::CompletedWithErrors.is_terminal());
        assert!(JobPhase::ExtractionFailed.is_terminal());
        assert!(!JobPhase::Executing.is_terminal());
        assert_eq!(
            serde_json::to_string(&JobPhase::CompletedWithErrors).unwrap(),
            "\"completed_with_errors\""
        );
    }
}
