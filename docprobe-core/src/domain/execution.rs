//! Sandbox execution results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ErrorDetail;
use super::use_case::UseCaseStatus;

/// Terminal result of one use case, as reported by the pool manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UseCaseOutcome {
    pub index: u32,
    pub name: String,
    /// `Completed` or `Failed`
    pub status: UseCaseStatus,
    pub exit_code: Option<i32>,
    /// `None` when the sandbox never started
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub log: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorDetail>,
}

impl UseCaseOutcome {
    pub fn is_success(&self) -> bool {
        self.status == UseCaseStatus::Completed
    }
}

/// Aggregate returned once every use case of a run has finished
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    /// Sorted by use case index
    pub results: Vec<UseCaseOutcome>,
}

impl ExecutionSummary {
    pub fn record(&mut self, outcome: UseCaseOutcome) {
        if outcome.is_success() {
            self.completed_count += 1;
        } else {
            self.failed_count += 1;
        }
        let pos = self
            .results
            .partition_point(|existing| existing.index < outcome.index);
        self.results.insert(pos, outcome);
    }

    /// `true` if every use case of the run reported back
    pub fn is_complete(&self) -> bool {
        self.completed_count + self.failed_count == self.total
    }
}
