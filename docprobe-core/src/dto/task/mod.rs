//! Task dispatch payloads

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name under which analysis tasks are submitted to the task queue
pub const ANALYZE_REPOSITORY_TASK: &str = "analyze_repository";

/// Arguments of an `analyze_repository` task
///
/// The job record itself carries the repository parameters; the task only
/// points at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeTaskArgs {
    pub job_id: Uuid,
}
