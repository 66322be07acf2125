//! Structured error detail attached to jobs and use cases

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error captured at the moment a phase or a use case failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    /// Short machine-readable category (e.g. `clone`, `timeout`, `store`)
    pub kind: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorDetail {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.into(),
            timestamp: Utc::now(),
        }
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
