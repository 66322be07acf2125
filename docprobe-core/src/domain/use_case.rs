//! Use case domain types
//!
//! A use case is one usage example mined from a repository's documentation.
//! The extraction agent emits them as loosely-shaped JSON; they are validated
//! into [`UseCase`] once, at ingestion, and travel as typed values afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ErrorDetail;

/// Difficulty label assigned by the extraction agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
    #[default]
    Unknown,
}

impl Difficulty {
    /// Parses a free-form label, case-insensitively
    pub fn parse(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "beginner" | "easy" => Difficulty::Beginner,
            "intermediate" | "medium" => Difficulty::Intermediate,
            "advanced" | "hard" => Difficulty::Advanced,
            _ => Difficulty::Unknown,
        }
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Difficulty::Beginner => write!(f, "Beginner"),
            Difficulty::Intermediate => write!(f, "Intermediate"),
            Difficulty::Advanced => write!(f, "Advanced"),
            Difficulty::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Validated use case content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseCase {
    pub name: String,
    pub description: String,
    pub success_criteria: Vec<String>,
    pub difficulty: Difficulty,
    pub documentation_source: Vec<String>,
}

/// Execution status of a single use case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseCaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl UseCaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UseCaseStatus::Completed | UseCaseStatus::Failed)
    }

    /// Whether moving from `self` to `next` keeps the status sequence monotonic
    ///
    /// `Pending -> Failed` is allowed for sandboxes that never started and for
    /// queued items dropped by cancellation.
    pub fn can_transition_to(self, next: UseCaseStatus) -> bool {
        use UseCaseStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
        )
    }
}

impl std::fmt::Display for UseCaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UseCaseStatus::Pending => write!(f, "pending"),
            UseCaseStatus::Running => write!(f, "running"),
            UseCaseStatus::Completed => write!(f, "completed"),
            UseCaseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted state of one use case inside a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UseCaseRecord {
    pub index: u32,
    #[serde(flatten)]
    pub use_case: UseCase,
    pub status: UseCaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub exit_code: Option<i32>,
    /// Captured sandbox output
    pub log: Option<String>,
    /// Result document written by the execution agent, if any
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorDetail>,
}

impl UseCaseRecord {
    pub fn pending(index: u32, use_case: UseCase) -> Self {
        Self {
            index,
            use_case,
            status: UseCaseStatus::Pending,
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            exit_code: None,
            log: None,
            result: None,
            error: None,
        }
    }
}

// =============================================================================
// Extraction output
// =============================================================================

/// A field the extraction agent emits either as one string or as a list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        let items = match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        };
        items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Use case exactly as the extraction agent wrote it
#[derive(Debug, Clone, Deserialize)]
struct RawUseCase {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    success_criteria: Option<OneOrMany>,
    #[serde(default, alias = "difficulty")]
    difficulty_level: Option<String>,
    #[serde(default)]
    documentation_source: Option<OneOrMany>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExtractionDocument {
    Wrapped { use_cases: Vec<RawUseCase> },
    Bare(Vec<RawUseCase>),
}

/// Parses the contents of `use_cases.json`
///
/// Accepts `{"use_cases": [...]}` as well as a bare top-level array. The
/// returned order is the extraction order and becomes the use case index.
pub fn parse_use_cases(json: &str) -> Result<Vec<UseCase>, serde_json::Error> {
    let document: ExtractionDocument = serde_json::from_str(json)?;
    let raw = match document {
        ExtractionDocument::Wrapped { use_cases } => use_cases,
        ExtractionDocument::Bare(use_cases) => use_cases,
    };

    Ok(raw
        .into_iter()
        .enumerate()
        .map(|(i, raw)| UseCase {
            name: raw
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format!("Use case {}", i + 1)),
            description: raw.description.unwrap_or_default().trim().to_string(),
            success_criteria: raw
                .success_criteria
                .map(OneOrMany::into_vec)
                .unwrap_or_default(),
            difficulty: raw
                .difficulty_level
                .as_deref()
                .map(Difficulty::parse)
                .unwrap_or_default(),
            documentation_source: raw
                .documentation_source
                .map(OneOrMany::into_vec)
                .unwrap_or_default(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wrapped_document() {
        let json = r#"{
            "use_cases": [
                {
                    "name": "Install",
                    "description": "Install the library",
                    "success_criteria": ["imports work", "version prints"],
                    "difficulty_level": "Beginner",
                    "documentation_source": ["docs/install.md"]
                },
                {
                    "name": "Stream",
                    "description": "Stream responses",
                    "success_criteria": "tokens arrive incrementally",
                    "difficulty_level": "advanced",
                    "documentation_source": "docs/streaming.md"
                }
            ]
        }"#;

        let use_cases = parse_use_cases(json).unwrap();
        assert_eq!(use_cases.len(), 2);
        assert_eq!(use_cases[0].name, "Install");
        assert_eq!(use_cases[0].success_criteria.len(), 2);
        assert_eq!(use_cases[0].difficulty, Difficulty::Beginner);
        assert_eq!(
            use_cases[1].success_criteria,
            vec!["tokens arrive incrementally".to_string()]
        );
        assert_eq!(use_cases[1].difficulty, Difficulty::Advanced);
        assert_eq!(
            use_cases[1].documentation_source,
            vec!["docs/streaming.md".to_string()]
        );
    }

    #[test]
    fn test_parse_bare_array_and_defaults() {
        let json = r#"[{"description": "no name here"}]"#;
        let use_cases = parse_use_cases(json).unwrap();
        assert_eq!(use_cases[0].name, "Use case 1");
        assert_eq!(use_cases[0].difficulty, Difficulty::Unknown);
        assert!(use_cases[0].success_criteria.is_empty());
    }

    #[test]
    fn test_parse_empty_list() {
        let use_cases = parse_use_cases(r#"{"use_cases": []}"#).unwrap();
        assert!(use_cases.is_empty());
    }

    #[test]
    fn test_parse_corrupt_document() {
        assert!(parse_use_cases("{\"use_cases\": [").is_err());
        assert!(parse_use_cases(r#"{"something_else": 1}"#).is_err());
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        use UseCaseStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Completed));
    }
}
