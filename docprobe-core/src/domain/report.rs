//! Documentation quality report
//!
//! Every use case is worth 10 points: 2 for a description, 2 for success
//! criteria, 3 for a successful execution, 1 for a documentation source and
//! 2 for a difficulty label. The score is the percentage of points earned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::use_case::{Difficulty, UseCaseRecord, UseCaseStatus};

const POINTS_PER_USE_CASE: u32 = 10;

/// Letter grade derived from the quality score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Grade::A
        } else if score >= 80.0 {
            Grade::B
        } else if score >= 70.0 {
            Grade::C
        } else if score >= 60.0 {
            Grade::D
        } else {
            Grade::F
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let letter = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        f.write_str(letter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub total_use_cases: u32,
    pub successful_executions: u32,
    pub failed_executions: u32,
    /// Fraction in `0.0..=1.0`
    pub success_rate: f64,
    /// Percentage in `0.0..=100.0`
    pub quality_score: f64,
    pub grade: Grade,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl QualityReport {
    /// Scores a finished set of use case records
    pub fn generate<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a UseCaseRecord>,
    {
        let mut total = 0u32;
        let mut successful = 0u32;
        let mut failed = 0u32;
        let mut points = 0u32;
        let mut issues = Vec::new();
        let mut missing_docs = Vec::new();

        for record in records {
            total += 1;
            let use_case = &record.use_case;
            let has_description = !use_case.description.trim().is_empty();
            let has_criteria = !use_case.success_criteria.is_empty();

            if has_description {
                points += 2;
            }
            if has_criteria {
                points += 2;
            }
            match record.status {
                UseCaseStatus::Completed => {
                    points += 3;
                    successful += 1;
                }
                UseCaseStatus::Failed => failed += 1,
                _ => {}
            }
            if !use_case.documentation_source.is_empty() {
                points += 1;
            }
            if use_case.difficulty != Difficulty::Unknown {
                points += 2;
            }

            if !has_description {
                issues.push(format!("Use case '{}' lacks clear description", use_case.name));
                missing_docs.push(format!(
                    "Add clear description to use case '{}'",
                    use_case.name
                ));
            }
            if !has_criteria {
                issues.push(format!("Use case '{}' lacks success criteria", use_case.name));
                missing_docs.push(format!(
                    "Define clear success criteria for use case '{}'",
                    use_case.name
                ));
            }
            if record.status == UseCaseStatus::Failed {
                issues.push(format!("Use case '{}' failed execution", use_case.name));
            }
        }

        let mut recommendations = Vec::new();
        if failed > 0 {
            recommendations.push(format!(
                "{} use case(s) failed execution. Review the implementation and ensure \
                 the documentation provides accurate code examples.",
                failed
            ));
        }
        recommendations.extend(missing_docs);

        let max_points = total * POINTS_PER_USE_CASE;
        let quality_score = if max_points > 0 {
            points as f64 / max_points as f64 * 100.0
        } else {
            0.0
        };
        let success_rate = if total > 0 {
            successful as f64 / total as f64
        } else {
            0.0
        };

        Self {
            total_use_cases: total,
            successful_executions: successful,
            failed_executions: failed,
            success_rate,
            quality_score,
            grade: Grade::from_score(quality_score),
            issues,
            recommendations,
            generated_at: Utc::now(),
        }
    }
}
