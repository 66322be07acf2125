//! Use case extraction
//!
//! Runs the extraction agent once per job and turns its output file into
//! validated use cases.

use docprobe_core::domain::use_case::{UseCase, parse_use_cases};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::sandbox::{self, SandboxError, SandboxRuntime, SandboxSpec, WatchResult};

const DOC_EXTENSIONS: [&str; 3] = ["md", "rst", "txt"];

/// Log bytes kept in error messages
const LOG_TAIL: usize = 2000;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("extraction exited with code {code}: {log}")]
    NonZeroExit { code: i32, log: String },

    #[error("extraction timed out after {0:?}")]
    TimedOut(Duration),

    #[error("extraction cancelled")]
    Cancelled,

    #[error("invalid extraction output: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("failed to read extraction output: {0}")]
    Io(#[from] std::io::Error),
}

/// Documentation files under the include folders of a cloned repository
///
/// Folders that do not exist are skipped.
pub fn find_doc_files(repo_dir: &Path, include_folders: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for folder in include_folders {
        let root = repo_dir.join(folder);
        if !root.exists() {
            debug!("Include folder {} does not exist", root.display());
            continue;
        }

        files.extend(
            WalkDir::new(&root)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter(|entry| {
                    entry
                        .path()
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| DOC_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                })
                .map(|entry| entry.into_path()),
        );
    }
    files.sort();
    files.dedup();
    files
}

/// Runs the extraction sandbox to completion
///
/// # Returns
/// The sandbox logs when it exits with code 0
pub async fn run_extraction(
    runtime: &dyn SandboxRuntime,
    spec: &SandboxSpec,
    poll_interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<String, ExtractionError> {
    let id = runtime.start(spec).await?;
    info!("Extraction sandbox {} started", id);

    match sandbox::watch(runtime, &id, poll_interval, timeout, &cancel).await {
        WatchResult::Exited(0) => {
            let logs = sandbox::teardown(runtime, &id, false).await;
            info!("Extraction sandbox {} finished", id);
            Ok(logs.unwrap_or_default())
        }
        WatchResult::Exited(code) => {
            let logs = sandbox::teardown(runtime, &id, false).await;
            Err(ExtractionError::NonZeroExit {
                code,
                log: tail(&logs.unwrap_or_default()),
            })
        }
        WatchResult::TimedOut => {
            sandbox::teardown(runtime, &id, true).await;
            Err(ExtractionError::TimedOut(timeout))
        }
        WatchResult::Cancelled => {
            sandbox::teardown(runtime, &id, true).await;
            Err(ExtractionError::Cancelled)
        }
        WatchResult::Failed(e) => {
            sandbox::teardown(runtime, &id, true).await;
            Err(ExtractionError::Sandbox(e))
        }
    }
}

/// Reads `use_cases.json`
///
/// A missing file means the agent found nothing; a present but unparseable
/// file is an error.
pub async fn read_use_cases(path: &Path) -> Result<Vec<UseCase>, ExtractionError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No extraction output at {}", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    Ok(parse_use_cases(&contents)?)
}

fn tail(log: &str) -> String {
    let trimmed = log.trim_end();
    if trimmed.len() <= LOG_TAIL {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - LOG_TAIL;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}
