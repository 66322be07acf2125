//! Repository cloning
//!
//! libgit2 is blocking, so the clone runs on the blocking pool. Timeouts and
//! cancellation flip an abort flag that the transfer progress callback
//! checks, which makes libgit2 stop the transfer on its next progress report.

use git2::{FetchOptions, RemoteCallbacks, build::RepoBuilder};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum CloneError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("clone timed out after {0:?}")]
    TimedOut(Duration),

    #[error("clone cancelled")]
    Cancelled,

    #[error("clone task failed: {0}")]
    Join(String),
}

/// Clones `branch` of `url` into `dest`
///
/// # Arguments
/// * `dest` - Target directory; must not exist or be empty
/// * `timeout` - Hard limit for the whole clone
pub async fn clone_repository(
    url: &str,
    branch: &str,
    dest: &Path,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), CloneError> {
    info!("Cloning {}@{} into {}", url, branch, dest.display());

    let abort = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&abort);
    let url = url.to_string();
    let branch = branch.to_string();
    let dest = dest.to_path_buf();

    let mut task = tokio::task::spawn_blocking(move || {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.transfer_progress(move |_| !flag.load(Ordering::Relaxed));

        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(callbacks);

        RepoBuilder::new()
            .branch(&branch)
            .fetch_options(fetch)
            .clone(&url, &dest)
            .map(|_| ())
    });

    tokio::select! {
        joined = &mut task => {
            joined.map_err(|e| CloneError::Join(e.to_string()))??;
            info!("Clone finished");
            Ok(())
        }
        _ = tokio::time::sleep(timeout) => {
            abort.store(true, Ordering::Relaxed);
            Err(CloneError::TimedOut(timeout))
        }
        _ = cancel.cancelled() => {
            abort.store(true, Ordering::Relaxed);
            Err(CloneError::Cancelled)
        }
    }
}
