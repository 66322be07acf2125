use docprobe_store::{JobStore, TaskQueue};
use std::path::PathBuf;
use std::sync::Arc;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
    pub tasks: Arc<dyn TaskQueue>,
    /// Shared with the workers; holds one directory per job
    pub data_root: PathBuf,
}
