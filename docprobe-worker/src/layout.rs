//! On-disk layout of a job
//!
//! ```text
//! <data_root>/<job_id>/repo                           cloned repository
//! <data_root>/<job_id>/data/use_cases.json            extraction output
//! <data_root>/<job_id>/data/use_case_<n>/use_case.json
//! <data_root>/<job_id>/data/use_case_<n>/use_case_<n>_results.json
//! <data_root>/<job_id>/data/report.json
//! ```
//!
//! `<n>` is the 1-based position of the use case.

use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const USE_CASES_FILE: &str = "use_cases.json";
pub const DESCRIPTOR_FILE: &str = "use_case.json";
pub const REPORT_FILE: &str = "report.json";

#[derive(Debug, Clone)]
pub struct JobLayout {
    root: PathBuf,
}

impl JobLayout {
    pub fn new(data_root: &Path, job_id: Uuid) -> Self {
        Self {
            root: data_root.join(job_id.to_string()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.root.join("repo")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn use_cases_file(&self) -> PathBuf {
        self.data_dir().join(USE_CASES_FILE)
    }

    pub fn report_file(&self) -> PathBuf {
        self.data_dir().join(REPORT_FILE)
    }

    /// Whether a clone finished here before
    pub fn has_repository(&self) -> bool {
        self.repo_dir().join(".git").exists()
    }

    /// Removes any partial clone and makes sure the job root exists
    pub async fn reset_repository(&self) -> io::Result<()> {
        remove_dir_if_exists(&self.repo_dir()).await?;
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Empties the data directory
    pub async fn reset_data(&self) -> io::Result<()> {
        let data = self.data_dir();
        remove_dir_if_exists(&data).await?;
        tokio::fs::create_dir_all(&data).await
    }

    pub async fn ensure_data(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(self.data_dir()).await
    }
}

/// Output directory of the use case at `index` (0-based) under `data_dir`
pub fn use_case_dir(data_dir: &Path, index: u32) -> PathBuf {
    data_dir.join(format!("use_case_{}", index + 1))
}

/// Name of the results document the execution agent writes for `index`
pub fn results_file_name(index: u32) -> String {
    format!("use_case_{}_results.json", index + 1)
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let id = Uuid::nil();
        let layout = JobLayout::new(Path::new("/srv/docprobe"), id);
        let root = PathBuf::from(format!("/srv/docprobe/{}", id));

        assert_eq!(layout.repo_dir(), root.join("repo"));
        assert_eq!(layout.use_cases_file(), root.join("data/use_cases.json"));
        assert_eq!(
            use_case_dir(&layout.data_dir(), 0),
            root.join("data/use_case_1")
        );
        assert_eq!(results_file_name(6), "use_case_7_results.json");
    }

    #[tokio::test]
    async fn test_reset_removes_partial_state() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(tmp.path(), Uuid::new_v4());

        tokio::fs::create_dir_all(layout.repo_dir().join(".git"))
            .await
            .unwrap();
        assert!(layout.has_repository());
        layout.reset_repository().await.unwrap();
        assert!(!layout.has_repository());
        assert!(layout.root().exists());

        layout.reset_data().await.unwrap();
        tokio::fs::write(layout.use_cases_file(), "[]").await.unwrap();
        layout.reset_data().await.unwrap();
        assert!(layout.data_dir().exists());
        assert!(!layout.use_cases_file().exists());
    }
}
