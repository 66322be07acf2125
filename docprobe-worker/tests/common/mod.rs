#![allow(dead_code)]

use async_trait::async_trait;
use docprobe_core::domain::job::{Job, JobParams};
use docprobe_core::domain::use_case::UseCaseStatus;
use docprobe_store::{JobStore, KeyedStore, MemoryStore, StoreError};
use docprobe_worker::config::Config;
use docprobe_worker::layout::{USE_CASES_FILE, results_file_name};
use docprobe_worker::sandbox::{
    DATA_MOUNT, Result, SandboxError, SandboxId, SandboxRuntime, SandboxSpec, SandboxState,
};
use git2::{Repository, Signature};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use uuid::Uuid;

// =============================================================================
// Scripted runtime
// =============================================================================

/// How a fake sandbox behaves
#[derive(Debug, Clone, Copy)]
pub enum Script {
    Exit { code: i32, after: Duration },
    Hang,
}

impl Script {
    pub fn ok(after_ms: u64) -> Self {
        Script::Exit {
            code: 0,
            after: Duration::from_millis(after_ms),
        }
    }

    pub fn fail(code: i32, after_ms: u64) -> Self {
        Script::Exit {
            code,
            after: Duration::from_millis(after_ms),
        }
    }
}

struct FakeSandbox {
    exit_at: Option<Instant>,
    code: i32,
    killed: bool,
    removed: bool,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    sandboxes: HashMap<String, FakeSandbox>,
    live: usize,
    max_live: usize,
    extractions: usize,
    executions: usize,
    unavailable: bool,
}

type ExecutionScript = Box<dyn Fn(u32) -> Script + Send + Sync>;

/// In-memory sandbox runtime
///
/// Extraction sandboxes write the configured `use_cases.json`; execution
/// sandboxes follow a per-index script and write a results file on success.
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    extraction: Script,
    extraction_output: Option<String>,
    execution: ExecutionScript,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            extraction: Script::ok(10),
            extraction_output: None,
            execution: Box::new(|_| Script::ok(20)),
        }
    }

    pub fn with_use_cases(mut self, json: impl Into<String>) -> Self {
        self.extraction_output = Some(json.into());
        self
    }

    pub fn with_extraction(mut self, script: Script) -> Self {
        self.extraction = script;
        self
    }

    pub fn with_execution<F>(mut self, script: F) -> Self
    where
        F: Fn(u32) -> Script + Send + Sync + 'static,
    {
        self.execution = Box::new(script);
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Highest number of sandboxes alive at the same time
    pub fn max_live(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    /// Sandboxes started and not yet removed
    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live
    }

    pub fn extractions(&self) -> usize {
        self.state.lock().unwrap().extractions
    }

    pub fn executions(&self) -> usize {
        self.state.lock().unwrap().executions
    }
}

fn data_mount(spec: &SandboxSpec) -> Option<PathBuf> {
    spec.mounts
        .iter()
        .find(|m| m.target == DATA_MOUNT)
        .map(|m| m.source.clone())
}

fn env<'a>(spec: &'a SandboxSpec, key: &str) -> Option<&'a str> {
    spec.env
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        if self.state.lock().unwrap().unavailable {
            return Err(SandboxError::RuntimeUnavailable("engine down".to_string()));
        }
        Ok(())
    }

    async fn start(&self, spec: &SandboxSpec) -> Result<SandboxId> {
        if self.state.lock().unwrap().unavailable {
            return Err(SandboxError::RuntimeUnavailable("engine down".to_string()));
        }

        let output = data_mount(spec).expect("data mount");
        let index = env(spec, "USE_CASE_INDEX").and_then(|i| i.parse::<u32>().ok());

        let script = match index {
            None => {
                if let Some(json) = &self.extraction_output {
                    fs::write(output.join(USE_CASES_FILE), json)?;
                }
                self.extraction
            }
            Some(index) => {
                let script = (self.execution)(index);
                if let Script::Exit { code: 0, .. } = script {
                    fs::write(
                        output.join(results_file_name(index)),
                        format!(r#"{{"index": {}, "passed": true}}"#, index),
                    )?;
                }
                script
            }
        };

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        let (exit_at, code) = match script {
            Script::Exit { code, after } => (Some(Instant::now() + after), code),
            Script::Hang => (None, 0),
        };
        state.sandboxes.insert(
            id.clone(),
            FakeSandbox {
                exit_at,
                code,
                killed: false,
                removed: false,
            },
        );
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        if index.is_some() {
            state.executions += 1;
        } else {
            state.extractions += 1;
        }

        Ok(SandboxId(id))
    }

    async fn inspect(&self, id: &SandboxId) -> Result<SandboxState> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(SandboxError::RuntimeUnavailable("engine down".to_string()));
        }
        let sandbox = state
            .sandboxes
            .get(&id.0)
            .filter(|s| !s.removed)
            .ok_or_else(|| SandboxError::NotFound(id.0.clone()))?;

        if sandbox.killed {
            return Ok(SandboxState::Exited(137));
        }
        match sandbox.exit_at {
            Some(at) if Instant::now() >= at => Ok(SandboxState::Exited(sandbox.code)),
            _ => Ok(SandboxState::Running),
        }
    }

    async fn logs(&self, id: &SandboxId) -> Result<String> {
        Ok(format!("output of {}", id))
    }

    async fn kill(&self, id: &SandboxId) -> Result<()> {
        if let Some(sandbox) = self.state.lock().unwrap().sandboxes.get_mut(&id.0) {
            sandbox.killed = true;
        }
        Ok(())
    }

    async fn remove(&self, id: &SandboxId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let removed = match state.sandboxes.get_mut(&id.0) {
            Some(sandbox) if !sandbox.removed => {
                sandbox.removed = true;
                true
            }
            _ => false,
        };
        if removed {
            state.live -= 1;
        }
        Ok(())
    }
}

// =============================================================================
// Checked store
// =============================================================================

/// Keyed store that validates every job write against the previous one
///
/// Counters must match the records on every write, and no use case may move
/// back to an earlier status or switch between terminal statuses.
#[derive(Default)]
pub struct CheckedStore {
    inner: MemoryStore,
    jobs: Mutex<HashMap<String, Job>>,
    job_writes: Mutex<usize>,
    violations: Mutex<Vec<String>>,
}

fn status_rank(status: UseCaseStatus) -> u8 {
    match status {
        UseCaseStatus::Pending => 0,
        UseCaseStatus::Running => 1,
        UseCaseStatus::Completed | UseCaseStatus::Failed => 2,
    }
}

impl CheckedStore {
    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().unwrap().clone()
    }

    pub fn job_writes(&self) -> usize {
        *self.job_writes.lock().unwrap()
    }

    fn check(&self, key: &str, value: &Value) {
        if !key.starts_with("job:") {
            return;
        }
        let Ok(job) = serde_json::from_value::<Job>(value.clone()) else {
            return;
        };
        *self.job_writes.lock().unwrap() += 1;
        let mut violations = self.violations.lock().unwrap();

        let mut recounted = job.clone();
        recounted.recount();
        if !job.counts.is_consistent() || recounted.counts != job.counts {
            violations.push(format!("{}: counters {:?} disagree with records", key, job.counts));
        }

        let mut jobs = self.jobs.lock().unwrap();
        if let Some(previous) = jobs.get(key) {
            for (index, before) in &previous.use_cases {
                let Some(after) = job.use_cases.get(index) else {
                    violations.push(format!("{}: use case {} disappeared", key, index));
                    continue;
                };
                let regressed = status_rank(after.status) < status_rank(before.status);
                let flipped = before.status.is_terminal() && after.status != before.status;
                if regressed || flipped {
                    violations.push(format!(
                        "{}: use case {} went from {} to {}",
                        key, index, before.status, after.status
                    ));
                }
            }
        }
        jobs.insert(key.to_string(), job);
    }
}

#[async_trait]
impl KeyedStore for CheckedStore {
    async fn get(&self, key: &str) -> std::result::Result<Option<Value>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> std::result::Result<(), StoreError> {
        self.check(key, &value);
        self.inner.put(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> std::result::Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> std::result::Result<Vec<(String, Value)>, StoreError> {
        self.inner.list(prefix).await
    }

    async fn increment(&self, key: &str) -> std::result::Result<i64, StoreError> {
        self.inner.increment(key).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> std::result::Result<bool, StoreError> {
        self.check(key, &value);
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: &Value,
        value: Value,
        ttl: Option<Duration>,
    ) -> std::result::Result<bool, StoreError> {
        self.check(key, &value);
        self.inner.compare_and_put(key, expected, value, ttl).await
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &Value,
    ) -> std::result::Result<bool, StoreError> {
        self.inner.compare_and_delete(key, expected).await
    }

    async fn purge_expired(&self) -> std::result::Result<u64, StoreError> {
        self.inner.purge_expired().await
    }
}

/// Job store whose every write is validated by the returned [`CheckedStore`]
pub fn checked_store() -> (JobStore, Arc<CheckedStore>) {
    let checked = Arc::new(CheckedStore::default());
    let store = JobStore::new(Arc::clone(&checked) as Arc<dyn KeyedStore>);
    (store, checked)
}

// =============================================================================
// Fixtures
// =============================================================================

/// Creates a git repository with one commit on `main`
pub fn origin_repo(with_docs: bool) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::init(dir.path()).unwrap();

    fs::write(dir.path().join("README"), "readme").unwrap();
    if with_docs {
        fs::create_dir_all(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/getting-started.md"), "# Getting started").unwrap();
    }

    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = Signature::now("test", "test@test.com").unwrap();
    repo.commit(Some("refs/heads/main"), &sig, &sig, "init", &tree, &[])
        .unwrap();
    repo.set_head("refs/heads/main").unwrap();
    dir
}

/// Extraction output with `n` fully described use cases
pub fn use_cases_json(n: usize) -> String {
    let items: Vec<serde_json::Value> = (1..=n)
        .map(|i| {
            serde_json::json!({
                "name": format!("Use case {}", i),
                "description": format!("Follow step {} of the guide", i),
                "success_criteria": ["command succeeds"],
                "difficulty_level": "Beginner",
                "documentation_source": ["docs/getting-started.md"],
            })
        })
        .collect();
    serde_json::json!({ "use_cases": items }).to_string()
}

/// Configuration with short intervals for tests
pub fn test_config(data_root: &Path) -> Config {
    let mut config = Config::new(
        "worker-test".to_string(),
        "postgres://localhost/docprobe".to_string(),
    );
    config.data_root = data_root.to_path_buf();
    config.lease_ttl = Duration::from_secs(5);
    config.clone_timeout = Duration::from_secs(30);
    config.extraction_timeout = Duration::from_secs(5);
    config.pool.poll_interval = Duration::from_millis(5);
    config.pool.heartbeat_interval = Duration::from_millis(50);
    config.pool.sandbox_timeout = Duration::from_secs(5);
    config
}

pub fn memory_store() -> JobStore {
    JobStore::new(Arc::new(MemoryStore::new()))
}

/// Stores a pending job for `origin` and returns its id
pub async fn submit_job(store: &JobStore, origin: &Path, branch: &str) -> Uuid {
    let id = Uuid::new_v4();
    let job = Job::new(
        id,
        JobParams {
            repository_url: origin.to_string_lossy().into_owned(),
            branch: branch.to_string(),
            include_folders: vec!["docs".to_string()],
            user_id: "tester".to_string(),
            project_id: None,
        },
    );
    store.create(&job).await.unwrap();
    id
}
