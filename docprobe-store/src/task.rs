//! Task dispatch
//!
//! At-least-once delivery of named tasks. A claimed task stays invisible to
//! other workers for a visibility window; if it is neither acknowledged nor
//! extended before the window closes, it is delivered again. A task nacked
//! on its `max_attempts`-th delivery is marked failed.
//!
//! A task whose final delivery times out is delivered once more with
//! `attempt > max_attempts`, so a worker can settle whatever the task was
//! driving before nacking it for good. If that delivery times out as well
//! the task is failed without another.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Result, StoreError};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Claimed,
    Succeeded,
    Failed,
}

impl TaskStatus {
    fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "queued" => TaskStatus::Queued,
            "claimed" => TaskStatus::Claimed,
            "succeeded" => TaskStatus::Succeeded,
            _ => TaskStatus::Failed,
        }
    }
}

/// A task delivered to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub name: String,
    pub args: Value,
    /// 1 on first delivery
    pub attempt: u32,
    pub max_attempts: u32,
}

impl ClaimedTask {
    /// A nack of this delivery fails the task
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Every attempt was used up without an ack; the task must not be run again
    pub fn is_exhausted(&self) -> bool {
        self.attempt > self.max_attempts
    }
}

/// Stored state of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueues a task under a caller-chosen id
    async fn submit(&self, name: &str, args: Value, task_id: Uuid) -> Result<()>;

    /// Claims the oldest deliverable task
    ///
    /// # Arguments
    /// * `worker_id` - Identity recorded as the claimant
    /// * `visibility` - How long the task stays hidden before redelivery
    async fn claim(&self, worker_id: &str, visibility: Duration) -> Result<Option<ClaimedTask>>;

    /// Pushes the redelivery deadline of a claimed task out by `visibility`
    async fn extend(&self, task_id: Uuid, visibility: Duration) -> Result<()>;

    /// Marks the task done
    async fn ack(&self, task_id: Uuid) -> Result<()>;

    /// Releases the task for redelivery, or fails it once attempts run out
    async fn nack(&self, task_id: Uuid, error: &str) -> Result<()>;

    /// Requeues a claimed task without counting the delivery as an attempt
    ///
    /// Used when the worker stops before the task could make progress.
    async fn release(&self, task_id: Uuid) -> Result<()>;

    async fn status(&self, task_id: Uuid) -> Result<Option<TaskRecord>>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

struct MemoryTask {
    record: TaskRecord,
    args: Value,
    visible_at: Option<Instant>,
}

pub struct MemoryTaskQueue {
    tasks: Mutex<Vec<MemoryTask>>,
    max_attempts: u32,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl MemoryTaskQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            max_attempts,
        }
    }

    fn with_tasks<T>(&self, f: impl FnOnce(&mut Vec<MemoryTask>) -> T) -> T {
        let mut tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut tasks)
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn submit(&self, name: &str, args: Value, task_id: Uuid) -> Result<()> {
        self.with_tasks(|tasks| {
            if tasks.iter().any(|t| t.record.id == task_id) {
                return;
            }
            tasks.push(MemoryTask {
                record: TaskRecord {
                    id: task_id,
                    name: name.to_string(),
                    status: TaskStatus::Queued,
                    attempts: 0,
                    claimed_by: None,
                    last_error: None,
                },
                args,
                visible_at: None,
            });
        });
        Ok(())
    }

    async fn claim(&self, worker_id: &str, visibility: Duration) -> Result<Option<ClaimedTask>> {
        let max_attempts = self.max_attempts;
        Ok(self.with_tasks(|tasks| {
            let now = Instant::now();
            for task in tasks.iter_mut() {
                let expired = task.record.status == TaskStatus::Claimed
                    && task.visible_at.is_some_and(|at| at <= now);

                if expired && task.record.attempts > max_attempts {
                    task.record.status = TaskStatus::Failed;
                    task.record.last_error =
                        Some("visibility timeout exceeded on final attempt".to_string());
                    continue;
                }

                if task.record.status == TaskStatus::Queued || expired {
                    task.record.status = TaskStatus::Claimed;
                    task.record.attempts += 1;
                    task.record.claimed_by = Some(worker_id.to_string());
                    task.visible_at = Some(now + visibility);
                    return Some(ClaimedTask {
                        id: task.record.id,
                        name: task.record.name.clone(),
                        args: task.args.clone(),
                        attempt: task.record.attempts,
                        max_attempts,
                    });
                }
            }
            None
        }))
    }

    async fn extend(&self, task_id: Uuid, visibility: Duration) -> Result<()> {
        self.with_tasks(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.record.id == task_id)
                .ok_or(StoreError::TaskNotFound(task_id))?;
            if task.record.status == TaskStatus::Claimed {
                task.visible_at = Some(Instant::now() + visibility);
            }
            Ok(())
        })
    }

    async fn ack(&self, task_id: Uuid) -> Result<()> {
        self.with_tasks(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.record.id == task_id)
                .ok_or(StoreError::TaskNotFound(task_id))?;
            task.record.status = TaskStatus::Succeeded;
            task.visible_at = None;
            Ok(())
        })
    }

    async fn nack(&self, task_id: Uuid, error: &str) -> Result<()> {
        let max_attempts = self.max_attempts;
        self.with_tasks(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.record.id == task_id)
                .ok_or(StoreError::TaskNotFound(task_id))?;
            task.record.last_error = Some(error.to_string());
            task.visible_at = None;
            task.record.status = if task.record.attempts >= max_attempts {
                TaskStatus::Failed
            } else {
                TaskStatus::Queued
            };
            Ok(())
        })
    }

    async fn release(&self, task_id: Uuid) -> Result<()> {
        self.with_tasks(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.record.id == task_id)
                .ok_or(StoreError::TaskNotFound(task_id))?;
            if task.record.status == TaskStatus::Claimed {
                task.record.status = TaskStatus::Queued;
                task.record.attempts = task.record.attempts.saturating_sub(1);
                task.visible_at = None;
            }
            Ok(())
        })
    }

    async fn status(&self, task_id: Uuid) -> Result<Option<TaskRecord>> {
        Ok(self.with_tasks(|tasks| {
            tasks
                .iter()
                .find(|t| t.record.id == task_id)
                .map(|t| t.record.clone())
        }))
    }
}

// =============================================================================
// Postgres implementation
// =============================================================================

#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
    max_attempts: u32,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

fn deadline(visibility: Duration) -> DateTime<Utc> {
    let visibility = chrono::Duration::from_std(visibility).unwrap_or(chrono::Duration::hours(24));
    Utc::now() + visibility
}

#[derive(FromRow)]
struct ClaimedRow {
    id: Uuid,
    name: String,
    args: Value,
    attempts: i32,
    max_attempts: i32,
}

#[derive(FromRow)]
struct TaskRow {
    id: Uuid,
    name: String,
    status: String,
    attempts: i32,
    claimed_by: Option<String>,
    last_error: Option<String>,
}

impl From<TaskRow> for TaskRecord {
    fn from(row: TaskRow) -> Self {
        TaskRecord {
            id: row.id,
            name: row.name,
            status: TaskStatus::parse(&row.status),
            attempts: row.attempts.max(0) as u32,
            claimed_by: row.claimed_by,
            last_error: row.last_error,
        }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn submit(&self, name: &str, args: Value, task_id: Uuid) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO tasks (id, name, args, status, attempts, max_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 0, $5, $6, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(task_id)
        .bind(name)
        .bind(args)
        .bind(TaskStatus::Queued.as_str())
        .bind(self.max_attempts as i32)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim(&self, worker_id: &str, visibility: Duration) -> Result<Option<ClaimedTask>> {
        // Tasks whose settling delivery also timed out are failed instead of redelivered
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed', last_error = 'visibility timeout exceeded on final attempt',
                updated_at = NOW()
            WHERE status = 'claimed' AND visible_at <= NOW() AND attempts > max_attempts
            "#,
        )
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, ClaimedRow>(
            r#"
            UPDATE tasks
            SET status = 'claimed', attempts = attempts + 1, claimed_by = $1,
                visible_at = $2, updated_at = NOW()
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'queued'
                   OR (status = 'claimed' AND visible_at <= NOW())
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, name, args, attempts, max_attempts
            "#,
        )
        .bind(worker_id)
        .bind(deadline(visibility))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ClaimedTask {
            id: r.id,
            name: r.name,
            args: r.args,
            attempt: r.attempts.max(0) as u32,
            max_attempts: r.max_attempts.max(0) as u32,
        }))
    }

    async fn extend(&self, task_id: Uuid, visibility: Duration) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET visible_at = $2, updated_at = NOW() WHERE id = $1 AND status = 'claimed'",
        )
        .bind(task_id)
        .bind(deadline(visibility))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ack(&self, task_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'succeeded', visible_at = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn nack(&self, task_id: Uuid, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'queued' END,
                last_error = $2, visible_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn release(&self, task_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'queued', attempts = GREATEST(attempts - 1, 0),
                visible_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.status(task_id).await?.is_none() {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn status(&self, task_id: Uuid) -> Result<Option<TaskRecord>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, name, status, attempts, claimed_by, last_error
            FROM tasks
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(TaskRecord::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VISIBILITY: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_fifo_claim_and_ack() {
        let queue = MemoryTaskQueue::default();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queue.submit("t", json!({"n": 1}), first).await.unwrap();
        queue.submit("t", json!({"n": 2}), second).await.unwrap();

        let claimed = queue.claim("w1", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.args, json!({"n": 1}));

        queue.ack(first).await.unwrap();
        let status = queue.status(first).await.unwrap().unwrap();
        assert_eq!(status.status, TaskStatus::Succeeded);
        assert_eq!(status.claimed_by.as_deref(), Some("w1"));

        let claimed = queue.claim("w1", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(claimed.id, second);
        assert!(queue.claim("w1", VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_ignored() {
        let queue = MemoryTaskQueue::default();
        let id = Uuid::new_v4();
        queue.submit("t", json!(1), id).await.unwrap();
        queue.submit("t", json!(2), id).await.unwrap();

        let claimed = queue.claim("w", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(claimed.args, json!(1));
        assert!(queue.claim("w", VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_after_visibility_timeout() {
        let queue = MemoryTaskQueue::new(2);
        let id = Uuid::new_v4();
        queue.submit("t", json!({}), id).await.unwrap();

        queue.claim("w1", VISIBILITY).await.unwrap().unwrap();
        assert!(queue.claim("w2", VISIBILITY).await.unwrap().is_none());

        tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
        let again = queue.claim("w2", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempt, 2);
        assert!(again.is_final_attempt());
        assert!(!again.is_exhausted());

        // final attempt expires: one settling delivery, flagged exhausted
        tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
        let settling = queue.claim("w3", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(settling.attempt, 3);
        assert!(settling.is_exhausted());

        // and if that one expires too, the task is failed
        tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
        assert!(queue.claim("w4", VISIBILITY).await.unwrap().is_none());
        assert_eq!(
            queue.status(id).await.unwrap().unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_release_does_not_count_attempt() {
        let queue = MemoryTaskQueue::new(1);
        let id = Uuid::new_v4();
        queue.submit("t", json!({}), id).await.unwrap();

        for _ in 0..3 {
            let claimed = queue.claim("w", VISIBILITY).await.unwrap().unwrap();
            assert_eq!(claimed.attempt, 1);
            queue.release(id).await.unwrap();
        }

        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(status.status, TaskStatus::Queued);
        assert_eq!(status.attempts, 0);
        assert!(matches!(
            queue.release(Uuid::new_v4()).await,
            Err(StoreError::TaskNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_keeps_task_hidden() {
        let queue = MemoryTaskQueue::default();
        let id = Uuid::new_v4();
        queue.submit("t", json!({}), id).await.unwrap();
        queue.claim("w1", VISIBILITY).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        queue.extend(id, VISIBILITY).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(queue.claim("w2", VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nack_requeues_until_exhausted() {
        let queue = MemoryTaskQueue::new(2);
        let id = Uuid::new_v4();
        queue.submit("t", json!({}), id).await.unwrap();

        queue.claim("w", VISIBILITY).await.unwrap().unwrap();
        queue.nack(id, "boom").await.unwrap();
        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(status.status, TaskStatus::Queued);
        assert_eq!(status.last_error.as_deref(), Some("boom"));

        queue.claim("w", VISIBILITY).await.unwrap().unwrap();
        queue.nack(id, "boom again").await.unwrap();
        assert_eq!(
            queue.status(id).await.unwrap().unwrap().status,
            TaskStatus::Failed
        );
        assert!(queue.claim("w", VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let queue = MemoryTaskQueue::default();
        let id = Uuid::new_v4();
        assert!(matches!(queue.ack(id).await, Err(StoreError::TaskNotFound(_))));
        assert!(queue.status(id).await.unwrap().is_none());
    }
}
