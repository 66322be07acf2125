//! Job State Store Adapter
//!
//! Narrow interface over the keyed store for everything the gateway and the
//! worker need to persist about a job:
//! - `job:<id>`: the whole [`Job`] aggregate as one JSON document
//! - `lease:job:<id>`: the worker currently allowed to write the record
//! - `cancel:job:<id>`: cancellation requested by a client

use docprobe_core::domain::job::Job;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::kv::KeyedStore;

/// Default retention of job records (5 days)
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(5 * 24 * 60 * 60);

const JOB_PREFIX: &str = "job:";

fn job_key(id: Uuid) -> String {
    format!("{}{}", JOB_PREFIX, id)
}

fn lease_key(id: Uuid) -> String {
    format!("lease:job:{}", id)
}

fn cancel_key(id: Uuid) -> String {
    format!("cancel:job:{}", id)
}

#[derive(Clone)]
pub struct JobStore {
    kv: Arc<dyn KeyedStore>,
    job_ttl: Duration,
}

impl JobStore {
    pub fn new(kv: Arc<dyn KeyedStore>) -> Self {
        Self {
            kv,
            job_ttl: DEFAULT_JOB_TTL,
        }
    }

    pub fn with_ttl(mut self, job_ttl: Duration) -> Self {
        self.job_ttl = job_ttl;
        self
    }

    /// Stores a new job; fails if the id is already taken
    pub async fn create(&self, job: &Job) -> Result<()> {
        let value = serde_json::to_value(job)?;
        let created = self
            .kv
            .set_if_absent(&job_key(job.id), value, Some(self.job_ttl))
            .await?;

        if !created {
            return Err(StoreError::JobExists(job.id));
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        match self.kv.get(&job_key(id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Overwrites the stored job, refreshing its TTL
    pub async fn put(&self, job: &Job) -> Result<()> {
        let value = serde_json::to_value(job)?;
        self.kv
            .put(&job_key(job.id), value, Some(self.job_ttl))
            .await
    }

    /// Read-modify-write of a job record
    ///
    /// Only the lease holder mutates a job after creation, so the read and
    /// the write do not need to be atomic with respect to each other.
    ///
    /// # Returns
    /// The job as written
    pub async fn update<F>(&self, id: Uuid, mutate: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) + Send,
    {
        let mut job = self.get(id).await?.ok_or(StoreError::JobNotFound(id))?;
        mutate(&mut job);
        job.recount();
        job.touch();
        self.put(&job).await?;
        Ok(job)
    }

    /// Lists jobs, newest first
    ///
    /// # Arguments
    /// * `user_id` - Only return jobs owned by this user, if given
    pub async fn list(&self, user_id: Option<&str>) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for (key, value) in self.kv.list(JOB_PREFIX).await? {
            match serde_json::from_value::<Job>(value) {
                Ok(job) => {
                    if user_id.is_none_or(|user| job.params.user_id == user) {
                        jobs.push(job);
                    }
                }
                Err(e) => debug!("Skipping unreadable job record {}: {}", key, e),
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    // =========================================================================
    // Lease
    // =========================================================================

    /// Takes the job lease for `owner` if nobody holds it
    ///
    /// Re-acquiring a lease already held by `owner` succeeds and refreshes it.
    pub async fn acquire_lease(&self, id: Uuid, owner: &str, ttl: Duration) -> Result<bool> {
        let key = lease_key(id);
        let owner = Value::from(owner);
        if self.kv.set_if_absent(&key, owner.clone(), Some(ttl)).await? {
            return Ok(true);
        }
        self.kv
            .compare_and_put(&key, &owner, owner.clone(), Some(ttl))
            .await
    }

    /// Extends the lease; `false` means it was lost to another owner or expired
    pub async fn renew_lease(&self, id: Uuid, owner: &str, ttl: Duration) -> Result<bool> {
        let owner = Value::from(owner);
        self.kv
            .compare_and_put(&lease_key(id), &owner, owner.clone(), Some(ttl))
            .await
    }

    pub async fn release_lease(&self, id: Uuid, owner: &str) -> Result<bool> {
        self.kv
            .compare_and_delete(&lease_key(id), &Value::from(owner))
            .await
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    pub async fn request_cancel(&self, id: Uuid) -> Result<()> {
        self.kv
            .put(&cancel_key(id), Value::Bool(true), Some(self.job_ttl))
            .await
    }

    pub async fn cancel_requested(&self, id: Uuid) -> Result<bool> {
        Ok(self.kv.get(&cancel_key(id)).await?.is_some())
    }

    pub async fn clear_cancel(&self, id: Uuid) -> Result<()> {
        self.kv.delete(&cancel_key(id)).await?;
        Ok(())
    }
}
