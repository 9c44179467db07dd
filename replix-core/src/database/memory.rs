use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::ports::JobRepository;
use crate::error::StoreError;
use crate::job::{Job, JobId, JobUpdate};

/// Process-local job store for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
    count_unavailable: AtomicBool,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `count_active` fail, as an unreachable backend would.
    pub fn set_count_unavailable(&self, unavailable: bool) {
        self.count_unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Every stored record, expired or not.
    pub async fn snapshot(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.job_id) {
            return Err(StoreError::Conflict(job.job_id));
        }
        jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Job, StoreError> {
        let jobs = self.jobs.read().await;
        match jobs.get(&job_id) {
            Some(job) if !job.is_expired(Utc::now()) => Ok(job.clone()),
            _ => Err(StoreError::NotFound(job_id)),
        }
    }

    async fn update_fields(
        &self,
        job_id: JobId,
        update: &JobUpdate,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .filter(|job| !job.is_expired(Utc::now()))
            .ok_or(StoreError::NotFound(job_id))?;
        job.apply(update)?;
        Ok(job.clone())
    }

    async fn count_active(&self) -> Result<u64, StoreError> {
        if self.count_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("job store unavailable".into()));
        }
        let now = Utc::now();
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|job| job.status.is_active() && !job.is_expired(now))
            .count() as u64)
    }
}
