use async_trait::async_trait;

use crate::error::StoreError;
use crate::job::{Job, JobId, JobUpdate};

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new record. Fails with [`StoreError::Conflict`] when the id is
    /// already taken.
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    /// Fetch a record. Expired records are reported as
    /// [`StoreError::NotFound`].
    async fn get(&self, job_id: JobId) -> Result<Job, StoreError>;

    /// Apply a partial update atomically and return the updated record.
    /// Implementations must reject updates the current status does not allow
    /// (see [`Job::apply`]) without writing anything.
    async fn update_fields(
        &self,
        job_id: JobId,
        update: &JobUpdate,
    ) -> Result<Job, StoreError>;

    /// Number of unexpired jobs that are provisioning or running.
    async fn count_active(&self) -> Result<u64, StoreError>;
}
