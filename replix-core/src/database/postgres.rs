use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use super::ports::JobRepository;
use crate::credentials::SealedCredential;
use crate::error::StoreError;
use crate::job::{Job, JobId, JobStatus, JobUpdate, StatusChange};

const JOB_COLUMNS: &str = r#"
    job_id,
    status,
    command,
    source_url_encrypted,
    target_url_encrypted,
    filter,
    options,
    created_at,
    started_at,
    completed_at,
    instance_id,
    worker_tier,
    log_group,
    log_stream,
    error,
    progress,
    expires_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobRepository {
    pool: PgPool,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_unexpired(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM replication_jobs WHERE job_id = $1 AND expires_at > $2"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.as_uuid())
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to load job {job_id}: {e}")))?;

        row.map(Job::try_from).transpose()
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO replication_jobs (
                job_id,
                status,
                command,
                source_url_encrypted,
                target_url_encrypted,
                filter,
                options,
                created_at,
                started_at,
                completed_at,
                instance_id,
                worker_tier,
                log_group,
                log_stream,
                error,
                progress,
                expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.job_id.as_uuid())
        .bind(job.status.as_str())
        .bind(&job.command)
        .bind(job.source_credential.as_str())
        .bind(job.target_credential.as_str())
        .bind(&job.filter)
        .bind(&job.options)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.instance_handle.as_deref())
        .bind(job.worker_tier.map(|tier| tier.as_str()))
        .bind(job.log_group.as_deref())
        .bind(job.log_stream.as_deref())
        .bind(job.error.as_deref())
        .bind(job.progress.as_ref())
        .bind(job.expires_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some("23505") =>
            {
                Err(StoreError::Conflict(job.job_id))
            }
            Err(e) => Err(StoreError::Backend(format!(
                "Failed to create job {}: {e}",
                job.job_id
            ))),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Job, StoreError> {
        self.fetch_unexpired(job_id, Utc::now())
            .await?
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn update_fields(
        &self,
        job_id: JobId,
        update: &JobUpdate,
    ) -> Result<Job, StoreError> {
        if update.is_empty() {
            return self.get(job_id).await;
        }

        let now = Utc::now();
        let allowed: Vec<String> = update
            .allowed_from()
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();

        let (status, error, completed_at) = match &update.status {
            Some(StatusChange::Running) => (Some(JobStatus::Running), None, None),
            Some(StatusChange::Completed { at }) => {
                (Some(JobStatus::Completed), None, Some(*at))
            }
            Some(StatusChange::Failed { error, at }) => {
                (Some(JobStatus::Failed), Some(error.as_str()), Some(*at))
            }
            None => (None, None, None),
        };
        let launch = update.launch.as_ref();

        // Status and error are written in the same statement; the status and
        // instance guards make the check-and-set atomic.
        let sql = format!(
            r#"
            UPDATE replication_jobs SET
                status = COALESCE($2, status),
                error = COALESCE($3, error),
                completed_at = COALESCE($4, completed_at),
                instance_id = COALESCE($5, instance_id),
                worker_tier = COALESCE($6, worker_tier),
                log_group = COALESCE($7, log_group),
                log_stream = COALESCE($8, log_stream),
                started_at = COALESCE($9, started_at),
                progress = COALESCE($10, progress)
            WHERE job_id = $1
              AND status = ANY($11)
              AND expires_at > $12
              AND ($5::text IS NULL OR instance_id IS NULL)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.as_uuid())
            .bind(status.map(|s| s.as_str()))
            .bind(error)
            .bind(completed_at)
            .bind(launch.map(|l| l.instance_handle.as_str()))
            .bind(launch.map(|l| l.worker_tier.as_str()))
            .bind(launch.map(|l| l.log_group.as_str()))
            .bind(launch.map(|l| l.log_stream.as_str()))
            .bind(launch.map(|l| l.started_at))
            .bind(update.progress.as_ref())
            .bind(&allowed)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                StoreError::Backend(format!("Failed to update job {job_id}: {e}"))
            })?;

        if let Some(row) = row {
            return Job::try_from(row);
        }

        // Nothing matched: work out why from the current record.
        let mut current = self
            .fetch_unexpired(job_id, now)
            .await?
            .ok_or(StoreError::NotFound(job_id))?;
        current.apply(update)?;
        warn!(%job_id, "job changed concurrently with update");
        Err(StoreError::Backend(format!(
            "job {job_id} changed concurrently"
        )))
    }

    async fn count_active(&self) -> Result<u64, StoreError> {
        let active: Vec<String> = JobStatus::ACTIVE
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM replication_jobs
            WHERE status = ANY($1)
              AND expires_at > $2
            "#,
        )
        .bind(&active)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("Failed to count active jobs: {e}")))?;

        Ok(count.max(0) as u64)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    status: String,
    command: String,
    source_url_encrypted: String,
    target_url_encrypted: String,
    filter: Value,
    options: Value,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    instance_id: Option<String>,
    worker_tier: Option<String>,
    log_group: Option<String>,
    log_stream: Option<String>,
    error: Option<String>,
    progress: Option<Value>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e| StoreError::Backend(format!("job {}: {e}", row.job_id)))?;
        let worker_tier = row
            .worker_tier
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|e| StoreError::Backend(format!("job {}: {e}", row.job_id)))?;

        Ok(Job {
            job_id: JobId::from_uuid(row.job_id),
            status,
            command: row.command,
            source_credential: SealedCredential::from_token(row.source_url_encrypted),
            target_credential: SealedCredential::from_token(row.target_url_encrypted),
            filter: row.filter,
            options: row.options,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            instance_handle: row.instance_id,
            worker_tier,
            log_group: row.log_group,
            log_stream: row.log_stream,
            error: row.error,
            progress: row.progress,
            expires_at: row.expires_at,
        })
    }
}
