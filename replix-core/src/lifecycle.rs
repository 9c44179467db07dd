//! Job lifecycle: submission, status and worker reports.

use std::fmt;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::admission::{AdmissionController, AdmissionDecision};
use crate::credentials::CredentialVault;
use crate::credentials::redact::redact;
use crate::database::ports::JobRepository;
use crate::error::{ProvisioningError, QueueError, StoreError, ValidationError, VaultError};
use crate::job::submission::JobSubmission;
use crate::job::{
    DEFAULT_RETENTION_DAYS, Job, JobId, JobStatus, JobStatusView, JobUpdate, NewJob,
    StatusChange,
};
use crate::metrics::{AdmissionPath, ProvisioningMetrics};
use crate::provisioning::ProvisioningEngine;
use crate::queue::{ProvisioningMessage, ProvisioningQueue};

/// How a submission gets its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Admission and provisioning run before the submission returns.
    #[default]
    Inline,
    /// A provisioning message is published and the queue consumer does the rest.
    Queued,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Inline => "inline",
            DispatchMode::Queued => "queued",
        }
    }
}

impl std::str::FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" | "direct" | "sync" => Ok(DispatchMode::Inline),
            "queued" | "queue" | "async" => Ok(DispatchMode::Queued),
            other => Err(format!("unknown provisioning mode `{other}` (expected inline or queued)")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to seal credentials: {0}")]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to enqueue provisioning request: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
}

impl SubmitError {
    /// Refused because the concurrency ceiling was reached.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            SubmitError::Provisioning(ProvisioningError::CapacityExhausted { .. })
        )
    }
}

/// Response to an accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// What a worker reports about its own job.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReport {
    Started,
    Progress(Value),
    Completed { progress: Option<Value> },
    Failed { error: String },
}

impl WorkerReport {
    fn into_update(self) -> JobUpdate {
        let now = Utc::now();
        match self {
            WorkerReport::Started => JobUpdate::status(StatusChange::Running),
            WorkerReport::Progress(progress) => JobUpdate::progress(progress),
            WorkerReport::Completed { progress } => JobUpdate {
                status: Some(StatusChange::Completed { at: now }),
                progress,
                ..JobUpdate::default()
            },
            WorkerReport::Failed { error } => {
                JobUpdate::status(StatusChange::failed(error, now))
            }
        }
    }
}

/// Decrypted connection strings, handed only to the job's worker.
pub struct WorkerCredentials {
    pub source_url: Zeroizing<String>,
    pub target_url: Zeroizing<String>,
}

impl fmt::Debug for WorkerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerCredentials")
            .field("source_url", &redact(&self.source_url))
            .field("target_url", &redact(&self.target_url))
            .finish()
    }
}

pub struct JobLifecycle {
    repository: Arc<dyn JobRepository>,
    vault: Arc<dyn CredentialVault>,
    admission: Arc<AdmissionController>,
    engine: Arc<ProvisioningEngine>,
    queue: Option<Arc<dyn ProvisioningQueue>>,
    metrics: Arc<dyn ProvisioningMetrics>,
    mode: DispatchMode,
    retention: Duration,
}

impl fmt::Debug for JobLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLifecycle")
            .field("mode", &self.mode)
            .field("retention", &self.retention)
            .field("admission", &self.admission)
            .field("has_queue", &self.queue.is_some())
            .finish_non_exhaustive()
    }
}

impl JobLifecycle {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        vault: Arc<dyn CredentialVault>,
        admission: Arc<AdmissionController>,
        engine: Arc<ProvisioningEngine>,
        metrics: Arc<dyn ProvisioningMetrics>,
    ) -> Self {
        Self {
            repository,
            vault,
            admission,
            engine,
            queue: None,
            metrics,
            mode: DispatchMode::Inline,
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }

    /// Switch to queued dispatch through `queue`.
    pub fn with_queue(mut self, queue: Arc<dyn ProvisioningQueue>) -> Self {
        self.queue = Some(queue);
        self.mode = DispatchMode::Queued;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Validate a raw request body and submit it.
    pub async fn submit_json(&self, body: &[u8]) -> Result<SubmitReceipt, SubmitError> {
        let submission = JobSubmission::from_json_bytes(body)?;
        self.submit(submission).await
    }

    /// Record a job and start provisioning it.
    ///
    /// Credentials are sealed before anything is written, so a vault failure
    /// leaves no record. Once the record exists every failure is reflected on
    /// it as `failed`.
    pub async fn submit(&self, submission: JobSubmission) -> Result<SubmitReceipt, SubmitError> {
        let job_id = JobId::new();
        let trace_id = Uuid::new_v4().simple().to_string();
        let span = info_span!("job.submit", %job_id, %trace_id, mode = self.mode.as_str());
        self.submit_inner(job_id, trace_id, submission)
            .instrument(span)
            .await
    }

    async fn submit_inner(
        &self,
        job_id: JobId,
        trace_id: String,
        submission: JobSubmission,
    ) -> Result<SubmitReceipt, SubmitError> {
        let JobSubmission {
            command,
            source_url,
            target_url,
            filter,
            options,
        } = submission;

        info!(
            source = %redact(&source_url),
            target = %redact(&target_url),
            "received replication job"
        );

        let source_credential = self.vault.encrypt(&source_url).await.map_err(|e| {
            error!(error = %e, "failed to seal source credential");
            e
        })?;
        let target_credential = self.vault.encrypt(&target_url).await.map_err(|e| {
            error!(error = %e, "failed to seal target credential");
            e
        })?;
        drop(source_url);
        drop(target_url);

        let job = Job::create(
            NewJob {
                job_id,
                command,
                source_credential,
                target_credential,
                filter,
                options,
            },
            Utc::now(),
            self.retention,
        );
        self.repository.create(&job).await?;
        self.metrics.job_submitted(self.mode.as_str());

        match (self.mode, &self.queue) {
            (DispatchMode::Queued, Some(queue)) => {
                self.dispatch_queued(queue.as_ref(), &job, trace_id).await?
            }
            _ => self.dispatch_inline(&job).await?,
        }

        Ok(SubmitReceipt {
            job_id,
            status: JobStatus::Provisioning,
        })
    }

    async fn dispatch_inline(&self, job: &Job) -> Result<(), SubmitError> {
        if let AdmissionDecision::Denied { active, ceiling } =
            self.admission.try_admit_recorded().await
        {
            self.metrics.admission_denied(AdmissionPath::Direct);
            let err = ProvisioningError::CapacityExhausted { active, ceiling };
            self.mark_failed(
                job.job_id,
                format!("Capacity limit reached: {ceiling} concurrent jobs"),
            )
            .await;
            return Err(err.into());
        }

        self.engine.provision(job.job_id, Some(&job.options)).await?;
        Ok(())
    }

    async fn dispatch_queued(
        &self,
        queue: &dyn ProvisioningQueue,
        job: &Job,
        trace_id: String,
    ) -> Result<(), SubmitError> {
        let message = ProvisioningMessage::new(job.job_id)
            .with_trace_id(trace_id)
            .with_options(job.options.clone());

        match queue.publish(&message).await {
            Ok(message_id) => {
                info!(%message_id, "provisioning request queued");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to queue provisioning request");
                self.mark_failed(job.job_id, "Failed to queue provisioning request")
                    .await;
                Err(e.into())
            }
        }
    }

    /// Client-facing status of a job.
    pub async fn status(&self, job_id: JobId) -> Result<JobStatusView, StoreError> {
        let job = self.repository.get(job_id).await?;
        Ok(JobStatusView::from(&job))
    }

    /// Apply a worker's report about its job.
    pub async fn apply_worker_report(
        &self,
        job_id: JobId,
        report: WorkerReport,
    ) -> Result<JobStatusView, StoreError> {
        let update = report.into_update();
        let job = self
            .repository
            .update_fields(job_id, &update)
            .await
            .map_err(|e| {
                warn!(%job_id, error = %e, "rejected worker report");
                e
            })?;
        info!(%job_id, status = %job.status, "worker report applied");
        Ok(JobStatusView::from(&job))
    }

    /// Decrypt the connection strings for the worker of an active job.
    pub async fn worker_credentials(
        &self,
        job_id: JobId,
    ) -> Result<WorkerCredentials, CredentialAccessError> {
        let job = self.repository.get(job_id).await?;
        if job.status.is_terminal() {
            return Err(CredentialAccessError::Inactive {
                job_id,
                status: job.status,
            });
        }
        Ok(WorkerCredentials {
            source_url: self.vault.decrypt(&job.source_credential).await?,
            target_url: self.vault.decrypt(&job.target_credential).await?,
        })
    }

    /// Mark a job failed, logging rather than returning any store error.
    pub async fn mark_failed(&self, job_id: JobId, reason: impl Into<String>) {
        let update = JobUpdate::status(StatusChange::failed(reason, Utc::now()));
        if let Err(e) = self.repository.update_fields(job_id, &update).await {
            error!(%job_id, error = %e, "failed to mark job failed");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialAccessError {
    #[error("job {job_id} is {status}; credentials are no longer available")]
    Inactive { job_id: JobId, status: JobStatus },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vault(#[from] VaultError),
}
