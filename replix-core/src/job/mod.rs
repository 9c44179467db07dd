//! Job records and the status state machine.
//!
//! A job is created in [`JobStatus::Provisioning`] and only ever moves
//! forward:
//!
//! ```text
//! provisioning ──► running ──► completed
//!      │              │
//!      └──► failed ◄──┘
//! ```
//!
//! Recording a worker instance is not a status change; it is only accepted
//! while the job is still provisioning. `completed` and `failed` are final.

pub mod submission;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::credentials::SealedCredential;
use crate::error::StoreError;
use crate::provisioning::sizing::WorkerTier;

/// Default retention for job records.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

const FALLBACK_FAILURE_REASON: &str = "Job failed";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Provisioning,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Provisioning, JobStatus::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Provisioning => "provisioning",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Active jobs count against the concurrency ceiling.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Provisioning, JobStatus::Running)
                | (JobStatus::Provisioning, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    /// Statuses from which `self` may be entered.
    pub fn predecessors(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Provisioning => &[],
            JobStatus::Running => &[JobStatus::Provisioning],
            JobStatus::Completed => &[JobStatus::Running],
            JobStatus::Failed => &[JobStatus::Provisioning, JobStatus::Running],
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(JobStatus::Provisioning),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A persisted replication job. Connection strings are only ever held sealed.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: JobId,
    pub status: JobStatus,
    pub command: String,
    pub source_credential: SealedCredential,
    pub target_credential: SealedCredential,
    pub filter: Value,
    pub options: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub instance_handle: Option<String>,
    pub worker_tier: Option<WorkerTier>,
    pub log_group: Option<String>,
    pub log_stream: Option<String>,
    pub error: Option<String>,
    pub progress: Option<Value>,
    pub expires_at: DateTime<Utc>,
}

/// Fields of a job that exist before anything has happened to it.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: JobId,
    pub command: String,
    pub source_credential: SealedCredential,
    pub target_credential: SealedCredential,
    pub filter: Value,
    pub options: Value,
}

impl Job {
    pub fn create(new: NewJob, now: DateTime<Utc>, retention: Duration) -> Self {
        Self {
            job_id: new.job_id,
            status: JobStatus::Provisioning,
            command: new.command,
            source_credential: new.source_credential,
            target_credential: new.target_credential,
            filter: new.filter,
            options: new.options,
            created_at: now,
            started_at: None,
            completed_at: None,
            instance_handle: None,
            worker_tier: None,
            log_group: None,
            log_stream: None,
            error: None,
            progress: None,
            expires_at: now + retention,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Validates `update` against the current state and applies it. On error
    /// the job is left untouched.
    pub fn apply(&mut self, update: &JobUpdate) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(match &update.status {
                Some(change) => StoreError::InvalidTransition {
                    job_id: self.job_id,
                    from: self.status,
                    to: change.target(),
                },
                None => StoreError::Finalized {
                    job_id: self.job_id,
                    status: self.status,
                },
            });
        }

        if update.launch.is_some() && self.status != JobStatus::Provisioning {
            return Err(StoreError::NotProvisioning {
                job_id: self.job_id,
                status: self.status,
            });
        }

        if let (Some(_), Some(existing)) = (&update.launch, &self.instance_handle) {
            return Err(StoreError::AlreadyLaunched {
                job_id: self.job_id,
                instance_handle: existing.clone(),
            });
        }

        if let Some(change) = &update.status {
            let to = change.target();
            if !self.status.can_transition_to(to) {
                return Err(StoreError::InvalidTransition {
                    job_id: self.job_id,
                    from: self.status,
                    to,
                });
            }
        }

        if let Some(launch) = &update.launch {
            self.instance_handle = Some(launch.instance_handle.clone());
            self.worker_tier = Some(launch.worker_tier);
            self.log_group = Some(launch.log_group.clone());
            self.log_stream = Some(launch.log_stream.clone());
            self.started_at = Some(launch.started_at);
        }

        if let Some(progress) = &update.progress {
            self.progress = Some(progress.clone());
        }

        if let Some(change) = &update.status {
            self.status = change.target();
            match change {
                StatusChange::Running => {}
                StatusChange::Completed { at } => {
                    self.completed_at = Some(*at);
                }
                StatusChange::Failed { error, at } => {
                    self.error = Some(error.clone());
                    self.completed_at = Some(*at);
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusChange {
    Running,
    Completed { at: DateTime<Utc> },
    Failed { error: String, at: DateTime<Utc> },
}

impl StatusChange {
    /// Builds a failure transition. A blank reason is replaced so that a failed
    /// job always carries an error.
    pub fn failed(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        let error = error.into();
        let error = if error.trim().is_empty() {
            FALLBACK_FAILURE_REASON.to_string()
        } else {
            error
        };
        StatusChange::Failed { error, at }
    }

    pub fn target(&self) -> JobStatus {
        match self {
            StatusChange::Running => JobStatus::Running,
            StatusChange::Completed { .. } => JobStatus::Completed,
            StatusChange::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// Where a launched worker runs and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub instance_handle: String,
    pub worker_tier: WorkerTier,
    pub log_group: String,
    pub log_stream: String,
    pub started_at: DateTime<Utc>,
}

/// Partial update applied atomically by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<StatusChange>,
    pub launch: Option<LaunchRecord>,
    pub progress: Option<Value>,
}

impl JobUpdate {
    pub fn status(change: StatusChange) -> Self {
        Self {
            status: Some(change),
            ..Self::default()
        }
    }

    pub fn launch(record: LaunchRecord) -> Self {
        Self {
            launch: Some(record),
            ..Self::default()
        }
    }

    pub fn progress(progress: Value) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: Value) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.launch.is_none() && self.progress.is_none()
    }

    /// Statuses in which the job must currently be for the update to apply.
    pub fn allowed_from(&self) -> Vec<JobStatus> {
        let mut allowed = JobStatus::ACTIVE.to_vec();
        if let Some(change) = &self.status {
            let preds = change.target().predecessors();
            allowed.retain(|s| preds.contains(s));
        }
        if self.launch.is_some() {
            allowed.retain(|s| *s == JobStatus::Provisioning);
        }
        allowed
    }
}

/// Client-facing rendering of a job. Never carries credential material.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub command: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_tier: Option<WorkerTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_stream: Option<String>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            command: job.command.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error: job.error.clone(),
            progress: job.progress.clone(),
            instance_id: job.instance_handle.clone(),
            worker_tier: job.worker_tier,
            log_group: job.log_group.clone(),
            log_stream: job.log_stream.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_job() -> Job {
        Job::create(
            NewJob {
                job_id: JobId::new(),
                command: "replicate".into(),
                source_credential: SealedCredential::from_token("v1:source"),
                target_credential: SealedCredential::from_token("v1:target"),
                filter: json!({}),
                options: json!({}),
            },
            Utc::now(),
            Duration::days(DEFAULT_RETENTION_DAYS),
        )
    }

    fn launch_record() -> LaunchRecord {
        LaunchRecord {
            instance_handle: "i-0abc".into(),
            worker_tier: WorkerTier::Small,
            log_group: "/replix/workers".into(),
            log_stream: "i-0abc".into(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn nothing_leaves_a_terminal_state() {
        let all = [
            JobStatus::Provisioning,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ];
        for from in [JobStatus::Completed, JobStatus::Failed] {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Provisioning));
        assert!(!JobStatus::Provisioning.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn predecessors_agree_with_transitions() {
        let all = [
            JobStatus::Provisioning,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ];
        for to in all {
            for from in all {
                assert_eq!(
                    to.predecessors().contains(&from),
                    from.can_transition_to(to)
                );
            }
        }
    }

    #[test]
    fn failure_sets_error_and_completion_time() {
        let mut job = sample_job();
        let at = Utc::now();
        job.apply(&JobUpdate::status(StatusChange::failed("boom", at)))
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert_eq!(job.completed_at, Some(at));
    }

    #[test]
    fn blank_failure_reason_is_replaced() {
        let mut job = sample_job();
        job.apply(&JobUpdate::status(StatusChange::failed("  ", Utc::now())))
            .unwrap();
        assert_eq!(job.error.as_deref(), Some(FALLBACK_FAILURE_REASON));
    }

    #[test]
    fn completed_job_rejects_every_update() {
        let mut job = sample_job();
        job.apply(&JobUpdate::status(StatusChange::Running)).unwrap();
        job.apply(&JobUpdate::status(StatusChange::Completed { at: Utc::now() }))
            .unwrap();
        let before = job.clone();

        let err = job
            .apply(&JobUpdate::status(StatusChange::failed("late", Utc::now())))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let err = job.apply(&JobUpdate::progress(json!({"rows": 1}))).unwrap_err();
        assert!(matches!(err, StoreError::Finalized { .. }));

        assert_eq!(job, before);
        assert!(job.error.is_none());
    }

    #[test]
    fn instance_handle_only_recorded_while_provisioning() {
        let mut job = sample_job();
        job.apply(&JobUpdate::launch(launch_record())).unwrap();
        assert_eq!(job.status, JobStatus::Provisioning);
        assert_eq!(job.instance_handle.as_deref(), Some("i-0abc"));
        assert!(job.started_at.is_some());

        job.apply(&JobUpdate::status(StatusChange::Running)).unwrap();
        let err = job.apply(&JobUpdate::launch(launch_record())).unwrap_err();
        assert!(matches!(err, StoreError::NotProvisioning { .. }));
    }

    #[test]
    fn second_launch_is_rejected_and_keeps_the_first_handle() {
        let mut job = sample_job();
        job.apply(&JobUpdate::launch(launch_record())).unwrap();

        let rival = LaunchRecord {
            instance_handle: "i-rival".into(),
            ..launch_record()
        };
        let err = job.apply(&JobUpdate::launch(rival)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::AlreadyLaunched { ref instance_handle, .. } if instance_handle == "i-0abc"
        ));
        assert_eq!(job.instance_handle.as_deref(), Some("i-0abc"));
        assert_eq!(job.log_stream.as_deref(), Some("i-0abc"));
    }

    #[test]
    fn allowed_from_intersects_constraints() {
        let update = JobUpdate::status(StatusChange::failed("x", Utc::now()));
        assert_eq!(
            update.allowed_from(),
            vec![JobStatus::Provisioning, JobStatus::Running]
        );

        let update = JobUpdate::launch(launch_record()).with_progress(json!({}));
        assert_eq!(update.allowed_from(), vec![JobStatus::Provisioning]);

        let update = JobUpdate {
            status: Some(StatusChange::Completed { at: Utc::now() }),
            launch: Some(launch_record()),
            progress: None,
        };
        assert!(update.allowed_from().is_empty());
    }

    #[test]
    fn status_view_omits_credentials() {
        let job = sample_job();
        let rendered =
            serde_json::to_value(JobStatusView::from(&job)).unwrap();
        let object = rendered.as_object().unwrap();

        assert_eq!(object["status"], "provisioning");
        assert!(object["started_at"].is_null());
        assert!(object["error"].is_null());
        assert!(!object.contains_key("instance_id"));
        for key in object.keys() {
            assert!(!key.contains("url"), "unexpected field {key}");
            assert!(!key.contains("credential"), "unexpected field {key}");
        }
    }
}
