//! Worker provisioning.
//!
//! [`ProvisioningEngine::provision`] is the single path by which a job gets a
//! worker, used by both the direct submission path and the queue consumer. It
//! is idempotent: a job that already has an instance is returned as is, and a
//! job that is no longer provisioning is skipped.

pub mod http_backend;
pub mod launch;
pub mod retry;
pub mod sizing;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::database::ports::JobRepository;
use crate::error::{ProvisioningError, StoreError};
use crate::job::{JobId, JobStatus, JobUpdate, LaunchRecord, StatusChange};
use crate::metrics::ProvisioningMetrics;

pub use http_backend::{HttpComputeBackend, UnconfiguredBackend};
pub use launch::{ComputeBackend, LaunchError, LaunchErrorKind, LaunchSpec, WorkerTemplate};
pub use retry::RetryPolicy;
pub use sizing::{InstanceTypes, TierSelection, WorkerTier, select_tier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Launched {
        instance_handle: String,
        tier: WorkerTier,
    },
    AlreadyProvisioned {
        instance_handle: String,
    },
    /// The job left `provisioning` without an instance; nothing was launched.
    Skipped {
        status: JobStatus,
    },
}

impl ProvisionOutcome {
    pub fn instance_handle(&self) -> Option<&str> {
        match self {
            ProvisionOutcome::Launched {
                instance_handle, ..
            }
            | ProvisionOutcome::AlreadyProvisioned { instance_handle } => {
                Some(instance_handle)
            }
            ProvisionOutcome::Skipped { .. } => None,
        }
    }
}

pub struct ProvisioningEngine {
    repository: Arc<dyn JobRepository>,
    backend: Arc<dyn ComputeBackend>,
    template: WorkerTemplate,
    retry: RetryPolicy,
    metrics: Arc<dyn ProvisioningMetrics>,
}

impl fmt::Debug for ProvisioningEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningEngine")
            .field("template", &self.template)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ProvisioningEngine {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        backend: Arc<dyn ComputeBackend>,
        template: WorkerTemplate,
        retry: RetryPolicy,
        metrics: Arc<dyn ProvisioningMetrics>,
    ) -> Self {
        Self {
            repository,
            backend,
            template,
            retry,
            metrics,
        }
    }

    pub fn template(&self) -> &WorkerTemplate {
        &self.template
    }

    /// Launch a worker for `job_id` and record it on the job.
    ///
    /// `options` overrides the sizing hints stored with the job. On a
    /// definitive launch failure the job is marked `failed` before the error
    /// is returned.
    #[instrument(name = "provisioning.provision", skip(self, options), fields(%job_id), err)]
    pub async fn provision(
        &self,
        job_id: JobId,
        options: Option<&Value>,
    ) -> Result<ProvisionOutcome, ProvisioningError> {
        let job = match self.repository.get(job_id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => return Err(ProvisioningError::JobNotFound(job_id)),
            Err(e) => return Err(e.into()),
        };

        if let Some(instance_handle) = job.instance_handle {
            info!(%instance_handle, "job already has a worker");
            return Ok(ProvisionOutcome::AlreadyProvisioned { instance_handle });
        }
        if job.status != JobStatus::Provisioning {
            info!(status = %job.status, "job is no longer provisioning, skipping");
            return Ok(ProvisionOutcome::Skipped { status: job.status });
        }

        let selection = select_tier(options.or(Some(&job.options)), self.template.default_tier);
        let spec = LaunchSpec::build(job_id, selection.tier, &self.template);
        info!(
            tier = %selection.tier,
            tier_source = ?selection.source,
            instance_type = %spec.instance_type,
            "launching worker"
        );

        let started = Instant::now();
        let launched = self.retry.run(|_| self.backend.launch(&spec)).await;

        let instance_handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                self.metrics.provisioning_failed(&e.error_kind());
                self.mark_failed(job_id, format!("Provisioning failed: {e}"))
                    .await;
                return Err(e);
            }
        };

        let record = LaunchRecord {
            instance_handle: instance_handle.clone(),
            worker_tier: selection.tier,
            log_group: self.template.log_group.clone(),
            log_stream: instance_handle.clone(),
            started_at: Utc::now(),
        };
        match self.record_launch(job_id, &record).await {
            Ok(()) => {}
            Err(StoreError::AlreadyLaunched {
                instance_handle: existing,
                ..
            }) if existing != instance_handle => {
                // Another delivery won the race; our instance is untracked.
                warn!(
                    orphaned_instance = %instance_handle,
                    %existing,
                    "job was provisioned concurrently"
                );
                return Ok(ProvisionOutcome::AlreadyProvisioned {
                    instance_handle: existing,
                });
            }
            // A retried write that had already landed.
            Err(StoreError::AlreadyLaunched { .. }) => {}
            Err(e) => {
                error!(%instance_handle, error = %e, "failed to record launched worker");
                let err = ProvisioningError::Store(e);
                self.metrics.provisioning_failed(&err.error_kind());
                self.mark_failed(
                    job_id,
                    format!("Provisioning failed: orphaned instance {instance_handle}: {err}"),
                )
                .await;
                return Err(err);
            }
        }

        self.metrics.job_provisioned(selection.tier, started.elapsed());
        info!(
            %instance_handle,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "worker provisioned"
        );

        Ok(ProvisionOutcome::Launched {
            instance_handle,
            tier: selection.tier,
        })
    }

    /// Attach the launched instance to the job, trying the write twice.
    async fn record_launch(&self, job_id: JobId, record: &LaunchRecord) -> Result<(), StoreError> {
        let update = JobUpdate::launch(record.clone());
        match self.repository.update_fields(job_id, &update).await {
            Ok(_) => Ok(()),
            Err(StoreError::Backend(e)) => {
                warn!(instance_handle = %record.instance_handle, error = %e, "retrying launch record write");
                self.repository
                    .update_fields(job_id, &update)
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    async fn mark_failed(&self, job_id: JobId, reason: String) {
        let update = JobUpdate::status(StatusChange::failed(reason.as_str(), Utc::now()));
        match self.repository.update_fields(job_id, &update).await {
            Ok(_) => warn!(%job_id, %reason, "provisioning failed, job marked failed"),
            Err(e) => error!(
                %job_id,
                %reason,
                store_error = %e,
                "provisioning failed and the job could not be marked failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::launch::MockComputeBackend;
    use super::*;
    use crate::database::memory::InMemoryJobRepository;
    use crate::job::tests::sample_job;
    use crate::metrics::{MetricEvent, RecordingMetrics};

    struct Harness {
        repo: Arc<InMemoryJobRepository>,
        metrics: Arc<RecordingMetrics>,
        engine: ProvisioningEngine,
    }

    fn harness(backend: MockComputeBackend) -> Harness {
        let repo = Arc::new(InMemoryJobRepository::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let engine = ProvisioningEngine::new(
            repo.clone(),
            Arc::new(backend),
            WorkerTemplate::default(),
            RetryPolicy::new(3, Duration::from_secs(2)),
            metrics.clone(),
        );
        Harness {
            repo,
            metrics,
            engine,
        }
    }

    #[tokio::test]
    async fn records_launch_on_success() {
        let mut backend = MockComputeBackend::new();
        backend
            .expect_launch()
            .times(1)
            .withf(|spec| spec.tier == WorkerTier::Medium && spec.instance_type == "c5.large")
            .returning(|_| Ok("i-0123".to_string()));
        let h = harness(backend);
        let job = sample_job();
        h.repo.create(&job).await.unwrap();

        let options = json!({"estimated_size_bytes": 20u64 * sizing::GIB});
        let outcome = h.engine.provision(job.job_id, Some(&options)).await.unwrap();
        assert_eq!(
            outcome,
            ProvisionOutcome::Launched {
                instance_handle: "i-0123".into(),
                tier: WorkerTier::Medium
            }
        );

        let stored = h.repo.get(job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Provisioning);
        assert_eq!(stored.instance_handle.as_deref(), Some("i-0123"));
        assert_eq!(stored.log_stream.as_deref(), Some("i-0123"));
        assert_eq!(stored.worker_tier, Some(WorkerTier::Medium));
        assert!(stored.started_at.is_some());
        assert_eq!(
            h.metrics.events(),
            vec![MetricEvent::Provisioned(WorkerTier::Medium)]
        );
    }

    #[tokio::test]
    async fn second_call_does_not_launch_again() {
        let mut backend = MockComputeBackend::new();
        backend
            .expect_launch()
            .times(1)
            .returning(|_| Ok("i-0123".to_string()));
        let h = harness(backend);
        let job = sample_job();
        h.repo.create(&job).await.unwrap();

        h.engine.provision(job.job_id, None).await.unwrap();
        let again = h.engine.provision(job.job_id, None).await.unwrap();
        assert_eq!(
            again,
            ProvisionOutcome::AlreadyProvisioned {
                instance_handle: "i-0123".into()
            }
        );
    }

    #[tokio::test]
    async fn permanent_error_marks_job_failed_without_retry() {
        let mut backend = MockComputeBackend::new();
        backend.expect_launch().times(1).returning(|_| {
            Err(LaunchError::new(
                LaunchErrorKind::Other("InvalidAMIID.NotFound".into()),
                "image does not exist",
            ))
        });
        let h = harness(backend);
        let job = sample_job();
        h.repo.create(&job).await.unwrap();

        let err = h.engine.provision(job.job_id, None).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Permanent(_)));

        let stored = h.repo.get(job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        let reason = stored.error.unwrap();
        assert!(reason.starts_with("Provisioning failed"), "{reason}");
        assert_eq!(
            h.metrics.events(),
            vec![MetricEvent::Failed("InvalidAMIID.NotFound".into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_exhaust_attempts() {
        let mut backend = MockComputeBackend::new();
        backend.expect_launch().times(3).returning(|_| {
            Err(LaunchError::new(
                LaunchErrorKind::InsufficientInstanceCapacity,
                "no capacity",
            ))
        });
        let h = harness(backend);
        let job = sample_job();
        h.repo.create(&job).await.unwrap();

        let err = h.engine.provision(job.job_id, None).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Transient { attempts: 3, .. }));
        assert_eq!(
            h.repo.get(job.job_id).await.unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn terminal_job_is_skipped() {
        let mut backend = MockComputeBackend::new();
        backend.expect_launch().never();
        let h = harness(backend);
        let job = sample_job();
        h.repo.create(&job).await.unwrap();
        h.repo
            .update_fields(
                job.job_id,
                &JobUpdate::status(StatusChange::failed("cancelled", Utc::now())),
            )
            .await
            .unwrap();

        let outcome = h.engine.provision(job.job_id, None).await.unwrap();
        assert_eq!(
            outcome,
            ProvisionOutcome::Skipped {
                status: JobStatus::Failed
            }
        );
    }

    /// Fails the first `failures` launch writes and can record a rival
    /// instance just before the first one.
    struct FaultyLaunchWrites {
        inner: InMemoryJobRepository,
        failures: AtomicUsize,
        rival: Mutex<Option<&'static str>>,
    }

    impl FaultyLaunchWrites {
        fn new(failures: usize) -> Self {
            Self {
                inner: InMemoryJobRepository::new(),
                failures: AtomicUsize::new(failures),
                rival: Mutex::new(None),
            }
        }

        fn with_rival(self, handle: &'static str) -> Self {
            *self.rival.lock().unwrap() = Some(handle);
            self
        }
    }

    #[async_trait::async_trait]
    impl JobRepository for FaultyLaunchWrites {
        async fn create(&self, job: &crate::job::Job) -> Result<(), StoreError> {
            self.inner.create(job).await
        }

        async fn get(&self, job_id: JobId) -> Result<crate::job::Job, StoreError> {
            self.inner.get(job_id).await
        }

        async fn update_fields(
            &self,
            job_id: JobId,
            update: &JobUpdate,
        ) -> Result<crate::job::Job, StoreError> {
            if let Some(launch) = &update.launch {
                let rival = self.rival.lock().unwrap().take();
                if let Some(handle) = rival {
                    let record = LaunchRecord {
                        instance_handle: handle.to_string(),
                        log_stream: handle.to_string(),
                        ..launch.clone()
                    };
                    self.inner
                        .update_fields(job_id, &JobUpdate::launch(record))
                        .await?;
                }
                let remaining = self.failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures.store(remaining - 1, Ordering::SeqCst);
                    return Err(StoreError::Backend("connection reset".into()));
                }
            }
            self.inner.update_fields(job_id, update).await
        }

        async fn count_active(&self) -> Result<u64, StoreError> {
            self.inner.count_active().await
        }
    }

    fn engine_over(repo: Arc<FaultyLaunchWrites>, backend: MockComputeBackend) -> ProvisioningEngine {
        ProvisioningEngine::new(
            repo,
            Arc::new(backend),
            WorkerTemplate::default(),
            RetryPolicy::new(3, Duration::from_secs(2)),
            Arc::new(RecordingMetrics::new()),
        )
    }

    #[tokio::test]
    async fn launch_record_write_is_retried_once() {
        let mut backend = MockComputeBackend::new();
        backend
            .expect_launch()
            .times(1)
            .returning(|_| Ok("i-0123".to_string()));
        let repo = Arc::new(FaultyLaunchWrites::new(1));
        let engine = engine_over(repo.clone(), backend);
        let job = sample_job();
        repo.create(&job).await.unwrap();

        let outcome = engine.provision(job.job_id, None).await.unwrap();
        assert_eq!(outcome.instance_handle(), Some("i-0123"));
        let stored = repo.get(job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Provisioning);
        assert_eq!(stored.instance_handle.as_deref(), Some("i-0123"));
    }

    #[tokio::test]
    async fn unrecordable_launch_fails_the_job_and_is_not_relaunched() {
        let mut backend = MockComputeBackend::new();
        backend
            .expect_launch()
            .times(1)
            .returning(|_| Ok("i-0123".to_string()));
        let repo = Arc::new(FaultyLaunchWrites::new(2));
        let engine = engine_over(repo.clone(), backend);
        let job = sample_job();
        repo.create(&job).await.unwrap();

        let err = engine.provision(job.job_id, None).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Store(_)));

        let stored = repo.get(job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.instance_handle.is_none());
        let reason = stored.error.unwrap();
        assert!(reason.contains("orphaned instance i-0123"), "{reason}");

        // A redelivery finds the job terminal and launches nothing.
        let again = engine.provision(job.job_id, None).await.unwrap();
        assert_eq!(
            again,
            ProvisionOutcome::Skipped {
                status: JobStatus::Failed
            }
        );
    }

    #[tokio::test]
    async fn concurrent_launch_keeps_the_first_instance() {
        let mut backend = MockComputeBackend::new();
        backend
            .expect_launch()
            .times(1)
            .returning(|_| Ok("i-late".to_string()));
        let repo = Arc::new(FaultyLaunchWrites::new(0).with_rival("i-first"));
        let engine = engine_over(repo.clone(), backend);
        let job = sample_job();
        repo.create(&job).await.unwrap();

        let outcome = engine.provision(job.job_id, None).await.unwrap();
        assert_eq!(
            outcome,
            ProvisionOutcome::AlreadyProvisioned {
                instance_handle: "i-first".into()
            }
        );
        let stored = repo.get(job.job_id).await.unwrap();
        assert_eq!(stored.instance_handle.as_deref(), Some("i-first"));
        assert_eq!(stored.status, JobStatus::Provisioning);
    }

    #[tokio::test]
    async fn unknown_job_is_reported() {
        let mut backend = MockComputeBackend::new();
        backend.expect_launch().never();
        let h = harness(backend);

        let err = h.engine.provision(JobId::new(), None).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::JobNotFound(_)));
    }
}
