use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::{Delivery, ProvisioningQueue, ReleaseOutcome};
use crate::admission::{AdmissionController, AdmissionDecision};
use crate::database::ports::JobRepository;
use crate::error::{QueueError, StoreError};
use crate::job::{JobStatus, JobUpdate, StatusChange};
use crate::metrics::{AdmissionPath, ProvisioningMetrics};
use crate::provisioning::{ProvisionOutcome, ProvisioningEngine};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Counts for one drained batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub provisioned: usize,
    pub skipped: usize,
    pub released: usize,
    pub dead_lettered: usize,
}

enum Disposition {
    Provisioned,
    Skipped,
    /// Try again later; `reason` is recorded on the job if the message runs
    /// out of deliveries.
    Release { reason: String },
    DeadLetter,
}

pub struct QueueConsumer {
    queue: Arc<dyn ProvisioningQueue>,
    repository: Arc<dyn JobRepository>,
    admission: Arc<AdmissionController>,
    engine: Arc<ProvisioningEngine>,
    metrics: Arc<dyn ProvisioningMetrics>,
    batch_size: usize,
    poll_interval: Duration,
}

impl fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("batch_size", &self.batch_size)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn ProvisioningQueue>,
        repository: Arc<dyn JobRepository>,
        admission: Arc<AdmissionController>,
        engine: Arc<ProvisioningEngine>,
        metrics: Arc<dyn ProvisioningMetrics>,
    ) -> Self {
        Self {
            queue,
            repository,
            admission,
            engine,
            metrics,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Poll until `shutdown` is cancelled. Cancellation is observed between
    /// batches; a batch in progress always finishes.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "queue consumer started"
        );

        while !shutdown.is_cancelled() {
            let idle = match self.process_batch().await {
                Ok(report) => {
                    if report.received > 0 {
                        info!(?report, "processed provisioning batch");
                    }
                    report.received == 0
                }
                Err(e) => {
                    error!(error = %e, "failed to receive provisioning messages");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!("queue consumer stopped");
    }

    /// Receive one batch and handle each message in turn. A failure on one
    /// message only affects that message.
    pub async fn process_batch(&self) -> Result<BatchReport, QueueError> {
        let deliveries = self.queue.receive(self.batch_size).await?;
        let mut report = BatchReport {
            received: deliveries.len(),
            ..BatchReport::default()
        };

        for delivery in deliveries {
            let span = info_span!(
                "queue.message",
                message_id = %delivery.message_id,
                receive_count = delivery.receive_count,
                job_id = tracing::field::Empty,
                trace_id = tracing::field::Empty,
            );
            let disposition = self.handle(&delivery).instrument(span.clone()).await;
            self.settle(&delivery, disposition, &mut report)
                .instrument(span)
                .await;
        }

        Ok(report)
    }

    async fn handle(&self, delivery: &Delivery) -> Disposition {
        let message = match delivery.decode() {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "undecodable provisioning message");
                return Disposition::DeadLetter;
            }
        };

        let span = tracing::Span::current();
        span.record("job_id", tracing::field::display(message.job_id));
        if let Some(trace_id) = &message.trace_id {
            span.record("trace_id", trace_id.as_str());
        }

        let job = match self.repository.get(message.job_id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                warn!("job not found or expired, dropping message");
                return Disposition::Skipped;
            }
            Err(e) => {
                error!(error = %e, "failed to load job");
                return Disposition::Release {
                    reason: format!("job store unavailable: {e}"),
                };
            }
        };

        if job.instance_handle.is_some() || job.status != JobStatus::Provisioning {
            debug!(status = %job.status, "job needs no provisioning");
            return Disposition::Skipped;
        }

        if let AdmissionDecision::Denied { ceiling, .. } = self.admission.try_admit_recorded().await
        {
            self.metrics.admission_denied(AdmissionPath::Queue);
            return Disposition::Release {
                reason: format!("capacity limit reached ({ceiling} concurrent jobs)"),
            };
        }

        match self
            .engine
            .provision(message.job_id, message.options.as_ref())
            .await
        {
            Ok(ProvisionOutcome::Launched { .. }) => Disposition::Provisioned,
            Ok(_) => Disposition::Skipped,
            Err(e) => {
                error!(error = %e, "provisioning failed");
                Disposition::Release {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        disposition: Disposition,
        report: &mut BatchReport,
    ) {
        match disposition {
            Disposition::Provisioned | Disposition::Skipped => {
                if matches!(disposition, Disposition::Provisioned) {
                    report.provisioned += 1;
                } else {
                    report.skipped += 1;
                }
                if let Err(e) = self.queue.ack(delivery).await {
                    error!(error = %e, "failed to acknowledge message");
                }
            }
            Disposition::Release { reason } => match self.queue.release(delivery).await {
                Ok(ReleaseOutcome::Redelivering { after }) => {
                    report.released += 1;
                    debug!(after_ms = after.as_millis() as u64, "message released");
                }
                Ok(ReleaseOutcome::DeadLettered) => {
                    report.dead_lettered += 1;
                    warn!("message exceeded its receive limit and was dead-lettered");
                    self.abandon(delivery, &reason).await;
                }
                Err(e) => error!(error = %e, "failed to release message"),
            },
            Disposition::DeadLetter => {
                report.dead_lettered += 1;
                if let Err(e) = self.queue.dead_letter(delivery).await {
                    error!(error = %e, "failed to dead-letter message");
                }
            }
        }
    }

    /// Fail the job behind a dead-lettered message so it no longer reads as
    /// provisioning or holds an admission slot.
    async fn abandon(&self, delivery: &Delivery, reason: &str) {
        let Ok(message) = delivery.decode() else {
            return;
        };
        let job_id = message.job_id;

        match self.repository.get(job_id).await {
            Ok(job) if job.status == JobStatus::Provisioning && job.instance_handle.is_none() => {}
            Ok(_) | Err(StoreError::NotFound(_)) => return,
            Err(e) => {
                error!(%job_id, error = %e, "failed to load job for a dead-lettered message");
                return;
            }
        }

        let update = JobUpdate::status(StatusChange::failed(
            format!(
                "Provisioning abandoned after {} deliveries: {reason}",
                delivery.receive_count
            ),
            Utc::now(),
        ));
        match self.repository.update_fields(job_id, &update).await {
            Ok(_) => warn!(%job_id, "job marked failed after its message was dead-lettered"),
            Err(e) => error!(%job_id, error = %e, "failed to mark abandoned job failed"),
        }
    }
}
