//! Orchestration metrics
//!
//! Recorded through the `metrics` facade; with no recorder installed every
//! call is a no-op. Recording never fails and never affects the job.
//!
//! - `replix_jobs_submitted_total{mode}`
//! - `replix_jobs_provisioned_total{tier}`
//! - `replix_provisioning_duration_seconds`
//! - `replix_provisioning_failed_total{error_kind}`
//! - `replix_admission_denied_total{path}`

use std::sync::Mutex;
use std::time::Duration;

use metrics::{counter, histogram};

use crate::provisioning::sizing::WorkerTier;

/// Entry point that saw a capacity denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPath {
    Direct,
    Queue,
}

impl AdmissionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionPath::Direct => "direct",
            AdmissionPath::Queue => "queue",
        }
    }
}

pub trait ProvisioningMetrics: Send + Sync {
    fn job_submitted(&self, mode: &'static str);
    fn job_provisioned(&self, tier: WorkerTier, elapsed: Duration);
    fn provisioning_failed(&self, error_kind: &str);
    fn admission_denied(&self, path: AdmissionPath);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeMetrics;

impl ProvisioningMetrics for FacadeMetrics {
    fn job_submitted(&self, mode: &'static str) {
        counter!("replix_jobs_submitted_total", "mode" => mode).increment(1);
    }

    fn job_provisioned(&self, tier: WorkerTier, elapsed: Duration) {
        counter!("replix_jobs_provisioned_total", "tier" => tier.as_str()).increment(1);
        histogram!("replix_provisioning_duration_seconds").record(elapsed.as_secs_f64());
    }

    fn provisioning_failed(&self, error_kind: &str) {
        counter!(
            "replix_provisioning_failed_total",
            "error_kind" => error_kind.to_string()
        )
        .increment(1);
    }

    fn admission_denied(&self, path: AdmissionPath) {
        counter!("replix_admission_denied_total", "path" => path.as_str()).increment(1);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Submitted(&'static str),
    Provisioned(WorkerTier),
    Failed(String),
    Denied(AdmissionPath),
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn push(&self, event: MetricEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl ProvisioningMetrics for RecordingMetrics {
    fn job_submitted(&self, mode: &'static str) {
        self.push(MetricEvent::Submitted(mode));
    }

    fn job_provisioned(&self, tier: WorkerTier, _elapsed: Duration) {
        self.push(MetricEvent::Provisioned(tier));
    }

    fn provisioning_failed(&self, error_kind: &str) {
        self.push(MetricEvent::Failed(error_kind.to_string()));
    }

    fn admission_denied(&self, path: AdmissionPath) {
        self.push(MetricEvent::Denied(path));
    }
}
