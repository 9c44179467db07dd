//! Worker launch parameters and the compute backend boundary.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use super::sizing::{InstanceTypes, WorkerTier};
use crate::job::JobId;

pub const DEFAULT_WORKER_IMAGE: &str = "replix-worker";
pub const DEFAULT_EXECUTION_ROLE: &str = "replix-replication-worker";
pub const DEFAULT_LOG_GROUP: &str = "/replix/replication-worker";
pub const WORKER_ENTRYPOINT: &str = "/opt/replix/worker.sh";
pub const MANAGED_BY: &str = "replix-replication-system";

/// Fixed parts of every worker launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTemplate {
    pub image_id: String,
    pub execution_role: String,
    pub log_group: String,
    pub instance_types: InstanceTypes,
    pub default_tier: WorkerTier,
}

impl Default for WorkerTemplate {
    fn default() -> Self {
        Self {
            image_id: DEFAULT_WORKER_IMAGE.into(),
            execution_role: DEFAULT_EXECUTION_ROLE.into(),
            log_group: DEFAULT_LOG_GROUP.into(),
            instance_types: InstanceTypes::default(),
            default_tier: WorkerTier::Large,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownBehavior {
    Terminate,
}

/// Everything the compute backend is told about a worker. The worker learns
/// its job id and nothing else; it loads the sealed credentials itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub job_id: JobId,
    pub tier: WorkerTier,
    pub instance_type: String,
    pub image_id: String,
    pub execution_role: String,
    pub bootstrap_script: String,
    pub tags: BTreeMap<String, String>,
    pub shutdown_behavior: ShutdownBehavior,
}

impl LaunchSpec {
    pub fn build(job_id: JobId, tier: WorkerTier, template: &WorkerTemplate) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("Name".to_string(), format!("replix-replication-{job_id}"));
        tags.insert("JobId".to_string(), job_id.to_string());
        tags.insert("ManagedBy".to_string(), MANAGED_BY.to_string());

        Self {
            job_id,
            tier,
            instance_type: template.instance_types.for_tier(tier).to_string(),
            image_id: template.image_id.clone(),
            execution_role: template.execution_role.clone(),
            bootstrap_script: bootstrap_script(job_id),
            tags,
            shutdown_behavior: ShutdownBehavior::Terminate,
        }
    }
}

fn bootstrap_script(job_id: JobId) -> String {
    format!(
        "#!/bin/bash\nset -euo pipefail\n\n{WORKER_ENTRYPOINT} \"{job_id}\"\n"
    )
}

/// Classification of a launch failure reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchErrorKind {
    RequestLimitExceeded,
    InsufficientInstanceCapacity,
    InternalError,
    ServiceUnavailable,
    Throttling,
    Other(String),
}

impl LaunchErrorKind {
    pub fn from_code(code: &str) -> Self {
        match code {
            "RequestLimitExceeded" => Self::RequestLimitExceeded,
            "InsufficientInstanceCapacity" => Self::InsufficientInstanceCapacity,
            "InternalError" => Self::InternalError,
            "ServiceUnavailable" => Self::ServiceUnavailable,
            "Throttling" => Self::Throttling,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::RequestLimitExceeded => "RequestLimitExceeded",
            Self::InsufficientInstanceCapacity => "InsufficientInstanceCapacity",
            Self::InternalError => "InternalError",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::Throttling => "Throttling",
            Self::Other(code) => code,
        }
    }

    /// Whether the same request may succeed if repeated later.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl fmt::Display for LaunchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct LaunchError {
    pub kind: LaunchErrorKind,
    pub message: String,
}

impl LaunchError {
    pub fn new(kind: LaunchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Launches worker instances.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Start a worker and return its instance handle.
    async fn launch(&self, spec: &LaunchSpec) -> Result<String, LaunchError>;
}
