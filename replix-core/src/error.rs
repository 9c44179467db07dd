use std::path::PathBuf;

use thiserror::Error;

use crate::job::{JobId, JobStatus};
use crate::provisioning::launch::LaunchError;

/// Rejected submission input. Nothing has been written when this is raised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Request body must be a JSON object")]
    NotAnObject,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field: {field} must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("vault key is not configured")]
    KeyUnavailable,

    #[error("vault key is invalid: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("malformed credential token: {0}")]
    MalformedToken(&'static str),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} already exists")]
    Conflict(JobId),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error(
        "job {job_id} is {status}; a worker instance can only be recorded while provisioning"
    )]
    NotProvisioning { job_id: JobId, status: JobStatus },

    #[error("job {job_id} already has worker instance {instance_handle}")]
    AlreadyLaunched {
        job_id: JobId,
        instance_handle: String,
    },

    #[error("job {job_id} is already {status}")]
    Finalized { job_id: JobId, status: JobStatus },

    #[error("job store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[derive(Error, Debug)]
pub enum ProvisioningError {
    /// Every attempt hit a transient launch error.
    #[error("launch still failing after {attempts} attempts: {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: LaunchError,
    },

    /// The compute backend rejected the launch with a non-retryable error.
    #[error("launch rejected: {0}")]
    Permanent(#[source] LaunchError),

    #[error("capacity limit reached ({ceiling} concurrent jobs)")]
    CapacityExhausted {
        active: Option<u64>,
        ceiling: u64,
    },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProvisioningError {
    /// Label used when counting failures.
    pub fn error_kind(&self) -> String {
        match self {
            ProvisioningError::Transient { source, .. }
            | ProvisioningError::Permanent(source) => {
                source.kind.code().to_string()
            }
            ProvisioningError::CapacityExhausted { .. } => {
                "CapacityExhausted".to_string()
            }
            ProvisioningError::JobNotFound(_) => "JobNotFound".to_string(),
            ProvisioningError::Store(_) => "StoreError".to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("failed to encode queue message: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ParameterError {
    #[error("parameter {name} not found")]
    NotFound { name: String },

    #[error("parameter {name} is empty")]
    Empty { name: String },

    #[error("failed to read parameter {name} from {path}")]
    Io {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
