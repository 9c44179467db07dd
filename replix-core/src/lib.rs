//! # Replix Core
//!
//! Orchestration engine for short-lived replication workers: a client submits
//! a job, the job is durably recorded with its connection strings sealed, an
//! admission check bounds how many jobs run at once, and a disposable worker
//! is launched to carry out the copy. The worker receives only the job id and
//! fetches its own credentials.
//!
//! ## Overview
//!
//! - [`job`]: the job record, its status state machine and the redacted status
//!   document served to clients
//! - [`credentials`]: credential sealing, URL redaction for logs and the cached
//!   API-key handle
//! - [`database`]: the job record store port with PostgreSQL and in-memory
//!   adapters
//! - [`admission`]: count-based, best-effort concurrency ceiling
//! - [`provisioning`]: tier sizing, launch parameters, transient-error retry and
//!   the idempotent provisioning engine
//! - [`lifecycle`]: submission, status rendering and worker reports
//! - [`queue`]: the decoupled provisioning path and its batch consumer
//!
//! ## Feature Flags
//!
//! - `database` (default): PostgreSQL job store and Redis provisioning queue

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod admission;
pub mod credentials;
pub mod database;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod metrics;
pub mod provisioning;
pub mod queue;

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use admission::{
    ActiveJobCount, AdmissionController, AdmissionDecision, UnknownCountPolicy,
};
pub use credentials::{
    ApiKeyHandle, CredentialVault, SealedCredential, redact::redact,
};
pub use database::ports::JobRepository;
pub use error::{
    ParameterError, ProvisioningError, QueueError, StoreError, ValidationError,
    VaultError,
};
pub use job::{
    Job, JobId, JobStatus, JobStatusView, JobUpdate, StatusChange,
    submission::JobSubmission,
};
pub use lifecycle::{DispatchMode, JobLifecycle, SubmitError, WorkerReport};
pub use provisioning::{
    ProvisionOutcome, ProvisioningEngine, WorkerTemplate,
    sizing::{InstanceTypes, WorkerTier},
};
