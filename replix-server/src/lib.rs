//! # Replix Server
//!
//! HTTP front door and operator CLI for the replication job orchestrator.
//!
//! - `POST /jobs` accepts a replication request, seals its connection URLs and
//!   starts provisioning a worker, inline or through the provisioning queue.
//! - `GET /jobs/{job_id}` returns the job's status without credential fields.
//!
//! Both routes require the `x-api-key` header. The binary also runs the
//! queue consumer, applies migrations and generates vault keys.

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
pub use routes::create_router;
