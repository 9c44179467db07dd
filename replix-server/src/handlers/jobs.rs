use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::debug;

use replix_core::lifecycle::SubmitReceipt;
use replix_core::{JobId, JobStatusView};

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

/// `POST /jobs`
///
/// The raw body is handed to the lifecycle so malformed JSON, non-object
/// bodies and missing fields all come back as the same 400 shape.
pub async fn submit_job(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<SubmitReceipt>)> {
    let receipt = state.lifecycle().submit_json(&body).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// `GET /jobs/{job_id}`
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<JobStatusView>> {
    let job_id: JobId = job_id.parse().map_err(|_| {
        debug!(%job_id, "status requested for malformed job id");
        AppError::not_found("Job not found")
    })?;

    let view = state.lifecycle().status(job_id).await?;
    Ok(Json(view))
}
