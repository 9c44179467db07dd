use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::infra::{app_state::AppState, errors::AppError};

/// Header carrying the caller's key. Header names are case-insensitive.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Rejects requests whose `x-api-key` does not match the configured key.
/// Runs before any handler, so an unauthenticated request never reaches the
/// job store or the provisioning engine.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if provided.is_empty() || !state.api_key.verify(provided).await? {
        warn!(
            method = %request.method(),
            path = %request.uri().path(),
            "rejected request with missing or invalid API key"
        );
        return Err(AppError::unauthorized("Unauthorized"));
    }

    Ok(next.run(request).await)
}
