use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{health::health, jobs};
use crate::infra::{app_state::AppState, middleware::require_api_key};

/// Build the HTTP surface. Every job route sits behind the API key check;
/// the health probe does not.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(jobs::submit_job))
        .route("/jobs/{job_id}", get(jobs::get_job))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
