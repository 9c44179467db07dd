use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response},
};
use replix_core::credentials::{AesGcmVault, InMemoryParameterStore};
use replix_core::database::InMemoryJobRepository;
use replix_core::metrics::RecordingMetrics;
use replix_core::provisioning::{
    ComputeBackend, LaunchError, LaunchSpec, RetryPolicy, WorkerTemplate,
};
use replix_core::{AdmissionController, ApiKeyHandle, JobLifecycle, ProvisioningEngine};
use replix_server::{AppState, create_router};
use serde_json::Value;

pub const API_KEY: &str = "test-api-key-7f3a";
pub const API_KEY_PARAMETER: &str = "/replix/api-key";

/// Launches always succeed with sequential instance ids.
#[derive(Default)]
pub struct CountingBackend {
    launched: Mutex<Vec<LaunchSpec>>,
}

#[allow(dead_code)]
impl CountingBackend {
    pub fn launches(&self) -> usize {
        self.launched.lock().unwrap().len()
    }
}

#[async_trait]
impl ComputeBackend for CountingBackend {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String, LaunchError> {
        let mut launched = self.launched.lock().unwrap();
        launched.push(spec.clone());
        Ok(format!("i-{:04}", launched.len()))
    }
}

#[allow(dead_code)]
pub struct TestApp {
    pub router: Router,
    pub repo: Arc<InMemoryJobRepository>,
    pub backend: Arc<CountingBackend>,
}

pub fn app(ceiling: u64) -> TestApp {
    app_with_store(
        ceiling,
        InMemoryParameterStore::new().with_parameter(API_KEY_PARAMETER, API_KEY),
    )
}

pub fn app_with_store(ceiling: u64, store: InMemoryParameterStore) -> TestApp {
    let repo = Arc::new(InMemoryJobRepository::new());
    let backend = Arc::new(CountingBackend::default());
    let metrics = Arc::new(RecordingMetrics::new());
    let vault = Arc::new(AesGcmVault::from_key(&AesGcmVault::generate_key()).unwrap());
    let admission = Arc::new(AdmissionController::new(repo.clone(), ceiling));
    let engine = Arc::new(ProvisioningEngine::new(
        repo.clone(),
        backend.clone(),
        WorkerTemplate::default(),
        RetryPolicy::new(1, Duration::ZERO),
        metrics.clone(),
    ));
    let lifecycle = JobLifecycle::new(repo.clone(), vault, admission, engine, metrics);
    let api_key = ApiKeyHandle::new(Arc::new(store), API_KEY_PARAMETER);

    TestApp {
        router: create_router(AppState::new(Arc::new(lifecycle), Arc::new(api_key))),
        repo,
        backend,
    }
}

pub fn post_job(key: Option<&str>, body: impl Into<Body>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/jobs")
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(body.into()).unwrap()
}

pub fn get_job(key: Option<&str>, job_id: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("GET")
        .uri(format!("/jobs/{job_id}"));
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::empty()).unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
