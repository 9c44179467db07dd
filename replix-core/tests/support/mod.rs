use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use replix_core::admission::AdmissionController;
use replix_core::credentials::AesGcmVault;
use replix_core::database::InMemoryJobRepository;
use replix_core::lifecycle::JobLifecycle;
use replix_core::metrics::RecordingMetrics;
use replix_core::provisioning::{
    ComputeBackend, LaunchError, LaunchSpec, ProvisioningEngine, RetryPolicy, WorkerTemplate,
};

/// Backend that answers launches from a script, then with fresh instance ids.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<String, LaunchError>>>,
    launched: Mutex<Vec<LaunchSpec>>,
}

#[allow(dead_code)]
impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, response: Result<String, LaunchError>) -> Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComputeBackend for ScriptedBackend {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String, LaunchError> {
        let mut launched = self.launched.lock().unwrap();
        launched.push(spec.clone());
        let count = launched.len();
        drop(launched);

        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("i-{count:04}")))
    }
}

#[allow(dead_code)]
pub struct Stack {
    pub repo: Arc<InMemoryJobRepository>,
    pub backend: Arc<ScriptedBackend>,
    pub metrics: Arc<RecordingMetrics>,
    pub admission: Arc<AdmissionController>,
    pub engine: Arc<ProvisioningEngine>,
    pub lifecycle: JobLifecycle,
}

pub fn stack(backend: ScriptedBackend, ceiling: u64) -> Stack {
    let repo = Arc::new(InMemoryJobRepository::new());
    let backend = Arc::new(backend);
    let metrics = Arc::new(RecordingMetrics::new());
    let vault = Arc::new(
        AesGcmVault::from_key(&AesGcmVault::generate_key()).expect("generated key is valid"),
    );
    let admission = Arc::new(AdmissionController::new(repo.clone(), ceiling));
    let engine = Arc::new(ProvisioningEngine::new(
        repo.clone(),
        backend.clone(),
        WorkerTemplate::default(),
        RetryPolicy::new(1, Duration::ZERO),
        metrics.clone(),
    ));
    let lifecycle = JobLifecycle::new(
        repo.clone(),
        vault,
        admission.clone(),
        engine.clone(),
        metrics.clone(),
    );
    Stack {
        repo,
        backend,
        metrics,
        admission,
        engine,
        lifecycle,
    }
}
