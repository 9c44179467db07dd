use std::{fmt, sync::Arc};

use replix_core::{ApiKeyHandle, JobLifecycle};

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<JobLifecycle>,
    pub api_key: Arc<ApiKeyHandle>,
}

impl AppState {
    pub fn new(lifecycle: Arc<JobLifecycle>, api_key: Arc<ApiKeyHandle>) -> Self {
        Self { lifecycle, api_key }
    }

    pub fn lifecycle(&self) -> &JobLifecycle {
        &self.lifecycle
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("mode", &self.lifecycle.mode())
            .field("api_key", &self.api_key)
            .finish()
    }
}
