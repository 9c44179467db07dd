use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::launch::{ComputeBackend, LaunchError, LaunchErrorKind, LaunchSpec};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    instance_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

/// Compute backend reached over HTTP: `POST {endpoint}/v1/instances` with the
/// launch spec as JSON, answered by `{"instance_id": ...}` or an error body
/// `{"code": ..., "message": ...}`.
#[derive(Debug, Clone)]
pub struct HttpComputeBackend {
    client: Client,
    instances_url: Url,
}

impl HttpComputeBackend {
    pub fn new(endpoint: &Url, timeout: Duration) -> Result<Self, LaunchError> {
        // Without a trailing slash `join` would replace the last segment.
        let mut base = endpoint.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let instances_url = base.join("v1/instances").map_err(|e| {
            LaunchError::new(
                LaunchErrorKind::Other("InvalidEndpoint".into()),
                e.to_string(),
            )
        })?;
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            LaunchError::new(LaunchErrorKind::Other("ClientError".into()), e.to_string())
        })?;
        Ok(Self {
            client,
            instances_url,
        })
    }

    /// Parses a successful launch answer. The instance may already exist, so
    /// a body we cannot read is never retried.
    fn instance_id_from(body: &[u8]) -> Result<String, LaunchError> {
        serde_json::from_slice::<LaunchResponse>(body)
            .map(|response| response.instance_id)
            .map_err(invalid_launch_response)
    }

    fn kind_for_status(status: StatusCode) -> LaunchErrorKind {
        match status {
            StatusCode::TOO_MANY_REQUESTS => LaunchErrorKind::Throttling,
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                LaunchErrorKind::ServiceUnavailable
            }
            StatusCode::INTERNAL_SERVER_ERROR | StatusCode::BAD_GATEWAY => {
                LaunchErrorKind::InternalError
            }
            other => LaunchErrorKind::Other(format!("Http{}", other.as_u16())),
        }
    }
}

#[async_trait]
impl ComputeBackend for HttpComputeBackend {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String, LaunchError> {
        let response = self
            .client
            .post(self.instances_url.clone())
            .json(spec)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() || e.is_connect() {
                    LaunchErrorKind::ServiceUnavailable
                } else {
                    LaunchErrorKind::Other("TransportError".into())
                };
                LaunchError::new(kind, e.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            let bytes = response.bytes().await.map_err(invalid_launch_response)?;
            let instance_id = Self::instance_id_from(&bytes)?;
            debug!(job_id = %spec.job_id, %instance_id, "worker launched");
            return Ok(instance_id);
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(LaunchError::new(
                LaunchErrorKind::from_code(&body.code),
                body.message,
            )),
            Err(_) => Err(LaunchError::new(
                Self::kind_for_status(status),
                format!("compute backend returned {status}"),
            )),
        }
    }
}

fn invalid_launch_response(e: impl std::fmt::Display) -> LaunchError {
    LaunchError::new(
        LaunchErrorKind::Other("InvalidLaunchResponse".into()),
        format!("bad response: {e}"),
    )
}

/// Backend used when no compute endpoint is configured. Every launch fails
/// permanently, so jobs end up `failed` instead of waiting forever.
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredBackend;

#[async_trait]
impl ComputeBackend for UnconfiguredBackend {
    async fn launch(&self, _spec: &LaunchSpec) -> Result<String, LaunchError> {
        Err(LaunchError::new(
            LaunchErrorKind::Other("NoComputeBackend".into()),
            "no compute endpoint is configured",
        ))
    }
}
