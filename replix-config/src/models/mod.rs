pub mod sources;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use replix_core::DispatchMode;
use replix_core::provisioning::{InstanceTypes, RetryPolicy, WorkerTemplate, WorkerTier};
use replix_core::queue::RedeliveryPolicy;
use url::Url;
use zeroize::Zeroizing;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub vault: VaultConfig,
    pub auth: AuthConfig,
    pub provisioning: ProvisioningConfig,
    pub queue: QueueConfig,
    pub retention_days: u32,
    pub dev_mode: bool,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field(
                "url",
                &self.url.as_deref().map(replix_core::redact),
            )
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[derive(Clone)]
pub struct RedisConfig {
    pub url: String,
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &replix_core::redact(&self.url))
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct VaultConfig {
    /// Base64 AES-256 key. Without one every submission is rejected.
    pub key: Option<Zeroizing<String>>,
}

impl VaultConfig {
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref().map(String::as_str)
    }
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultConfig")
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub api_key_parameter: String,
    /// Directory-backed parameter store. When unset the key is read from the
    /// environment variable derived from the parameter name.
    pub parameter_store_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    pub mode: DispatchMode,
    pub max_concurrent_jobs: u64,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub default_tier: WorkerTier,
    pub instance_types: InstanceTypes,
    pub worker_image_id: String,
    pub worker_iam_role: String,
    pub worker_log_group: String,
    pub compute_endpoint: Option<Url>,
    pub compute_timeout: Duration,
}

impl ProvisioningConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.initial_delay)
    }

    pub fn worker_template(&self) -> WorkerTemplate {
        WorkerTemplate {
            image_id: self.worker_image_id.clone(),
            execution_role: self.worker_iam_role.clone(),
            log_group: self.worker_log_group.clone(),
            instance_types: self.instance_types.clone(),
            default_tier: self.default_tier,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub batch_size: usize,
    pub max_receives: u32,
    pub redelivery_delay: Duration,
    pub max_redelivery_delay: Duration,
    pub poll_interval: Duration,
}

impl QueueConfig {
    pub fn redelivery_policy(&self) -> RedeliveryPolicy {
        RedeliveryPolicy {
            base_delay: self.redelivery_delay,
            max_delay: self.max_redelivery_delay,
            max_receives: self.max_receives,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
