use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use replix_core::provisioning::InstanceTypes;

use crate::constants::CONFIG_PATH_ENV;
use crate::util::{non_empty, parse_bool};

/// Raw configuration as defined in a TOML file.
///
/// Durations are humantime strings (`initial_delay = "2s"`); tiers and the
/// dispatch mode are names. Everything is parsed when the config is composed
/// so a bad value is reported against its field.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    pub redis: Option<FileRedisConfig>,
    #[serde(default)]
    pub vault: FileVaultConfig,
    #[serde(default)]
    pub auth: FileAuthConfig,
    #[serde(default)]
    pub provisioning: FileProvisioningConfig,
    #[serde(default)]
    pub queue: FileQueueConfig,
    pub retention_days: Option<u32>,
    pub dev_mode: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub url: String,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileVaultConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileAuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_parameter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_store_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileProvisioningConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_types: Option<InstanceTypes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_image_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_iam_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_log_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_timeout: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileQueueConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_receives: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redelivery_delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_redelivery_delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub database_url: Option<String>,
    pub database_url_file: Option<PathBuf>,
    pub database_max_connections: Option<u32>,
    pub redis_url: Option<String>,
    pub vault_key: Option<String>,
    pub vault_key_file: Option<PathBuf>,
    pub api_key_parameter: Option<String>,
    pub parameter_store_dir: Option<PathBuf>,
    pub provisioning_mode: Option<String>,
    pub max_concurrent_jobs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub initial_delay: Option<String>,
    pub default_tier: Option<String>,
    pub worker_image_id: Option<String>,
    pub worker_iam_role: Option<String>,
    pub worker_log_group: Option<String>,
    pub compute_endpoint: Option<String>,
    pub compute_timeout: Option<String>,
    pub queue_name: Option<String>,
    pub queue_batch_size: Option<usize>,
    pub queue_max_receives: Option<u32>,
    pub queue_redelivery_delay: Option<String>,
    pub queue_max_redelivery_delay: Option<String>,
    pub queue_poll_interval: Option<String>,
    pub retention_days: Option<u32>,
    pub dev_mode: Option<bool>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Blank values count as unset
    /// and numbers that fail to parse are ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| non_empty(lookup(name));
        let path = |name: &str| text(name).map(PathBuf::from);

        Self {
            config_path: path(CONFIG_PATH_ENV),
            server_host: text("SERVER_HOST"),
            server_port: text("SERVER_PORT").and_then(|s| s.parse().ok()),
            database_url: text("DATABASE_URL"),
            database_url_file: path("DATABASE_URL_FILE"),
            database_max_connections: text("DATABASE_MAX_CONNECTIONS")
                .and_then(|s| s.parse().ok()),
            redis_url: text("REDIS_URL"),
            vault_key: text("VAULT_KEY"),
            vault_key_file: path("VAULT_KEY_FILE"),
            api_key_parameter: text("API_KEY_PARAMETER_NAME"),
            parameter_store_dir: path("PARAMETER_STORE_DIR"),
            provisioning_mode: text("PROVISIONING_MODE"),
            max_concurrent_jobs: text("MAX_CONCURRENT_JOBS").and_then(|s| s.parse().ok()),
            max_attempts: text("PROVISIONING_MAX_ATTEMPTS").and_then(|s| s.parse().ok()),
            initial_delay: text("PROVISIONING_INITIAL_DELAY"),
            default_tier: text("WORKER_DEFAULT_TIER"),
            worker_image_id: text("WORKER_IMAGE_ID"),
            worker_iam_role: text("WORKER_IAM_ROLE"),
            worker_log_group: text("WORKER_LOG_GROUP"),
            compute_endpoint: text("COMPUTE_ENDPOINT"),
            compute_timeout: text("COMPUTE_TIMEOUT"),
            queue_name: text("QUEUE_NAME"),
            queue_batch_size: text("QUEUE_BATCH_SIZE").and_then(|s| s.parse().ok()),
            queue_max_receives: text("QUEUE_MAX_RECEIVES").and_then(|s| s.parse().ok()),
            queue_redelivery_delay: text("QUEUE_REDELIVERY_DELAY"),
            queue_max_redelivery_delay: text("QUEUE_MAX_REDELIVERY_DELAY"),
            queue_poll_interval: text("QUEUE_POLL_INTERVAL"),
            retention_days: text("JOB_RETENTION_DAYS").and_then(|s| s.parse().ok()),
            dev_mode: text("DEV_MODE").and_then(|s| parse_bool(&s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> EnvConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn reads_typed_values() {
        let env = env(&[
            ("SERVER_PORT", "9000"),
            ("MAX_CONCURRENT_JOBS", "4"),
            ("DEV_MODE", "yes"),
            ("PROVISIONING_INITIAL_DELAY", "500ms"),
        ]);
        assert_eq!(env.server_port, Some(9000));
        assert_eq!(env.max_concurrent_jobs, Some(4));
        assert_eq!(env.dev_mode, Some(true));
        assert_eq!(env.initial_delay.as_deref(), Some("500ms"));
    }

    #[test]
    fn blank_and_unparsable_values_are_unset() {
        let env = env(&[("SERVER_PORT", "http"), ("VAULT_KEY", "   ")]);
        assert_eq!(env.server_port, None);
        assert_eq!(env.vault_key, None);
    }

    #[test]
    fn file_sections_are_optional() {
        let file: FileConfig = toml::from_str(
            r#"
            dev_mode = true

            [provisioning]
            default_tier = "medium"
            initial_delay = "1s"

            [provisioning.instance_types]
            small = "t3.small"
            "#,
        )
        .unwrap();
        assert_eq!(file.dev_mode, Some(true));
        assert!(file.redis.is_none());
        let types = file.provisioning.instance_types.unwrap();
        assert_eq!(types.small, "t3.small");
        assert_eq!(types.xlarge, "c5.4xlarge");
    }
}
