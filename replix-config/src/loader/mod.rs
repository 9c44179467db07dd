pub mod error;

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use replix_core::DispatchMode;
use replix_core::admission::DEFAULT_MAX_CONCURRENT_JOBS;
use replix_core::job::DEFAULT_RETENTION_DAYS;
use replix_core::provisioning::launch::{
    DEFAULT_EXECUTION_ROLE, DEFAULT_LOG_GROUP, DEFAULT_WORKER_IMAGE,
};
use replix_core::provisioning::retry::{DEFAULT_INITIAL_DELAY, DEFAULT_MAX_ATTEMPTS};
use replix_core::provisioning::{WorkerTemplate, WorkerTier};
use replix_core::queue::consumer::{DEFAULT_BATCH_SIZE, DEFAULT_POLL_INTERVAL};
use replix_core::queue::{
    DEFAULT_MAX_RECEIVES, DEFAULT_MAX_REDELIVERY_DELAY, DEFAULT_QUEUE_NAME,
    DEFAULT_REDELIVERY_DELAY,
};
use url::Url;
use zeroize::Zeroizing;

use crate::constants::{
    DEFAULT_API_KEY_PARAMETER, DEFAULT_COMPUTE_TIMEOUT_SECS, DEFAULT_CONFIG_LOCATIONS,
    DEFAULT_DATABASE_MAX_CONNECTIONS, DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT,
};
use crate::models::sources::{EnvConfig, FileConfig};
use crate::models::{
    AuthConfig, Config, ConfigMetadata, DatabaseConfig, ProvisioningConfig, QueueConfig,
    RedisConfig, ServerConfig, VaultConfig,
};
use crate::util::{parse_duration, read_secret_file};
use crate::validation::{self, ConfigWarnings};

pub use error::ConfigLoadError;

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

/// A composed configuration together with the non-fatal findings raised
/// while building it.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Load `.env`, read the process environment and the config file, then
    /// compose and validate.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let env = EnvConfig::gather();
        self.load_with_env(env, env_file_loaded)
    }

    /// Same as [`ConfigLoader::load`] but with an already gathered
    /// environment; nothing is read from the process environment.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let metadata = ConfigMetadata {
            config_path,
            env_file_loaded,
        };
        compose_config(file_config, env, metadata)
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let (path, explicit) = match (&self.options.config_path, &env.config_path) {
            (Some(path), _) | (None, Some(path)) => (path.clone(), true),
            (None, None) => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => (path, false),
                None => return Ok((None, None)),
            },
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
                path: path.clone(),
                source,
            })?;

        Ok((Some(file_config), Some(path)))
    }
}

/// Merge file and environment layers over the defaults, then apply the guard
/// rails. Environment values win over file values.
pub fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<ConfigLoad, ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();
    if file_config.is_none() {
        warnings.push_with_hint(
            "No replix.toml detected; using environment variables and defaults",
            "Create replix.toml or set REPLIX_CONFIG_PATH to use a configuration file",
        );
    }

    let FileConfig {
        server: file_server,
        database: file_database,
        redis: file_redis,
        vault: file_vault,
        auth: file_auth,
        provisioning: file_provisioning,
        queue: file_queue,
        retention_days: file_retention_days,
        dev_mode: file_dev_mode,
    } = file_config.unwrap_or_default();

    let server = ServerConfig {
        host: env
            .server_host
            .or(file_server.host)
            .unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string()),
        port: env
            .server_port
            .or(file_server.port)
            .unwrap_or(DEFAULT_SERVER_PORT),
    };

    let database = DatabaseConfig {
        url: resolve_secret(
            env.database_url,
            env.database_url_file.as_deref(),
            file_database.url,
            file_database.url_file.as_deref(),
        )?,
        max_connections: env
            .database_max_connections
            .or(file_database.max_connections)
            .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
    };

    let redis = env
        .redis_url
        .map(|url| RedisConfig { url })
        .or_else(|| file_redis.map(|r| RedisConfig { url: r.url }));

    let vault = VaultConfig {
        key: resolve_secret(
            env.vault_key,
            env.vault_key_file.as_deref(),
            file_vault.key,
            file_vault.key_file.as_deref(),
        )?
        .map(Zeroizing::new),
    };

    let auth = AuthConfig {
        api_key_parameter: env
            .api_key_parameter
            .or(file_auth.api_key_parameter)
            .unwrap_or_else(|| DEFAULT_API_KEY_PARAMETER.to_string()),
        parameter_store_dir: env.parameter_store_dir.or(file_auth.parameter_store_dir),
    };

    let mode = match env.provisioning_mode.or(file_provisioning.mode) {
        Some(raw) => DispatchMode::from_str(&raw)
            .map_err(|reason| ConfigLoadError::InvalidMode { reason })?,
        None => DispatchMode::default(),
    };
    let default_tier = match env.default_tier.or(file_provisioning.default_tier) {
        Some(raw) => WorkerTier::from_str(&raw).map_err(|source| ConfigLoadError::InvalidTier {
            field: "default_tier",
            source,
        })?,
        None => WorkerTemplate::default().default_tier,
    };
    let compute_endpoint = env
        .compute_endpoint
        .or(file_provisioning.compute_endpoint)
        .map(|raw| {
            Url::parse(&raw).map_err(|source| ConfigLoadError::InvalidUrl {
                field: "compute_endpoint",
                source,
            })
        })
        .transpose()?;

    let provisioning = ProvisioningConfig {
        mode,
        max_concurrent_jobs: env
            .max_concurrent_jobs
            .or(file_provisioning.max_concurrent_jobs)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS),
        max_attempts: env
            .max_attempts
            .or(file_provisioning.max_attempts)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS),
        initial_delay: duration(
            "initial_delay",
            env.initial_delay.or(file_provisioning.initial_delay),
            DEFAULT_INITIAL_DELAY,
        )?,
        default_tier,
        instance_types: file_provisioning.instance_types.unwrap_or_default(),
        worker_image_id: env
            .worker_image_id
            .or(file_provisioning.worker_image_id)
            .unwrap_or_else(|| DEFAULT_WORKER_IMAGE.to_string()),
        worker_iam_role: env
            .worker_iam_role
            .or(file_provisioning.worker_iam_role)
            .unwrap_or_else(|| DEFAULT_EXECUTION_ROLE.to_string()),
        worker_log_group: env
            .worker_log_group
            .or(file_provisioning.worker_log_group)
            .unwrap_or_else(|| DEFAULT_LOG_GROUP.to_string()),
        compute_endpoint,
        compute_timeout: duration(
            "compute_timeout",
            env.compute_timeout.or(file_provisioning.compute_timeout),
            Duration::from_secs(DEFAULT_COMPUTE_TIMEOUT_SECS),
        )?,
    };

    let queue = QueueConfig {
        name: env
            .queue_name
            .or(file_queue.name)
            .unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
        batch_size: env
            .queue_batch_size
            .or(file_queue.batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE),
        max_receives: env
            .queue_max_receives
            .or(file_queue.max_receives)
            .unwrap_or(DEFAULT_MAX_RECEIVES),
        redelivery_delay: duration(
            "redelivery_delay",
            env.queue_redelivery_delay.or(file_queue.redelivery_delay),
            DEFAULT_REDELIVERY_DELAY,
        )?,
        max_redelivery_delay: duration(
            "max_redelivery_delay",
            env.queue_max_redelivery_delay
                .or(file_queue.max_redelivery_delay),
            DEFAULT_MAX_REDELIVERY_DELAY,
        )?,
        poll_interval: duration(
            "poll_interval",
            env.queue_poll_interval.or(file_queue.poll_interval),
            DEFAULT_POLL_INTERVAL,
        )?,
    };

    let config = Config {
        server,
        database,
        redis,
        vault,
        auth,
        provisioning,
        queue,
        retention_days: env
            .retention_days
            .or(file_retention_days)
            .unwrap_or(DEFAULT_RETENTION_DAYS as u32),
        dev_mode: env.dev_mode.or(file_dev_mode).unwrap_or(false),
        metadata,
    };

    warnings.extend(validation::apply_guard_rails(&config)?);

    Ok(ConfigLoad { config, warnings })
}

fn duration(
    field: &'static str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    match raw {
        Some(value) => parse_duration(&value).map_err(|source| ConfigLoadError::InvalidDuration {
            field,
            value,
            source,
        }),
        None => Ok(default),
    }
}

/// Inline env value, then env `*_FILE`, then the file's inline value, then
/// the file's path.
fn resolve_secret(
    env_value: Option<String>,
    env_file: Option<&Path>,
    file_value: Option<String>,
    file_path: Option<&Path>,
) -> Result<Option<String>, ConfigLoadError> {
    if env_value.is_some() {
        return Ok(env_value);
    }
    if let Some(path) = env_file {
        return read_secret(path);
    }
    if file_value.is_some() {
        return Ok(file_value);
    }
    match file_path {
        Some(path) => read_secret(path),
        None => Ok(None),
    }
}

fn read_secret(path: &Path) -> Result<Option<String>, ConfigLoadError> {
    read_secret_file(path).map_err(|source| ConfigLoadError::SecretFileIo {
        path: path.to_path_buf(),
        source,
    })
}
