use replix_core::DispatchMode;
use replix_core::credentials::AesGcmVault;
use thiserror::Error;

use crate::models::Config;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("max_concurrent_jobs must be at least 1")]
    ZeroConcurrencyCeiling,
    #[error("provisioning max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("queue {field} must be at least 1")]
    ZeroQueueSetting { field: &'static str },
    #[error("retention_days must be at least 1")]
    ZeroRetention,
    #[error("vault key is unusable: {reason}")]
    InvalidVaultKey { reason: String },
    #[error("DATABASE_URL is required when DEV_MODE is false")]
    MissingDatabase,
    #[error("queued provisioning requires REDIS_URL when DEV_MODE is false")]
    MissingQueueBackend,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let provisioning = &config.provisioning;
    let queue = &config.queue;

    if provisioning.max_concurrent_jobs == 0 {
        return Err(ConfigGuardRailError::ZeroConcurrencyCeiling);
    }
    if provisioning.max_attempts == 0 {
        return Err(ConfigGuardRailError::ZeroAttempts);
    }
    if queue.batch_size == 0 {
        return Err(ConfigGuardRailError::ZeroQueueSetting {
            field: "batch_size",
        });
    }
    if queue.max_receives == 0 {
        return Err(ConfigGuardRailError::ZeroQueueSetting {
            field: "max_receives",
        });
    }
    if config.retention_days == 0 {
        return Err(ConfigGuardRailError::ZeroRetention);
    }

    match config.vault.key() {
        Some(key) => AesGcmVault::validate_key(key).map_err(|e| {
            ConfigGuardRailError::InvalidVaultKey {
                reason: e.to_string(),
            }
        })?,
        None => warnings.push_with_hint(
            "VAULT_KEY not configured; every submission will be rejected",
            "Run `replix-server vault keygen` and set VAULT_KEY or VAULT_KEY_FILE",
        ),
    }

    if config.database.url.is_none() {
        if !config.dev_mode {
            return Err(ConfigGuardRailError::MissingDatabase);
        }
        warnings.push(
            "DATABASE_URL not configured; dev mode keeps job records in memory and loses them on restart",
        );
    }

    match (provisioning.mode, &config.redis) {
        (DispatchMode::Queued, None) => {
            if !config.dev_mode {
                return Err(ConfigGuardRailError::MissingQueueBackend);
            }
            warnings.push(
                "REDIS_URL not configured; dev mode runs an in-process queue and consumer",
            );
        }
        (DispatchMode::Inline, Some(_)) => warnings.push_with_hint(
            "REDIS_URL is set but PROVISIONING_MODE is inline; submissions provision directly",
            "Set PROVISIONING_MODE=queued to provision through the queue consumer",
        ),
        _ => {}
    }

    if provisioning.compute_endpoint.is_none() {
        warnings.push_with_hint(
            "COMPUTE_ENDPOINT not configured; every launch will fail permanently",
            "Point COMPUTE_ENDPOINT at the compute provisioning API",
        );
    }

    if queue.redelivery_delay > queue.max_redelivery_delay {
        warnings.push(format!(
            "queue redelivery_delay ({:?}) exceeds max_redelivery_delay ({:?}); the maximum applies",
            queue.redelivery_delay, queue.max_redelivery_delay
        ));
    }

    Ok(warnings)
}
