//! Shared configuration library for Replix.
//!
//! Configuration is layered: an optional `.env` file is loaded into the
//! process environment, environment variables take precedence over an
//! optional `replix.toml`, and anything left unset falls back to defaults.
//! The composed [`Config`] is checked by [`validation::apply_guard_rails`]
//! before it is handed to the server.

pub mod constants;
pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError};
pub use models::sources::{EnvConfig, FileConfig};
pub use models::{
    AuthConfig, Config, ConfigMetadata, DatabaseConfig, ProvisioningConfig, QueueConfig,
    RedisConfig, ServerConfig, VaultConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
