pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Parameter holding the API key that guards the HTTP surface.
pub const DEFAULT_API_KEY_PARAMETER: &str = "/replix/api-key";

pub const DEFAULT_COMPUTE_TIMEOUT_SECS: u64 = 30;

/// Candidate config files probed, in order, when no path is given.
pub const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["replix.toml", "config/replix.toml"];

pub const CONFIG_PATH_ENV: &str = "REPLIX_CONFIG_PATH";
