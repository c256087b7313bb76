//! Node configuration: typed settings, defaults, file and environment
//! sources, and validation.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod types;
pub mod validation;

pub use defaults::*;
pub use error::*;
pub use logging::*;
pub use types::*;
pub use validation::*;

use std::env;
use std::path::Path;

/// Load configuration: defaults, then the optional YAML file, then
/// environment overrides, then validation.
pub fn load_configuration(path: Option<&Path>) -> Result<Configuration, ConfigError> {
    let mut config = default_configuration();
    if let Some(path) = path {
        config = load_config_file(path)?;
    }
    apply_env_overrides(&mut config)?;
    validate(&config)?;
    Ok(config)
}

/// Loads configuration from a YAML file.
#[cfg(feature = "serde_yaml")]
pub fn load_config_file(path: &Path) -> Result<Configuration, ConfigError> {
    let file_error = |reason: String| ConfigError::File {
        path: path.display().to_string(),
        reason,
    };
    let content = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
    serde_yaml::from_str(&content).map_err(|e| file_error(e.to_string()))
}

#[cfg(not(feature = "serde_yaml"))]
pub fn load_config_file(path: &Path) -> Result<Configuration, ConfigError> {
    Err(ConfigError::File {
        path: path.display().to_string(),
        reason: "built without the serde_yaml feature".into(),
    })
}

/// Environment variables take precedence over the file.
fn apply_env_overrides(config: &mut Configuration) -> Result<(), ConfigError> {
    if let Ok(id) = env::var("NODE_ID") {
        config.node.id = id;
    }
    if let Ok(name) = env::var("NODE_NAME") {
        config.node.name = name;
    }
    if let Ok(value) = env::var("HEARTBEAT_INTERVAL_MS") {
        config.consensus.heartbeat_interval_ms = parse_env("HEARTBEAT_INTERVAL_MS", &value)?;
    }
    if let Ok(value) = env::var("ELECTION_TIMEOUT_MIN_MS") {
        config.consensus.election_timeout_min_ms = parse_env("ELECTION_TIMEOUT_MIN_MS", &value)?;
    }
    if let Ok(value) = env::var("ELECTION_TIMEOUT_MAX_MS") {
        config.consensus.election_timeout_max_ms = parse_env("ELECTION_TIMEOUT_MAX_MS", &value)?;
    }
    if let Ok(dir) = env::var("DATA_DIR") {
        config.storage.data_dir = dir;
    }
    if let Ok(value) = env::var("CACHE_SIZE") {
        config.storage.cache_size = parse_env("CACHE_SIZE", &value)?;
    }
    if let Ok(value) = env::var("CLUSTER_BANKS") {
        config.cluster.banks = parse_env("CLUSTER_BANKS", &value)?;
    }
    if let Ok(level) = env::var("LOG_LEVEL") {
        config.logging.level = level;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::EnvOverride {
        name: name.to_string(),
        value: value.to_string(),
    })
}
