use super::error::ConfigError;
use super::types::Configuration;

/// Validates the configuration.
pub fn validate(config: &Configuration) -> Result<(), ConfigError> {
    if config.node.id.trim().is_empty() {
        return Err(ConfigError::Invalid("node id cannot be empty".into()));
    }
    if config.consensus.heartbeat_interval_ms == 0 {
        return Err(ConfigError::Invalid(
            "heartbeat interval must be positive".into(),
        ));
    }
    if config.consensus.election_timeout_min_ms >= config.consensus.election_timeout_max_ms {
        return Err(ConfigError::Invalid(
            "election timeout minimum must be below the maximum".into(),
        ));
    }
    if config.consensus.heartbeat_interval_ms >= config.consensus.election_timeout_min_ms {
        return Err(ConfigError::Invalid(
            "heartbeat interval must be below the election timeout floor".into(),
        ));
    }
    if config.storage.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "storage data directory cannot be empty".into(),
        ));
    }
    if config.storage.cache_size == 0 {
        return Err(ConfigError::Invalid(
            "storage cache size must be greater than zero".into(),
        ));
    }
    if config.cluster.banks == 0 {
        return Err(ConfigError::Invalid(
            "cluster needs at least one financial organisation".into(),
        ));
    }
    Ok(())
}
