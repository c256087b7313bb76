use super::logging::LoggingConfig;
use super::types::{
    ClusterSettings, Configuration, ConsensusSettings, NodeSettings, StorageConfig,
};

/// Provides default configuration values.
pub fn default_configuration() -> Configuration {
    Configuration {
        node: NodeSettings {
            id: "CBR_0".to_string(),
            name: "Central Bank".to_string(),
            authority: true,
            address: "local://CBR_0".to_string(),
        },
        consensus: ConsensusSettings {
            heartbeat_interval_ms: 500,
            election_timeout_min_ms: 1500,
            election_timeout_max_ms: 3000,
        },
        storage: StorageConfig {
            data_dir: "./data".to_string(),
            cache_size: 1024,
        },
        cluster: ClusterSettings { banks: 3 },
        logging: LoggingConfig::default(),
    }
}
