use serde::{Deserialize, Serialize};

use super::logging::LoggingConfig;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub node: NodeSettings,
    pub consensus: ConsensusSettings,
    pub storage: StorageConfig,
    pub cluster: ClusterSettings,
    pub logging: LoggingConfig,
}

/// Identity of this node within the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Cluster-wide node id, e.g. `CBR_0`.
    pub id: String,
    /// Human-readable name used as the block signer.
    pub name: String,
    /// Whether this node is the central authority (permanent leader).
    pub authority: bool,
    pub address: String,
}

/// Consensus timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSettings {
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
}

/// Storage tuning. The core tables live in memory; these knobs cover the
/// on-disk side (export directory) and the read-cache budget a durable
/// backend would honour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for registry exports and snapshots.
    pub data_dir: String,
    /// Row-cache budget for hot table reads.
    pub cache_size: usize,
}

/// Demo-cluster shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Number of financial-organisation peers.
    pub banks: usize,
}
