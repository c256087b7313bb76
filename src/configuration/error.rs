//! Configuration failure type.

use thiserror::Error;

/// Failures while assembling a node's configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A validation rule rejected the assembled configuration.
    #[error("invalid node configuration: {0}")]
    Invalid(String),

    /// The configuration file could not be read or parsed.
    #[error("configuration file {path}: {reason}")]
    File { path: String, reason: String },

    /// An environment override carried an unusable value.
    #[error("environment override {name}={value} is not usable")]
    EnvOverride { name: String, value: String },
}
