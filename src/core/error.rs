//! Error taxonomy for configuration, topology and identity construction

use thiserror::Error;

/// A field-level configuration problem.
///
/// `entry` names the offending fleet entry (`ecsServices[1] (api)`) or the
/// top-level document (`config`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{entry}: {field}: {reason}")]
pub struct ValidationError {
    pub entry: String,
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(entry: impl Into<String>, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while loading the fleet configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("Build specification not found at {0}")]
    MissingBuildSpec(String),
}

/// An identity grant that would reach outside its owning pipeline
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{identity}: grant on '{resource}' rejected: {reason}")]
pub struct ScopeViolation {
    pub identity: String,
    pub resource: String,
    pub reason: String,
}

/// Errors raised while deriving the fleet topology
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("Naming collision: {kind} '{identifier}' is derived by both '{first}' and '{second}'")]
    NamingCollision {
        kind: String,
        identifier: String,
        first: String,
        second: String,
    },

    #[error("Scope violation: {0}")]
    Scope(#[from] ScopeViolation),
}
