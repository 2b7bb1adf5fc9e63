//! External collaborators the orchestrator drives
//!
//! Object storage, the container registry, the build environment and the
//! compute service are managed primitives; only their interfaces live here,
//! plus in-memory implementations for simulation and tests.

pub mod memory;

use crate::core::{Artifact, BuildSpec};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use memory::{
    BuildOutcome, InMemoryComputeService, InMemoryObjectStore, InMemoryRegistry, RolloutOutcome,
    SimulatedBuildEnvironment,
};

/// Error types for collaborator calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Rejected: {0}")]
    Rejected(String),
}

/// The shared artifact bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CollaboratorError>;

    /// Fetch an object; `NotFound` until the object is readable
    async fn get(&self, key: &str) -> Result<Vec<u8>, CollaboratorError>;
}

#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    async fn push(&self, repository: &str, image: &str) -> Result<(), CollaboratorError>;

    async fn auth_token(&self) -> Result<String, CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildId(pub String);

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the build environment needs to run one build
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub project: String,
    pub input: Artifact,
    pub environment: BTreeMap<String, String>,
    pub privileged: bool,
    pub build_spec: BuildSpec,
    pub registry_token: String,
    /// Identity the build acts as
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    InProgress,
    Succeeded { output: Vec<u8> },
    Failed { reason: String, log_ref: String },
}

#[async_trait]
pub trait BuildEnvironment: Send + Sync {
    async fn start(&self, request: BuildRequest) -> Result<BuildId, CollaboratorError>;

    async fn poll(&self, build: &BuildId) -> Result<BuildStatus, CollaboratorError>;

    /// Release a running build
    async fn stop(&self, build: &BuildId) -> Result<(), CollaboratorError>;
}

/// A compute service within its cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub cluster: String,
    pub service: String,
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.service)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RolloutId(pub String);

impl fmt::Display for RolloutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutStatus {
    InProgress,
    /// New replicas healthy, old replicas drained
    Stable,
    Failed { reason: String },
}

#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Ask a running service to adopt `image`; never recreates the service
    async fn update_image(&self, service: &ServiceRef, image: &str) -> Result<RolloutId, CollaboratorError>;

    async fn rollout_status(&self, rollout: &RolloutId) -> Result<RolloutStatus, CollaboratorError>;
}

/// Handles to every collaborator, shared by all pipelines
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ObjectStore>,
    pub registry: Arc<dyn ContainerRegistry>,
    pub builds: Arc<dyn BuildEnvironment>,
    pub compute: Arc<dyn ComputeService>,
}

impl Collaborators {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registry: Arc<dyn ContainerRegistry>,
        builds: Arc<dyn BuildEnvironment>,
        compute: Arc<dyn ComputeService>,
    ) -> Self {
        Self {
            store,
            registry,
            builds,
            compute,
        }
    }
}
