//! mimir - per-service build-and-deploy pipelines for a container fleet

pub mod cli;
pub mod collaborators;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod topology;

// Re-export commonly used types
pub use collaborators::{BuildEnvironment, Collaborators, ComputeService, ContainerRegistry, ObjectStore};
pub use core::{FleetConfig, ObjectCreatedEvent, Pipeline, RunPhase, RunRecord, ServiceSpec};
pub use execution::{Dispatch, ExecutionEvent, FleetEngine, FleetHandle, PipelineOrchestrator, RunPolicy};
pub use topology::{FleetTopology, FleetTopologyBuilder};
