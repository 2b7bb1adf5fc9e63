//! Pipeline execution: per-run orchestration and the fleet-wide engine

pub mod engine;
pub mod orchestrator;
pub mod retry;
pub mod router;

pub use engine::{Dispatch, EventHandler, ExecutionEvent, FleetEngine, FleetHandle};
pub use orchestrator::{PipelineOrchestrator, RunControl};
pub use retry::{RetryPolicy, RunPolicy};
pub use router::EventRouter;
