//! Core domain models
//!
//! This module defines the fleet configuration, derived resource names,
//! execution identities, artifacts, trigger rules and the pipeline model.

pub mod artifact;
pub mod config;
pub mod error;
pub mod identity;
pub mod naming;
pub mod pipeline;
pub mod state;
pub mod trigger;

pub use artifact::*;
pub use config::{FleetConfig, ServiceSpec};
pub use error::*;
pub use identity::*;
pub use pipeline::*;
pub use state::*;
pub use trigger::*;
