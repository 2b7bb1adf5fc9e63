//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, PlanCommand, SimulateCommand, ValidateCommand};
use std::ffi::OsString;

/// Per-service build-and-deploy pipelines for a container fleet
#[derive(Debug, Parser, Clone)]
#[command(name = "mimir")]
#[command(version = "0.1.0")]
#[command(about = "Per-service build-and-deploy pipelines driven by a fleet config", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Validate a fleet configuration
    Validate(ValidateCommand),

    /// Show the resources, triggers and grants derived for each service
    Plan(PlanCommand),

    /// Run the fleet against in-memory collaborators for one upload
    Simulate(SimulateCommand),

    /// Show run history
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
