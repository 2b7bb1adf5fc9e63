//! CLI command definitions

use clap::Args;

/// Validate a fleet configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to fleet YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show the derived topology
#[derive(Debug, Args, Clone)]
pub struct PlanCommand {
    /// Path to fleet YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Simulate one upload against the fleet
#[derive(Debug, Args, Clone)]
pub struct SimulateCommand {
    /// Path to fleet YAML file
    #[arg(short, long)]
    pub file: String,

    /// Source bundle to upload
    #[arg(long)]
    pub bundle: String,

    #[command(flatten)]
    pub target: UploadTarget,

    /// Build specification, overriding the configured path
    #[arg(long)]
    pub build_spec: Option<String>,

    /// Don't save runs to history
    #[arg(long)]
    pub no_history: bool,
}

/// Where the bundle is uploaded
#[derive(Debug, Args, Clone)]
#[group(required = true, multiple = false)]
pub struct UploadTarget {
    /// Upload as this service's source bundle
    #[arg(long)]
    pub service: Option<String>,

    /// Upload under an explicit object key
    #[arg(long)]
    pub key: Option<String>,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Service name to filter by
    #[arg(short, long)]
    pub service: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a single run
    #[arg(long)]
    pub run_id: Option<String>,
}
