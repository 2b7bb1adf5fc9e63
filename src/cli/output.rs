//! CLI output formatting

use crate::{
    core::RunPhase,
    execution::{Dispatch, ExecutionEvent},
    persistence::RunSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Create a spinner shown while runs are in flight
pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        spinner.set_style(template);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Format a run phase for display
pub fn format_phase(phase: RunPhase) -> String {
    match phase {
        RunPhase::Idle => style("IDLE").dim().to_string(),
        RunPhase::Sourcing => style("SOURCING").yellow().to_string(),
        RunPhase::Building => style("BUILDING").yellow().to_string(),
        RunPhase::Deploying => style("DEPLOYING").yellow().to_string(),
        RunPhase::Succeeded => style("SUCCEEDED").green().to_string(),
        RunPhase::Failed => style("FAILED").red().to_string(),
    }
}

/// Format run summary for display
pub fn format_run_summary(summary: &RunSummary) -> String {
    let status_icon = match summary.status {
        RunPhase::Succeeded => CHECK,
        RunPhase::Failed => CROSS,
        _ => SPINNER,
    };

    let mut line = format!(
        "{} {} - {} - {} - {}",
        status_icon,
        style(&summary.run_id.to_string()[..8]).dim(),
        style(&summary.service).bold(),
        format_phase(summary.status),
        style(summary.started_at.format("%Y-%m-%d %H:%M:%S")).dim()
    );
    if let (Some(stage), Some(cause)) = (summary.failed_stage, &summary.cause) {
        line.push_str(&format!(" ({}: {})", stage, style(cause).red()));
    }
    line
}

pub fn format_dispatch(dispatch: &Dispatch) -> String {
    match dispatch {
        Dispatch::Started(service) => format!("{} {} started", ROCKET, style(service).bold()),
        Dispatch::Queued(service) => format!("{} {} busy, run queued", INFO, style(service).bold()),
        Dispatch::Coalesced(service) => {
            format!("{} {} already has a pending run", INFO, style(service).bold())
        }
        Dispatch::Unmatched => format!("{} No pipeline matches this upload", WARN),
    }
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::TriggerReceived { key, dispatch } => {
            format!("{} ({})", format_dispatch(dispatch), style(key).dim())
        }
        ExecutionEvent::RunStarted {
            run_id,
            service,
            trigger_key,
        } => format!(
            "{} Run {} of {} for {}",
            ROCKET,
            style(&run_id.to_string()[..8]).dim(),
            style(service).bold(),
            style(trigger_key).cyan()
        ),
        ExecutionEvent::PhaseChanged { service, from, to, .. } => format!(
            "{} {}: {} → {}",
            SPINNER,
            style(service).cyan(),
            format_phase(*from),
            format_phase(*to)
        ),
        ExecutionEvent::SourceRetrying {
            service,
            attempt,
            max_attempts,
        } => format!(
            "{} {} source not available yet (attempt {}/{})",
            WARN,
            style(service).yellow(),
            attempt,
            max_attempts
        ),
        ExecutionEvent::BuildStarted { service, build_id } => {
            format!("{} {} build {}", INFO, style(service).cyan(), style(build_id).dim())
        }
        ExecutionEvent::RolloutStarted { service, image, .. } => {
            format!("{} {} rolling out {}", INFO, style(service).cyan(), style(image).dim())
        }
        ExecutionEvent::RunCompleted {
            service,
            phase,
            failure,
            ..
        } => match failure {
            Some(failure) => format!("{} {} {}: {}", CROSS, style(service).bold(), format_phase(*phase), style(failure).red()),
            None => format!("{} {} {}", CHECK, style(service).bold(), format_phase(*phase)),
        },
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
