//! Run state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The three stages every pipeline runs, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    Source,
    Build,
    Deploy,
}

impl StageKind {
    pub const ORDER: [StageKind; 3] = [StageKind::Source, StageKind::Build, StageKind::Deploy];

    /// The run phase this stage executes in
    pub fn phase(&self) -> RunPhase {
        match self {
            StageKind::Source => RunPhase::Sourcing,
            StageKind::Build => RunPhase::Building,
            StageKind::Deploy => RunPhase::Deploying,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Phase of a single pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunPhase {
    Idle,
    Sourcing,
    Building,
    Deploying,
    Succeeded,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Succeeded | RunPhase::Failed)
    }

    /// A run is in flight between leaving `Idle` and reaching a terminal phase
    pub fn is_active(&self) -> bool {
        matches!(self, RunPhase::Sourcing | RunPhase::Building | RunPhase::Deploying)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        matches!(
            (self, next),
            (RunPhase::Idle, RunPhase::Sourcing)
                | (RunPhase::Sourcing, RunPhase::Building)
                | (RunPhase::Building, RunPhase::Deploying)
                | (RunPhase::Deploying, RunPhase::Succeeded)
        ) || (!self.is_terminal() && next == RunPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "Idle",
            RunPhase::Sourcing => "Sourcing",
            RunPhase::Building => "Building",
            RunPhase::Deploying => "Deploying",
            RunPhase::Succeeded => "Succeeded",
            RunPhase::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Idle" => Some(RunPhase::Idle),
            "Sourcing" => Some(RunPhase::Sourcing),
            "Building" => Some(RunPhase::Building),
            "Deploying" => Some(RunPhase::Deploying),
            "Succeeded" => Some(RunPhase::Succeeded),
            "Failed" => Some(RunPhase::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    SourceUnavailable,
    BuildFailure,
    DeployFailure,
    AccessDenied,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SourceUnavailable => "SourceUnavailable",
            FailureKind::BuildFailure => "BuildFailure",
            FailureKind::DeployFailure => "DeployFailure",
            FailureKind::AccessDenied => "AccessDenied",
            FailureKind::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SourceUnavailable" => Some(FailureKind::SourceUnavailable),
            "BuildFailure" => Some(FailureKind::BuildFailure),
            "DeployFailure" => Some(FailureKind::DeployFailure),
            "AccessDenied" => Some(FailureKind::AccessDenied),
            "Cancelled" => Some(FailureKind::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a run: the phase it failed in and a diagnosable cause
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: RunPhase,
    pub kind: FailureKind,
    pub cause: String,
    /// Build log location, when the build environment reported one
    pub log_ref: Option<String>,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} in {}: {}", self.kind, self.stage, self.cause)?;
        if let Some(log_ref) = &self.log_ref {
            write!(f, " (log: {})", log_ref)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RunPhase,
    pub to: RunPhase,
    pub at: DateTime<Utc>,
}

/// Observable record of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub service: String,
    pub pipeline: String,
    /// Object key of the upload that triggered the run
    pub trigger_key: String,
    pub phase: RunPhase,
    pub transitions: Vec<Transition>,
    pub failure: Option<StageFailure>,
    /// Image the compute service was told to adopt
    pub image_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(service: &str, pipeline: &str, trigger_key: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            service: service.to_string(),
            pipeline: pipeline.to_string(),
            trigger_key: trigger_key.to_string(),
            phase: RunPhase::Idle,
            transitions: Vec::new(),
            failure: None,
            image_ref: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move to `next`, returning false (and changing nothing) when the state
    /// machine does not allow it
    pub fn advance(&mut self, next: RunPhase) -> bool {
        if !self.phase.can_transition_to(next) {
            return false;
        }
        self.transitions.push(Transition {
            from: self.phase,
            to: next,
            at: Utc::now(),
        });
        self.phase = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    /// Fail the run from its current phase
    pub fn fail(&mut self, kind: FailureKind, cause: impl Into<String>, log_ref: Option<String>) -> bool {
        let stage = self.phase;
        if !self.advance(RunPhase::Failed) {
            return false;
        }
        self.failure = Some(StageFailure {
            stage,
            kind,
            cause: cause.into(),
            log_ref,
        });
        true
    }

    /// Phases visited, starting with the initial one
    pub fn path(&self) -> Vec<RunPhase> {
        let mut path = vec![RunPhase::Idle];
        path.extend(self.transitions.iter().map(|t| t.to));
        path
    }

    pub fn succeeded(&self) -> bool {
        self.phase == RunPhase::Succeeded
    }
}
