//! Pipeline domain model

use crate::core::{
    artifact::{ArtifactKind, ArtifactSlot, BuildSpec},
    config::{FleetConfig, ServiceSpec},
    error::ScopeViolation,
    identity::{IdentityScoper, StageIdentities},
    naming::ResourceNames,
    state::{RunPhase, RunRecord, StageKind},
    trigger::TriggerRule,
};
use serde::Serialize;
use std::collections::BTreeMap;

pub const ENV_REGION: &str = "ECR_REGION";
pub const ENV_REPO_NAME: &str = "ECR_REPO_NAME";
pub const ENV_PROJECT_NAME: &str = "GIT_PROJECT_NAME";

/// One stage of a pipeline and its artifact contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub kind: StageKind,
    pub action: String,
    pub input: Option<ArtifactKind>,
    pub output: Option<ArtifactKind>,
    /// Name of the identity the stage acts with
    pub identity: String,
}

/// The build project a pipeline's Build stage drives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildProject {
    pub name: String,
    pub repository: String,
    /// Container builds need a privileged environment
    pub privileged: bool,
    pub environment: BTreeMap<String, String>,
    #[serde(skip)]
    pub build_spec: BuildSpec,
}

/// The running compute service a pipeline deploys to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployTarget {
    pub cluster: String,
    pub service: String,
    pub container: String,
}

/// A service's Source → Build → Deploy pipeline
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub service: String,
    pub names: ResourceNames,
    pub trigger: TriggerRule,
    pub identities: StageIdentities,
    pub build_project: BuildProject,
    pub deploy_target: DeployTarget,
    pub source_slot: ArtifactSlot,
    pub build_slot: ArtifactSlot,

    /// Most recent run, if any
    pub last_run: Option<RunRecord>,

    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(fleet: &FleetConfig, spec: &ServiceSpec, build_spec: &BuildSpec) -> Result<Self, ScopeViolation> {
        let names = ResourceNames::derive(fleet, spec);
        let identities = IdentityScoper::new(&names).derive()?;

        let stages = vec![
            Stage {
                kind: StageKind::Source,
                action: "DownloadSourceCode".to_string(),
                input: None,
                output: Some(ArtifactKind::Source),
                identity: identities.source.name.clone(),
            },
            Stage {
                kind: StageKind::Build,
                action: "BuildAndPushImage".to_string(),
                input: Some(ArtifactKind::Source),
                output: Some(ArtifactKind::Build),
                identity: identities.build.name.clone(),
            },
            Stage {
                kind: StageKind::Deploy,
                action: "DeployToCompute".to_string(),
                input: Some(ArtifactKind::Build),
                output: None,
                identity: identities.deploy.name.clone(),
            },
        ];

        let mut environment = BTreeMap::new();
        environment.insert(ENV_REGION.to_string(), fleet.region.clone());
        environment.insert(ENV_REPO_NAME.to_string(), names.repository.clone());
        environment.insert(ENV_PROJECT_NAME.to_string(), spec.name.clone());

        Ok(Pipeline {
            name: names.pipeline.clone(),
            service: spec.name.clone(),
            trigger: TriggerRule::new(&spec.name, &names.bucket, &names.source_key),
            identities,
            build_project: BuildProject {
                name: names.build_project.clone(),
                repository: names.repository.clone(),
                privileged: true,
                environment,
                build_spec: build_spec.clone(),
            },
            deploy_target: DeployTarget {
                cluster: names.cluster.clone(),
                service: names.compute_service.clone(),
                container: names.container.clone(),
            },
            source_slot: ArtifactSlot::new(&names.source_slot, ArtifactKind::Source),
            build_slot: ArtifactSlot::new(&names.build_slot, ArtifactKind::Build),
            last_run: None,
            stages,
            names,
        })
    }

    /// Stages in execution order
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, kind: StageKind) -> &Stage {
        // Stages are always built in StageKind::ORDER
        match kind {
            StageKind::Source => &self.stages[0],
            StageKind::Build => &self.stages[1],
            StageKind::Deploy => &self.stages[2],
        }
    }

    /// Current phase: that of the last run, or `Idle`
    pub fn phase(&self) -> RunPhase {
        self.last_run.as_ref().map(|r| r.phase).unwrap_or(RunPhase::Idle)
    }
}
