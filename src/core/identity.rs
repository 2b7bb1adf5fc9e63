//! Per-stage execution identities
//!
//! Each pipeline stage acts through its own [`ExecutionIdentity`], a set of
//! grants confined to the owning service's resources. Grants are checked
//! against the service's [`ServiceScope`] when the identity is built, so an
//! identity that could reach another service's namespace never exists.

use crate::core::error::ScopeViolation;
use crate::core::naming::ResourceNames;
use crate::core::state::StageKind;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// A permission an identity may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Action {
    ObjectGet,
    ObjectPut,
    RegistryPull,
    RegistryPush,
    RegistryAuthToken,
    BuildStart,
    BuildPoll,
    BuildStop,
    ServiceUpdate,
    ServiceDescribe,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ObjectGet => "s3:GetObject",
            Action::ObjectPut => "s3:PutObject",
            Action::RegistryPull => "ecr:BatchGetImage",
            Action::RegistryPush => "ecr:PutImage",
            Action::RegistryAuthToken => "ecr:GetAuthorizationToken",
            Action::BuildStart => "codebuild:StartBuild",
            Action::BuildPoll => "codebuild:BatchGetBuilds",
            Action::BuildStop => "codebuild:StopBuild",
            Action::ServiceUpdate => "ecs:UpdateService",
            Action::ServiceDescribe => "ecs:DescribeServices",
        }
    }

    /// Actions that address no service's resources
    pub fn is_account_wide(&self) -> bool {
        matches!(self, Action::RegistryAuthToken)
    }

    fn applies_to(&self, pattern: &ResourcePattern) -> bool {
        match pattern {
            ResourcePattern::ArtifactNamespace { .. } => {
                matches!(self, Action::ObjectGet | Action::ObjectPut)
            }
            ResourcePattern::Repository(_) => {
                matches!(self, Action::RegistryPull | Action::RegistryPush)
            }
            ResourcePattern::BuildProject(_) => {
                matches!(self, Action::BuildStart | Action::BuildPoll | Action::BuildStop)
            }
            ResourcePattern::ComputeService { .. } => {
                matches!(self, Action::ServiceUpdate | Action::ServiceDescribe)
            }
            ResourcePattern::AccountWide => self.is_account_wide(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resources a grant covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ResourcePattern {
    /// Every object under `namespace` (which ends in `/`) in `bucket`
    ArtifactNamespace { bucket: String, namespace: String },
    Repository(String),
    BuildProject(String),
    ComputeService { cluster: String, service: String },
    /// `*`, only valid for account-wide actions
    AccountWide,
}

impl ResourcePattern {
    pub fn matches(&self, resource: &Resource) -> bool {
        match (self, resource) {
            (ResourcePattern::ArtifactNamespace { bucket, namespace }, Resource::Object { bucket: b, key }) => {
                bucket == b && key.starts_with(namespace.as_str())
            }
            (ResourcePattern::Repository(pattern), Resource::Repository(name)) => pattern == name,
            (ResourcePattern::BuildProject(pattern), Resource::BuildProject(name)) => pattern == name,
            (
                ResourcePattern::ComputeService { cluster, service },
                Resource::ComputeService { cluster: c, service: s },
            ) => cluster == c && service == s,
            (ResourcePattern::AccountWide, _) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourcePattern::ArtifactNamespace { bucket, namespace } => {
                write!(f, "s3://{}/{}*", bucket, namespace)
            }
            ResourcePattern::Repository(name) => write!(f, "repository/{}", name),
            ResourcePattern::BuildProject(name) => write!(f, "project/{}", name),
            ResourcePattern::ComputeService { cluster, service } => {
                write!(f, "service/{}/{}", cluster, service)
            }
            ResourcePattern::AccountWide => f.write_str("*"),
        }
    }
}

/// A concrete resource a collaborator call touches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Object { bucket: String, key: String },
    Repository(String),
    BuildProject(String),
    ComputeService { cluster: String, service: String },
    Account,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Object { bucket, key } => write!(f, "s3://{}/{}", bucket, key),
            Resource::Repository(name) => write!(f, "repository/{}", name),
            Resource::BuildProject(name) => write!(f, "project/{}", name),
            Resource::ComputeService { cluster, service } => write!(f, "service/{}/{}", cluster, service),
            Resource::Account => f.write_str("account"),
        }
    }
}

/// One permission set on one resource pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Grant {
    pub actions: BTreeSet<Action>,
    pub resource: ResourcePattern,
}

/// Raised when a stage attempts a call its identity does not cover
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{identity} is not permitted to {action} on {resource}")]
pub struct AccessDenied {
    pub identity: String,
    pub action: Action,
    pub resource: String,
}

/// The capability set one stage of one pipeline acts with
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionIdentity {
    pub name: String,
    pub owner: String,
    pub stage: StageKind,
    grants: Vec<Grant>,
}

impl ExecutionIdentity {
    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }

    pub fn permits(&self, action: Action, resource: &Resource) -> bool {
        self.grants
            .iter()
            .any(|g| g.actions.contains(&action) && g.resource.matches(resource))
    }

    pub fn authorize(&self, action: Action, resource: &Resource) -> Result<(), AccessDenied> {
        if self.permits(action, resource) {
            Ok(())
        } else {
            Err(AccessDenied {
                identity: self.name.clone(),
                action,
                resource: resource.to_string(),
            })
        }
    }
}

/// The resources one service owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceScope {
    pub service: String,
    pub bucket: String,
    pub artifact_prefix: String,
    pub repository: String,
    pub build_project: String,
    pub cluster: String,
    pub compute_service: String,
}

impl ServiceScope {
    pub fn from_names(names: &ResourceNames) -> Self {
        Self {
            service: names.service.clone(),
            bucket: names.bucket.clone(),
            artifact_prefix: names.artifact_prefix.clone(),
            repository: names.repository.clone(),
            build_project: names.build_project.clone(),
            cluster: names.cluster.clone(),
            compute_service: names.compute_service.clone(),
        }
    }

    fn contains(&self, pattern: &ResourcePattern) -> Result<(), String> {
        match pattern {
            ResourcePattern::ArtifactNamespace { bucket, namespace } => {
                if bucket != &self.bucket {
                    return Err(format!("bucket '{}' is not the fleet artifact bucket", bucket));
                }
                if !namespace.ends_with('/') || !namespace.starts_with(self.artifact_prefix.as_str()) {
                    return Err(format!(
                        "namespace '{}' is outside '{}'",
                        namespace, self.artifact_prefix
                    ));
                }
                Ok(())
            }
            ResourcePattern::Repository(name) if name == &self.repository => Ok(()),
            ResourcePattern::Repository(name) => {
                Err(format!("repository '{}' belongs to another service", name))
            }
            ResourcePattern::BuildProject(name) if name == &self.build_project => Ok(()),
            ResourcePattern::BuildProject(name) => {
                Err(format!("build project '{}' belongs to another service", name))
            }
            ResourcePattern::ComputeService { cluster, service }
                if cluster == &self.cluster && service == &self.compute_service =>
            {
                Ok(())
            }
            ResourcePattern::ComputeService { service, .. } => {
                Err(format!("compute service '{}' belongs to another service", service))
            }
            ResourcePattern::AccountWide => Ok(()),
        }
    }
}

/// Assembles an identity, validating every grant against the owning scope
#[derive(Debug, Clone)]
pub struct IdentityBuilder {
    name: String,
    stage: StageKind,
    scope: ServiceScope,
    grants: Vec<Grant>,
}

impl IdentityBuilder {
    pub fn new(name: impl Into<String>, stage: StageKind, scope: ServiceScope) -> Self {
        Self {
            name: name.into(),
            stage,
            scope,
            grants: Vec::new(),
        }
    }

    pub fn grant(mut self, actions: impl IntoIterator<Item = Action>, resource: ResourcePattern) -> Self {
        self.grants.push(Grant {
            actions: actions.into_iter().collect(),
            resource,
        });
        self
    }

    pub fn build(self) -> Result<ExecutionIdentity, ScopeViolation> {
        for grant in &self.grants {
            let violation = |reason: String| ScopeViolation {
                identity: self.name.clone(),
                resource: grant.resource.to_string(),
                reason,
            };

            if grant.actions.is_empty() {
                return Err(violation("grant has no actions".to_string()));
            }
            if let Some(action) = grant.actions.iter().find(|a| !a.applies_to(&grant.resource)) {
                let reason = if grant.resource == ResourcePattern::AccountWide {
                    format!("{} must be scoped to a single service", action)
                } else {
                    format!("{} does not apply to this resource", action)
                };
                return Err(violation(reason));
            }
            self.scope.contains(&grant.resource).map_err(violation)?;
        }

        Ok(ExecutionIdentity {
            name: self.name,
            owner: self.scope.service,
            stage: self.stage,
            grants: self.grants,
        })
    }
}

/// The three identities of one pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageIdentities {
    pub source: ExecutionIdentity,
    pub build: ExecutionIdentity,
    pub deploy: ExecutionIdentity,
}

impl StageIdentities {
    pub fn for_stage(&self, stage: StageKind) -> &ExecutionIdentity {
        match stage {
            StageKind::Source => &self.source,
            StageKind::Build => &self.build,
            StageKind::Deploy => &self.deploy,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutionIdentity> {
        [&self.source, &self.build, &self.deploy].into_iter()
    }
}

/// Derives the minimal stage identities for a service
pub struct IdentityScoper {
    names: ResourceNames,
}

impl IdentityScoper {
    pub fn new(names: &ResourceNames) -> Self {
        Self { names: names.clone() }
    }

    pub fn scope(&self) -> ServiceScope {
        ServiceScope::from_names(&self.names)
    }

    /// Start an identity for `stage`, used for the standard grants and for
    /// any additional grant requested on top of them
    pub fn builder(&self, stage: StageKind) -> IdentityBuilder {
        let name = match stage {
            StageKind::Source => &self.names.source_role,
            StageKind::Build => &self.names.build_role,
            StageKind::Deploy => &self.names.deploy_role,
        };
        IdentityBuilder::new(name.clone(), stage, self.scope())
    }

    pub fn derive(&self) -> Result<StageIdentities, ScopeViolation> {
        let names = &self.names;
        let namespace = ResourcePattern::ArtifactNamespace {
            bucket: names.bucket.clone(),
            namespace: names.artifact_prefix.clone(),
        };

        let source = self
            .builder(StageKind::Source)
            .grant([Action::ObjectGet], namespace.clone())
            .build()?;

        let build = self
            .builder(StageKind::Build)
            .grant([Action::ObjectGet, Action::ObjectPut], namespace)
            .grant(
                [Action::RegistryPull, Action::RegistryPush],
                ResourcePattern::Repository(names.repository.clone()),
            )
            .grant([Action::RegistryAuthToken], ResourcePattern::AccountWide)
            .grant(
                [Action::BuildStart, Action::BuildPoll, Action::BuildStop],
                ResourcePattern::BuildProject(names.build_project.clone()),
            )
            .build()?;

        let deploy = self
            .builder(StageKind::Deploy)
            .grant(
                [Action::ServiceUpdate, Action::ServiceDescribe],
                ResourcePattern::ComputeService {
                    cluster: names.cluster.clone(),
                    service: names.compute_service.clone(),
                },
            )
            .build()?;

        Ok(StageIdentities { source, build, deploy })
    }
}
