//! Deterministic resource names derived from a service name
//!
//! Every identifier a pipeline touches is a pure function of the service name
//! and the fleet-level settings, so rebuilding the topology from an unchanged
//! configuration yields the same names.

use crate::core::config::{FleetConfig, ServiceSpec};
use serde::Serialize;

pub const SOURCE_OBJECT: &str = "source.zip";

/// All identifiers derived for one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceNames {
    pub service: String,
    pub pipeline: String,
    pub build_project: String,
    pub repository: String,
    pub bucket: String,
    /// Artifact namespace, always ending in `/`
    pub artifact_prefix: String,
    pub source_key: String,
    pub source_slot: String,
    pub build_slot: String,
    pub source_role: String,
    pub build_role: String,
    pub deploy_role: String,
    pub cluster: String,
    pub compute_service: String,
    pub task_family: String,
    pub container: String,
    pub log_stream: String,
    pub segment: String,
    pub security_group: String,
    pub public_host: Option<String>,
}

impl ResourceNames {
    pub fn derive(fleet: &FleetConfig, service: &ServiceSpec) -> Self {
        let name = service.name.as_str();
        Self {
            service: name.to_string(),
            pipeline: format!("{}-CICD", name),
            build_project: format!("{}-build", name),
            repository: format!("{}/{}", fleet.registry_prefix, name.to_lowercase()),
            bucket: fleet.artifact_bucket.clone(),
            artifact_prefix: format!("{}/", name),
            source_key: format!("{}/{}", name, SOURCE_OBJECT),
            source_slot: format!("{}_Artifact", name),
            build_slot: format!("{}_BuildArtifact", name),
            source_role: format!("{}-source-role", name),
            build_role: format!("{}-build-role", name),
            deploy_role: format!("{}-deploy-role", name),
            cluster: cluster_name(fleet),
            compute_service: name.to_string(),
            task_family: format!("{}-task", name),
            container: name.to_string(),
            log_stream: format!("/ecs/{}/{}", fleet.fleet_name, name),
            segment: format!("{}-segment", name),
            security_group: format!("{}-sg", name),
            public_host: service
                .public_lb
                .as_ref()
                .map(|lb| format!("{}.{}", lb.domain_head, fleet.public_domain)),
        }
    }

    /// Identifiers that must be unique across the fleet, tagged with their kind.
    ///
    /// The registry repository is compared case-folded since registries only
    /// accept lowercase names.
    pub fn unique_identifiers(&self) -> Vec<(&'static str, String)> {
        let mut ids = vec![
            ("pipeline", self.pipeline.clone()),
            ("build project", self.build_project.clone()),
            ("registry repository", self.repository.to_lowercase()),
            ("artifact prefix", self.artifact_prefix.clone()),
            ("source slot", self.source_slot.clone()),
            ("build slot", self.build_slot.clone()),
            ("role", self.source_role.clone()),
            ("role", self.build_role.clone()),
            ("role", self.deploy_role.clone()),
            ("compute service", self.compute_service.clone()),
            ("task family", self.task_family.clone()),
            ("log stream", self.log_stream.clone()),
            ("network segment", self.segment.clone()),
            ("security group", self.security_group.clone()),
        ];
        if let Some(host) = &self.public_host {
            ids.push(("public host", host.clone()));
        }
        ids
    }
}

pub fn cluster_name(fleet: &FleetConfig) -> String {
    format!("{}-cluster", fleet.fleet_name)
}
