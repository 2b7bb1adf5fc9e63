//! Fleet topology - one pipeline and compute target per configured service

use crate::core::{
    artifact::BuildSpec,
    config::{FleetConfig, ServiceSpec},
    error::TopologyError,
    identity::StageIdentities,
    naming::{cluster_name, ResourceNames},
    pipeline::{Pipeline, Stage},
    trigger::TriggerRule,
};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Container port exposed by a compute target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: String,
}

/// Externally reachable entry point for a publicly exposed service.
///
/// Only the names are derived here; wiring a load balancer is left to the
/// collaborator that materializes the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicEntryPoint {
    pub host: String,
    /// Traffic is forwarded only to this port of the service
    pub target_port: u16,
}

/// Isolated network placement for one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkSegment {
    pub name: String,
    pub service: String,
    pub security_group: String,
    /// The only port the security group admits
    pub ingress_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub name: String,
    pub segments: Vec<NetworkSegment>,
}

/// A running service the Deploy stage updates
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComputeTarget {
    pub service_id: String,
    pub cluster: String,
    pub task_family: String,
    pub container: String,
    pub cpu: u32,
    pub memory: u32,
    pub desired_count: u32,
    pub port_mapping: PortMapping,
    pub log_stream: String,
    pub segment: String,
    pub secrets: Vec<String>,
    pub public_entry: Option<PublicEntryPoint>,
}

impl ComputeTarget {
    fn new(spec: &ServiceSpec, names: &ResourceNames) -> Self {
        Self {
            service_id: names.compute_service.clone(),
            cluster: names.cluster.clone(),
            task_family: names.task_family.clone(),
            container: names.container.clone(),
            cpu: spec.cpu,
            memory: spec.memory,
            desired_count: spec.desired_count,
            port_mapping: PortMapping {
                container_port: spec.port,
                protocol: "tcp".to_string(),
            },
            log_stream: names.log_stream.clone(),
            segment: names.segment.clone(),
            secrets: spec.secrets.iter().map(|s| s.name.clone()).collect(),
            public_entry: names.public_host.as_ref().map(|host| PublicEntryPoint {
                host: host.clone(),
                target_port: spec.port,
            }),
        }
    }
}

/// Everything derived from one fleet configuration
#[derive(Debug, Clone)]
pub struct FleetTopology {
    pub fleet_name: String,
    pub bucket: String,
    pub cluster: String,
    pub network: Network,
    pub targets: Vec<ComputeTarget>,
    pub pipelines: Vec<Pipeline>,
}

impl FleetTopology {
    pub fn pipeline(&self, service: &str) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.service == service)
    }

    pub fn target(&self, service: &str) -> Option<&ComputeTarget> {
        self.targets.iter().find(|t| t.service_id == service)
    }

    pub fn trigger_rules(&self) -> Vec<TriggerRule> {
        self.pipelines.iter().map(|p| p.trigger.clone()).collect()
    }

    /// Serializable view of every derived resource
    pub fn plan(&self) -> FleetPlan {
        FleetPlan {
            fleet_name: self.fleet_name.clone(),
            bucket: self.bucket.clone(),
            cluster: self.cluster.clone(),
            network: self.network.clone(),
            services: self
                .pipelines
                .iter()
                .zip(&self.targets)
                .map(|(pipeline, target)| ServicePlan {
                    names: pipeline.names.clone(),
                    trigger: pipeline.trigger.clone(),
                    stages: pipeline.stages().to_vec(),
                    identities: pipeline.identities.clone(),
                    target: target.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetPlan {
    pub fleet_name: String,
    pub bucket: String,
    pub cluster: String,
    pub network: Network,
    pub services: Vec<ServicePlan>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServicePlan {
    pub names: ResourceNames,
    pub trigger: TriggerRule,
    pub stages: Vec<Stage>,
    pub identities: StageIdentities,
    pub target: ComputeTarget,
}

/// Builds the fleet topology from an explicit configuration value
pub struct FleetTopologyBuilder<'a> {
    config: &'a FleetConfig,
    build_spec: BuildSpec,
}

impl<'a> FleetTopologyBuilder<'a> {
    pub fn new(config: &'a FleetConfig) -> Self {
        Self {
            config,
            build_spec: BuildSpec::default(),
        }
    }

    pub fn with_build_spec(mut self, build_spec: BuildSpec) -> Self {
        self.build_spec = build_spec;
        self
    }

    pub fn build(&self) -> Result<FleetTopology, TopologyError> {
        let config = self.config;
        let mut claimed: HashMap<(&'static str, String), String> = HashMap::new();
        let mut targets = Vec::with_capacity(config.services.len());
        let mut pipelines: Vec<Pipeline> = Vec::with_capacity(config.services.len());
        let mut segments = Vec::with_capacity(config.services.len());

        for spec in &config.services {
            let names = ResourceNames::derive(config, spec);

            for (kind, identifier) in names.unique_identifiers() {
                if let Some(first) = claimed.insert((kind, identifier.clone()), spec.name.clone()) {
                    return Err(TopologyError::NamingCollision {
                        kind: kind.to_string(),
                        identifier,
                        first,
                        second: spec.name.clone(),
                    });
                }
            }

            let pipeline = Pipeline::new(config, spec, &self.build_spec)?;
            if let Some(other) = pipelines.iter().find(|p| p.trigger.overlaps(&pipeline.trigger)) {
                return Err(TopologyError::NamingCollision {
                    kind: "trigger prefix".to_string(),
                    identifier: pipeline.trigger.key_prefix.clone(),
                    first: other.service.clone(),
                    second: spec.name.clone(),
                });
            }

            debug!("Derived pipeline {} for service {}", pipeline.name, spec.name);
            segments.push(NetworkSegment {
                name: names.segment.clone(),
                service: spec.name.clone(),
                security_group: names.security_group.clone(),
                ingress_port: spec.port,
            });
            targets.push(ComputeTarget::new(spec, &names));
            pipelines.push(pipeline);
        }

        info!(
            "Built topology for fleet {}: {} pipeline(s)",
            config.fleet_name,
            pipelines.len()
        );

        Ok(FleetTopology {
            fleet_name: config.fleet_name.clone(),
            bucket: config.artifact_bucket.clone(),
            cluster: cluster_name(config),
            network: Network {
                name: format!("{}-network", config.fleet_name),
                segments,
            },
            targets,
            pipelines,
        })
    }
}
