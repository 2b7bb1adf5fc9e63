//! Test utility functions for fleet scenarios

use mimir::collaborators::{
    Collaborators, InMemoryComputeService, InMemoryObjectStore, InMemoryRegistry, ObjectStore,
    SimulatedBuildEnvironment,
};
use mimir::core::{FleetConfig, ObjectCreatedEvent};
use mimir::execution::{FleetEngine, RetryPolicy, RunPolicy};
use mimir::topology::{FleetTopology, FleetTopologyBuilder};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const BUCKET: &str = "codepipeline-mimir-cicd";
pub const REGISTRY_HOST: &str = "registry.test";

/// A fleet wired to in-memory collaborators
pub struct TestFleet {
    pub config: FleetConfig,
    pub topology: FleetTopology,
    pub store: Arc<InMemoryObjectStore>,
    pub registry: Arc<InMemoryRegistry>,
    pub builds: Arc<SimulatedBuildEnvironment>,
    pub compute: Arc<InMemoryComputeService>,
    pub policy: RunPolicy,
}

impl TestFleet {
    pub async fn from_yaml(yaml: &str) -> Self {
        let config = FleetConfig::from_yaml(yaml).expect("valid fleet config");
        let topology = FleetTopologyBuilder::new(&config).build().expect("valid topology");

        let store = Arc::new(InMemoryObjectStore::new(&config.artifact_bucket));
        let registry = Arc::new(InMemoryRegistry::new(REGISTRY_HOST));
        let builds = Arc::new(SimulatedBuildEnvironment::new(registry.clone()));
        let compute = Arc::new(InMemoryComputeService::new());
        for target in &topology.targets {
            compute.provision(target).await;
        }

        Self {
            config,
            topology,
            store,
            registry,
            builds,
            compute,
            policy: fast_policy(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.store.clone(),
            self.registry.clone(),
            self.builds.clone(),
            self.compute.clone(),
        )
    }

    pub fn engine(&self) -> FleetEngine {
        FleetEngine::new(self.topology.clone(), self.collaborators(), self.policy.clone())
    }

    /// Upload a bundle under `key` and return the matching notification
    pub async fn upload(&self, key: &str, bundle: &[u8]) -> ObjectCreatedEvent {
        self.store.put(key, bundle.to_vec()).await.expect("put succeeds");
        ObjectCreatedEvent::new(BUCKET, key)
    }
}

/// Millisecond-scale timings so scenarios finish quickly
pub fn fast_policy() -> RunPolicy {
    RunPolicy {
        source_retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        build_timeout: Duration::from_secs(5),
        rollout_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(1),
    }
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub const API_ONLY: &str = r#"
ecsServices:
  - name: api
    port: 8080
"#;

pub const TWO_SERVICES: &str = r#"
ecsServices:
  - name: svc-a
    port: 8080
  - name: svc-b
    port: 9090
    desiredCount: 2
"#;
