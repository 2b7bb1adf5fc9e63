//! In-memory collaborators (for simulation, testing or ephemeral use)

use crate::collaborators::{
    BuildEnvironment, BuildId, BuildRequest, BuildStatus, CollaboratorError, ComputeService,
    ContainerRegistry, ObjectStore, RolloutId, RolloutStatus, ServiceRef,
};
use crate::core::{image_definitions, ENV_PROJECT_NAME, ENV_REPO_NAME};
use crate::topology::ComputeTarget;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Object store holding one bucket in memory.
///
/// Objects can be made visible only after a number of reads, to mimic
/// a notification arriving before the object is readable.
pub struct InMemoryObjectStore {
    bucket: String,
    objects: RwLock<HashMap<String, Vec<u8>>>,
    hidden_reads: Mutex<HashMap<String, usize>>,
    get_calls: AtomicUsize,
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
            hidden_reads: Mutex::new(HashMap::new()),
            get_calls: AtomicUsize::new(0),
        }
    }

    /// Store an object that answers `NotFound` to the next `hidden_reads` gets
    pub async fn put_eventually(&self, key: &str, bytes: Vec<u8>, hidden_reads: usize) {
        self.hidden_reads.lock().await.insert(key.to_string(), hidden_reads);
        self.objects.write().await.insert(key.to_string(), bytes);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CollaboratorError> {
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CollaboratorError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);

        let mut hidden = self.hidden_reads.lock().await;
        if let Some(remaining) = hidden.get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CollaboratorError::NotFound(format!("s3://{}/{}", self.bucket, key)));
            }
        }
        drop(hidden);

        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("s3://{}/{}", self.bucket, key)))
    }
}

/// Registry keeping pushed image references per repository
pub struct InMemoryRegistry {
    host: String,
    images: RwLock<HashMap<String, Vec<String>>>,
}

impl InMemoryRegistry {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            images: RwLock::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn images(&self, repository: &str) -> Vec<String> {
        self.images.read().await.get(repository).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ContainerRegistry for InMemoryRegistry {
    async fn push(&self, repository: &str, image: &str) -> Result<(), CollaboratorError> {
        self.images
            .write()
            .await
            .entry(repository.to_string())
            .or_default()
            .push(image.to_string());
        Ok(())
    }

    async fn auth_token(&self) -> Result<String, CollaboratorError> {
        Ok(format!("token-{}", uuid::Uuid::new_v4().simple()))
    }
}

/// How a simulated build ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeed,
    Fail { reason: String },
    /// Never completes; only a stop or timeout ends it
    Hang,
}

struct BuildJob {
    request: BuildRequest,
    outcome: BuildOutcome,
    polls: usize,
    stopped: bool,
}

/// Build environment that "builds" by pushing a tagged image to a registry
pub struct SimulatedBuildEnvironment {
    registry: Arc<InMemoryRegistry>,
    polls_until_done: usize,
    outcomes: Mutex<HashMap<String, BuildOutcome>>,
    jobs: Mutex<HashMap<BuildId, BuildJob>>,
    started: Mutex<Vec<BuildRequest>>,
    stopped: Mutex<Vec<BuildId>>,
    counter: AtomicUsize,
}

impl SimulatedBuildEnvironment {
    pub fn new(registry: Arc<InMemoryRegistry>) -> Self {
        Self {
            registry,
            polls_until_done: 1,
            outcomes: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }

    /// Number of polls a build stays in progress
    pub fn with_polls_until_done(mut self, polls: usize) -> Self {
        self.polls_until_done = polls;
        self
    }

    /// Outcome for builds of `project` started from now on (default: succeed)
    pub async fn set_outcome(&self, project: &str, outcome: BuildOutcome) {
        self.outcomes.lock().await.insert(project.to_string(), outcome);
    }

    pub async fn started(&self) -> Vec<BuildRequest> {
        self.started.lock().await.clone()
    }

    pub async fn stopped(&self) -> Vec<BuildId> {
        self.stopped.lock().await.clone()
    }
}

#[async_trait]
impl BuildEnvironment for SimulatedBuildEnvironment {
    async fn start(&self, request: BuildRequest) -> Result<BuildId, CollaboratorError> {
        if request.registry_token.is_empty() {
            return Err(CollaboratorError::Rejected("missing registry credentials".to_string()));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = BuildId(format!("{}:{}", request.project, n));
        debug!("Simulated build {} started", id);

        let outcome = self
            .outcomes
            .lock()
            .await
            .get(&request.project)
            .cloned()
            .unwrap_or(BuildOutcome::Succeed);

        self.started.lock().await.push(request.clone());
        self.jobs.lock().await.insert(
            id.clone(),
            BuildJob {
                request,
                outcome,
                polls: 0,
                stopped: false,
            },
        );
        Ok(id)
    }

    async fn poll(&self, build: &BuildId) -> Result<BuildStatus, CollaboratorError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(build)
            .ok_or_else(|| CollaboratorError::NotFound(format!("build {}", build)))?;

        let log_ref = format!("logs/{}", build);
        if job.stopped {
            return Ok(BuildStatus::Failed {
                reason: "build stopped".to_string(),
                log_ref,
            });
        }

        job.polls += 1;
        if job.polls < self.polls_until_done {
            return Ok(BuildStatus::InProgress);
        }

        match job.outcome.clone() {
            BuildOutcome::Succeed => {
                let repository = job.request.environment.get(ENV_REPO_NAME).cloned().unwrap_or_default();
                let container = job.request.environment.get(ENV_PROJECT_NAME).cloned().unwrap_or_default();
                let tag = build.0.rsplit(':').next().unwrap_or("latest");
                let image = format!("{}/{}:build-{}", self.registry.host(), repository, tag);
                self.registry.push(&repository, &image).await?;
                Ok(BuildStatus::Succeeded {
                    output: image_definitions(&container, &image),
                })
            }
            BuildOutcome::Fail { reason } => Ok(BuildStatus::Failed { reason, log_ref }),
            BuildOutcome::Hang => Ok(BuildStatus::InProgress),
        }
    }

    async fn stop(&self, build: &BuildId) -> Result<(), CollaboratorError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(build)
            .ok_or_else(|| CollaboratorError::NotFound(format!("build {}", build)))?;
        job.stopped = true;
        self.stopped.lock().await.push(build.clone());
        Ok(())
    }
}

/// How a simulated rollout ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutOutcome {
    Stabilize,
    Fail { reason: String },
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedService {
    pub image: Option<String>,
    pub desired_count: u32,
    /// Incremented on every stabilized rollout
    pub revision: u32,
}

struct RolloutJob {
    service: ServiceRef,
    image: String,
    polls: usize,
}

/// Compute service tracking which image each service runs
pub struct InMemoryComputeService {
    services: RwLock<HashMap<ServiceRef, DeployedService>>,
    rollouts: Mutex<HashMap<RolloutId, RolloutJob>>,
    outcome: Mutex<RolloutOutcome>,
    polls_until_stable: usize,
    updates: Mutex<Vec<(ServiceRef, String)>>,
    counter: AtomicUsize,
}

impl InMemoryComputeService {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            rollouts: Mutex::new(HashMap::new()),
            outcome: Mutex::new(RolloutOutcome::Stabilize),
            polls_until_stable: 1,
            updates: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn with_polls_until_stable(mut self, polls: usize) -> Self {
        self.polls_until_stable = polls;
        self
    }

    pub async fn set_outcome(&self, outcome: RolloutOutcome) {
        *self.outcome.lock().await = outcome;
    }

    /// Register a running service, as the provisioning collaborator would
    pub async fn provision(&self, target: &ComputeTarget) {
        self.services.write().await.insert(
            ServiceRef {
                cluster: target.cluster.clone(),
                service: target.service_id.clone(),
            },
            DeployedService {
                image: None,
                desired_count: target.desired_count,
                revision: 0,
            },
        );
    }

    pub async fn service(&self, service: &ServiceRef) -> Option<DeployedService> {
        self.services.read().await.get(service).cloned()
    }

    pub async fn updates(&self) -> Vec<(ServiceRef, String)> {
        self.updates.lock().await.clone()
    }
}

impl Default for InMemoryComputeService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputeService for InMemoryComputeService {
    async fn update_image(&self, service: &ServiceRef, image: &str) -> Result<RolloutId, CollaboratorError> {
        if !self.services.read().await.contains_key(service) {
            return Err(CollaboratorError::NotFound(format!("service {}", service)));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = RolloutId(format!("{}/rollout-{}", service, n));
        self.updates.lock().await.push((service.clone(), image.to_string()));
        self.rollouts.lock().await.insert(
            id.clone(),
            RolloutJob {
                service: service.clone(),
                image: image.to_string(),
                polls: 0,
            },
        );
        Ok(id)
    }

    async fn rollout_status(&self, rollout: &RolloutId) -> Result<RolloutStatus, CollaboratorError> {
        let mut rollouts = self.rollouts.lock().await;
        let job = rollouts
            .get_mut(rollout)
            .ok_or_else(|| CollaboratorError::NotFound(format!("rollout {}", rollout)))?;

        job.polls += 1;
        if job.polls < self.polls_until_stable {
            return Ok(RolloutStatus::InProgress);
        }

        match self.outcome.lock().await.clone() {
            RolloutOutcome::Stabilize => {
                if let Some(deployed) = self.services.write().await.get_mut(&job.service) {
                    if deployed.image.as_deref() != Some(job.image.as_str()) {
                        deployed.image = Some(job.image.clone());
                        deployed.revision += 1;
                    }
                }
                Ok(RolloutStatus::Stable)
            }
            RolloutOutcome::Fail { reason } => Ok(RolloutStatus::Failed { reason }),
            RolloutOutcome::Hang => Ok(RolloutStatus::InProgress),
        }
    }
}
