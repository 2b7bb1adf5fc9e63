//! Pipeline orchestrator - drives one run through Source, Build and Deploy

use crate::{
    collaborators::{BuildId, BuildRequest, BuildStatus, CollaboratorError, Collaborators, RolloutStatus, ServiceRef},
    core::{
        image_for_container, AccessDenied, Action, FailureKind, ObjectCreatedEvent, Pipeline, Resource, RunPhase,
        RunRecord, StageKind,
    },
    execution::{engine::EventHandlers, ExecutionEvent, RunPolicy},
};
use std::future::Future;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Why a stage stopped the run
#[derive(Debug, Clone, PartialEq, Eq)]
struct StageError {
    kind: FailureKind,
    cause: String,
    log_ref: Option<String>,
}

impl StageError {
    fn new(kind: FailureKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            cause: cause.into(),
            log_ref: None,
        }
    }

    fn with_log(mut self, log_ref: impl Into<String>) -> Self {
        self.log_ref = Some(log_ref.into());
        self
    }
}

impl From<AccessDenied> for StageError {
    fn from(denied: AccessDenied) -> Self {
        StageError::new(FailureKind::AccessDenied, denied.to_string())
    }
}

/// Channels a worker uses to steer and observe a run
pub struct RunControl {
    /// Bumped to cancel the active run
    pub cancel: watch::Receiver<u64>,
    /// Phase of the pipeline, published on every transition
    pub phase: watch::Sender<RunPhase>,
}

impl RunControl {
    pub fn new(cancel: watch::Receiver<u64>, phase: watch::Sender<RunPhase>) -> Self {
        Self { cancel, phase }
    }
}

/// Runs pipelines against a set of collaborators
#[derive(Clone)]
pub struct PipelineOrchestrator {
    collaborators: Collaborators,
    policy: RunPolicy,
    handlers: EventHandlers,
}

impl PipelineOrchestrator {
    pub fn new(collaborators: Collaborators, policy: RunPolicy) -> Self {
        Self {
            collaborators,
            policy,
            handlers: EventHandlers::default(),
        }
    }

    pub fn with_handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Execute one run triggered by `event`, returning its terminal record.
    ///
    /// Stage failures never escape as errors; they end the run `Failed`.
    pub async fn run(&self, pipeline: &mut Pipeline, event: &ObjectCreatedEvent, control: &mut RunControl) -> RunRecord {
        let RunControl { cancel, phase } = control;
        // Cancellations requested before this run started do not apply to it
        cancel.borrow_and_update();

        let mut record = RunRecord::new(&pipeline.service, &pipeline.name, event.key());
        info!("Starting run {} of {} for {}", record.run_id, pipeline.name, event.key());
        self.handlers.emit(ExecutionEvent::RunStarted {
            run_id: record.run_id,
            service: pipeline.service.clone(),
            trigger_key: event.key().to_string(),
        });

        pipeline.source_slot.clear();
        pipeline.build_slot.clear();

        let mut active_build: Option<BuildId> = None;
        let result = self
            .execute(pipeline, event, &mut record, phase, cancel, &mut active_build)
            .await;

        if let Err(failure) = result {
            if let Some(build) = active_build.take() {
                self.release_build(pipeline, &build).await;
            }
            self.fail(&mut record, phase, failure);
        }

        self.handlers.emit(ExecutionEvent::RunCompleted {
            run_id: record.run_id,
            service: record.service.clone(),
            phase: record.phase,
            failure: record.failure.clone(),
        });
        pipeline.last_run = Some(record.clone());
        record
    }

    async fn execute(
        &self,
        pipeline: &mut Pipeline,
        event: &ObjectCreatedEvent,
        record: &mut RunRecord,
        phase: &watch::Sender<RunPhase>,
        cancel: &mut watch::Receiver<u64>,
        active_build: &mut Option<BuildId>,
    ) -> Result<(), StageError> {
        self.transition(record, phase, RunPhase::Sourcing);
        self.source(pipeline, event.key(), cancel).await?;

        self.transition(record, phase, RunPhase::Building);
        let image = self.build(pipeline, cancel, active_build).await?;

        self.transition(record, phase, RunPhase::Deploying);
        record.image_ref = Some(image.clone());
        self.deploy(pipeline, &image, cancel).await?;

        self.transition(record, phase, RunPhase::Succeeded);
        Ok(())
    }

    fn transition(&self, record: &mut RunRecord, phase: &watch::Sender<RunPhase>, next: RunPhase) {
        let from = record.phase;
        if !record.advance(next) {
            error!("Rejected transition {} -> {} for {}", from, next, record.pipeline);
            return;
        }
        info!("{}: {} -> {}", record.pipeline, from, next);
        phase.send_replace(next);
        self.handlers.emit(ExecutionEvent::PhaseChanged {
            run_id: record.run_id,
            service: record.service.clone(),
            from,
            to: next,
        });
    }

    fn fail(&self, record: &mut RunRecord, phase: &watch::Sender<RunPhase>, failure: StageError) {
        let from = record.phase;
        if !record.fail(failure.kind, failure.cause.clone(), failure.log_ref) {
            return;
        }
        error!("{} failed in {}: {:?}: {}", record.pipeline, from, failure.kind, failure.cause);
        phase.send_replace(RunPhase::Failed);
        self.handlers.emit(ExecutionEvent::PhaseChanged {
            run_id: record.run_id,
            service: record.service.clone(),
            from,
            to: RunPhase::Failed,
        });
    }

    /// Fetch the uploaded bundle into the source slot, retrying while the
    /// object is not yet readable
    async fn source(
        &self,
        pipeline: &mut Pipeline,
        key: &str,
        cancel: &mut watch::Receiver<u64>,
    ) -> Result<(), StageError> {
        let store = &self.collaborators.store;
        let identity = pipeline.identities.for_stage(StageKind::Source);
        identity.authorize(
            Action::ObjectGet,
            &Resource::Object {
                bucket: store.bucket().to_string(),
                key: key.to_string(),
            },
        )?;

        let retry = &self.policy.source_retry;
        let mut attempt = 1;
        loop {
            match until_cancelled(cancel, async { Ok(store.get(key).await) }).await? {
                Ok(payload) => {
                    debug!("Fetched {} ({} bytes) for {}", key, payload.len(), pipeline.name);
                    pipeline.source_slot.populate(key, payload);
                    return Ok(());
                }
                Err(CollaboratorError::Rejected(reason)) => {
                    return Err(StageError::new(
                        FailureKind::SourceUnavailable,
                        format!("{} rejected: {}", key, reason),
                    ));
                }
                Err(e) if attempt >= retry.max_attempts => {
                    return Err(StageError::new(
                        FailureKind::SourceUnavailable,
                        format!("{} unavailable after {} attempts: {}", key, attempt, e),
                    ));
                }
                Err(e) => {
                    let delay = retry.delay_after(attempt);
                    warn!("Source fetch for {} failed ({}), retrying in {:?}", pipeline.name, e, delay);
                    self.handlers.emit(ExecutionEvent::SourceRetrying {
                        service: pipeline.service.clone(),
                        attempt,
                        max_attempts: retry.max_attempts,
                    });
                    until_cancelled(cancel, async {
                        sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Run the build and return the image reference for the service's container
    async fn build(
        &self,
        pipeline: &mut Pipeline,
        cancel: &mut watch::Receiver<u64>,
        active_build: &mut Option<BuildId>,
    ) -> Result<String, StageError> {
        let identity = pipeline.identities.for_stage(StageKind::Build);
        let project = &pipeline.build_project;
        let project_resource = Resource::BuildProject(project.name.clone());

        let input = pipeline
            .source_slot
            .get()
            .cloned()
            .ok_or_else(|| StageError::new(FailureKind::BuildFailure, "source artifact is empty"))?;

        identity.authorize(Action::RegistryAuthToken, &Resource::Account)?;
        identity.authorize(Action::RegistryPush, &Resource::Repository(project.repository.clone()))?;
        let registry_token = self
            .collaborators
            .registry
            .auth_token()
            .await
            .map_err(|e| StageError::new(FailureKind::BuildFailure, format!("registry credentials: {}", e)))?;

        identity.authorize(Action::BuildStart, &project_resource)?;
        ensure_not_cancelled(cancel)?;
        // Not interruptible: once the environment accepts a build its id must
        // be recorded so a cancellation can stop it
        let request = BuildRequest {
            project: project.name.clone(),
            input,
            environment: project.environment.clone(),
            privileged: project.privileged,
            build_spec: project.build_spec.clone(),
            registry_token,
            role: identity.name.clone(),
        };
        let build_id = self
            .collaborators
            .builds
            .start(request)
            .await
            .map_err(|e| StageError::new(FailureKind::BuildFailure, format!("build did not start: {}", e)))?;

        info!("Build {} started for {}", build_id, pipeline.name);
        *active_build = Some(build_id.clone());
        self.handlers.emit(ExecutionEvent::BuildStarted {
            service: pipeline.service.clone(),
            build_id: build_id.to_string(),
        });

        identity.authorize(Action::BuildPoll, &project_resource)?;
        let output = match timeout(
            self.policy.build_timeout,
            until_cancelled(cancel, self.await_build(&build_id)),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(StageError::new(
                    FailureKind::BuildFailure,
                    format!("build {} did not finish within {:?}", build_id, self.policy.build_timeout),
                )
                .with_log(format!("build/{}", build_id)));
            }
        };
        *active_build = None;

        let artifact = pipeline.build_slot.populate(build_id.to_string(), output);
        let image = image_for_container(&artifact.payload, &pipeline.deploy_target.container)
            .map_err(|cause| StageError::new(FailureKind::BuildFailure, cause))?;
        debug!("Build {} produced image {}", build_id, image);
        Ok(image)
    }

    async fn await_build(&self, build_id: &BuildId) -> Result<Vec<u8>, StageError> {
        loop {
            let status = self
                .collaborators
                .builds
                .poll(build_id)
                .await
                .map_err(|e| StageError::new(FailureKind::BuildFailure, format!("build status: {}", e)))?;

            match status {
                BuildStatus::InProgress => sleep(self.policy.poll_interval).await,
                BuildStatus::Succeeded { output } => return Ok(output),
                BuildStatus::Failed { reason, log_ref } => {
                    return Err(StageError::new(FailureKind::BuildFailure, reason).with_log(log_ref));
                }
            }
        }
    }

    /// Stop a build the run no longer waits for
    async fn release_build(&self, pipeline: &Pipeline, build_id: &BuildId) {
        let identity = pipeline.identities.for_stage(StageKind::Build);
        if let Err(denied) = identity.authorize(Action::BuildStop, &Resource::BuildProject(pipeline.build_project.name.clone())) {
            error!("{}", denied);
            return;
        }
        match self.collaborators.builds.stop(build_id).await {
            Ok(()) => info!("Stopped build {} of {}", build_id, pipeline.name),
            Err(e) => warn!("Failed to stop build {}: {}", build_id, e),
        }
    }

    /// Point the running service at `image` and wait for the rollout to settle
    async fn deploy(&self, pipeline: &Pipeline, image: &str, cancel: &mut watch::Receiver<u64>) -> Result<(), StageError> {
        let identity = pipeline.identities.for_stage(StageKind::Deploy);
        let target = &pipeline.deploy_target;
        let resource = Resource::ComputeService {
            cluster: target.cluster.clone(),
            service: target.service.clone(),
        };
        let service = ServiceRef {
            cluster: target.cluster.clone(),
            service: target.service.clone(),
        };

        identity.authorize(Action::ServiceUpdate, &resource)?;
        ensure_not_cancelled(cancel)?;
        let rollout = self
            .collaborators
            .compute
            .update_image(&service, image)
            .await
            .map_err(|e| StageError::new(FailureKind::DeployFailure, format!("update of {} rejected: {}", service, e)))?;

        info!("Rollout {} of {} to {}", rollout, service, image);
        self.handlers.emit(ExecutionEvent::RolloutStarted {
            service: pipeline.service.clone(),
            rollout_id: rollout.to_string(),
            image: image.to_string(),
        });

        identity.authorize(Action::ServiceDescribe, &resource)?;
        let settle = async {
            loop {
                let status = self
                    .collaborators
                    .compute
                    .rollout_status(&rollout)
                    .await
                    .map_err(|e| StageError::new(FailureKind::DeployFailure, format!("rollout status: {}", e)))?;

                match status {
                    RolloutStatus::InProgress => sleep(self.policy.poll_interval).await,
                    RolloutStatus::Stable => return Ok(()),
                    RolloutStatus::Failed { reason } => {
                        return Err(StageError::new(FailureKind::DeployFailure, reason));
                    }
                }
            }
        };

        match timeout(self.policy.rollout_timeout, until_cancelled(cancel, settle)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::new(
                FailureKind::DeployFailure,
                format!("rollout {} did not stabilize within {:?}", rollout, self.policy.rollout_timeout),
            )),
        }
    }
}

/// Resolves once the cancel counter moves; never if the sender is gone
async fn cancelled(cancel: &mut watch::Receiver<u64>) {
    if cancel.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Run a wait that a cancellation may cut short.
///
/// Only waits go through here. Calls that make a collaborator allocate
/// something (a build, a rollout) always run to completion.
async fn until_cancelled<T, F>(cancel: &mut watch::Receiver<u64>, work: F) -> Result<T, StageError>
where
    F: Future<Output = Result<T, StageError>>,
{
    tokio::select! {
        result = work => result,
        _ = cancelled(cancel) => Err(StageError::new(FailureKind::Cancelled, "run cancelled")),
    }
}

/// Fail fast when a cancellation arrived since the last wait
fn ensure_not_cancelled(cancel: &watch::Receiver<u64>) -> Result<(), StageError> {
    if cancel.has_changed().unwrap_or(false) {
        return Err(StageError::new(FailureKind::Cancelled, "run cancelled"));
    }
    Ok(())
}
