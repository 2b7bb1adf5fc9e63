//! Fleet engine - one worker task per pipeline, fed by routed upload events

use crate::{
    collaborators::Collaborators,
    core::{ObjectCreatedEvent, Pipeline, RunPhase, RunRecord, StageFailure},
    execution::{EventRouter, PipelineOrchestrator, RunControl, RunPolicy},
    persistence::{create_summary, PersistenceBackend},
    topology::FleetTopology,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that can occur while the fleet runs
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    TriggerReceived {
        key: String,
        dispatch: Dispatch,
    },
    RunStarted {
        run_id: Uuid,
        service: String,
        trigger_key: String,
    },
    PhaseChanged {
        run_id: Uuid,
        service: String,
        from: RunPhase,
        to: RunPhase,
    },
    SourceRetrying {
        service: String,
        attempt: u32,
        max_attempts: u32,
    },
    BuildStarted {
        service: String,
        build_id: String,
    },
    RolloutStarted {
        service: String,
        rollout_id: String,
        image: String,
    },
    RunCompleted {
        run_id: Uuid,
        service: String,
        phase: RunPhase,
        failure: Option<StageFailure>,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Handlers shared by the engine and every orchestrator it runs
#[derive(Clone, Default)]
pub struct EventHandlers(Arc<Vec<EventHandler>>);

impl EventHandlers {
    /// Emit an event to all handlers
    pub fn emit(&self, event: ExecutionEvent) {
        for handler in self.0.iter() {
            handler(event.clone());
        }
    }
}

/// What happened to an upload event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "service")]
pub enum Dispatch {
    /// The pipeline was idle and starts a run
    Started(String),
    /// The pipeline is busy; a run will follow the current one
    Queued(String),
    /// A run was already pending and will pick this upload up
    Coalesced(String),
    /// No trigger rule matched
    Unmatched,
}

impl Dispatch {
    pub fn service(&self) -> Option<&str> {
        match self {
            Dispatch::Started(s) | Dispatch::Queued(s) | Dispatch::Coalesced(s) => Some(s),
            Dispatch::Unmatched => None,
        }
    }
}

#[derive(Default)]
struct Queue {
    running: bool,
    pending: Option<ObjectCreatedEvent>,
    closed: bool,
}

/// Per-pipeline state the handle keeps
struct WorkerSlot {
    queue: Arc<Mutex<Queue>>,
    wake: Arc<Notify>,
    phase: watch::Receiver<RunPhase>,
    cancel: watch::Sender<u64>,
    task: JoinHandle<Vec<RunRecord>>,
}

/// Runs each worker keeps in memory for `FleetHandle::shutdown`
pub const DEFAULT_RUN_LOG: usize = 32;

/// Builds and starts the fleet's pipeline workers
pub struct FleetEngine {
    topology: FleetTopology,
    collaborators: Collaborators,
    policy: RunPolicy,
    handlers: Vec<EventHandler>,
    history: Option<Arc<dyn PersistenceBackend>>,
    run_log: usize,
}

impl FleetEngine {
    pub fn new(topology: FleetTopology, collaborators: Collaborators, policy: RunPolicy) -> Self {
        Self {
            topology,
            collaborators,
            policy,
            handlers: Vec::new(),
            history: None,
            run_log: DEFAULT_RUN_LOG,
        }
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&mut self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
    }

    /// Save a summary of every finished run to `store`
    pub fn with_history(mut self, store: Arc<dyn PersistenceBackend>) -> Self {
        self.history = Some(store);
        self
    }

    /// Keep at most `capacity` recent runs per service in memory; older ones
    /// survive only in the history store
    pub fn with_run_log(mut self, capacity: usize) -> Self {
        self.run_log = capacity;
        self
    }

    /// Spawn one worker per pipeline
    pub fn start(self) -> FleetHandle {
        let handlers = EventHandlers(Arc::new(self.handlers));
        let orchestrator = PipelineOrchestrator::new(self.collaborators, self.policy).with_handlers(handlers.clone());
        let router = EventRouter::from_topology(&self.topology);

        let mut workers = HashMap::new();
        for pipeline in self.topology.pipelines {
            let service = pipeline.service.clone();
            let queue = Arc::new(Mutex::new(Queue::default()));
            let wake = Arc::new(Notify::new());
            let (phase_tx, phase_rx) = watch::channel(RunPhase::Idle);
            let (cancel_tx, cancel_rx) = watch::channel(0u64);

            let task = tokio::spawn(run_worker(
                pipeline,
                orchestrator.clone(),
                RunControl::new(cancel_rx, phase_tx),
                queue.clone(),
                wake.clone(),
                self.history.clone(),
                self.run_log,
            ));

            debug!("Started worker for {}", service);
            workers.insert(
                service,
                WorkerSlot {
                    queue,
                    wake,
                    phase: phase_rx,
                    cancel: cancel_tx,
                    task,
                },
            );
        }

        info!("Fleet engine running {} pipeline(s)", workers.len());
        FleetHandle {
            router,
            workers,
            handlers,
        }
    }
}

async fn run_worker(
    mut pipeline: Pipeline,
    orchestrator: PipelineOrchestrator,
    mut control: RunControl,
    queue: Arc<Mutex<Queue>>,
    wake: Arc<Notify>,
    history: Option<Arc<dyn PersistenceBackend>>,
    run_log: usize,
) -> Vec<RunRecord> {
    let mut records = VecDeque::with_capacity(run_log.min(DEFAULT_RUN_LOG));
    let mut completed = 0usize;
    loop {
        let event = {
            let mut queue = queue.lock().await;
            match queue.pending.take() {
                Some(event) => {
                    queue.running = true;
                    Some(event)
                }
                None => {
                    queue.running = false;
                    if queue.closed {
                        break;
                    }
                    None
                }
            }
        };

        let Some(event) = event else {
            wake.notified().await;
            continue;
        };

        let record = orchestrator.run(&mut pipeline, &event, &mut control).await;
        if let Some(store) = &history {
            if let Err(e) = store.save_run(&create_summary(&record)).await {
                warn!("Failed to save run {} to history: {}", record.run_id, e);
            }
        }
        completed += 1;
        if run_log == 0 {
            continue;
        }
        if records.len() == run_log {
            records.pop_front();
        }
        records.push_back(record);
    }

    debug!("Worker for {} stopped after {} run(s)", pipeline.service, completed);
    records.into()
}

/// Handle to a running fleet
pub struct FleetHandle {
    router: EventRouter,
    workers: HashMap<String, WorkerSlot>,
    handlers: EventHandlers,
}

impl FleetHandle {
    /// Route an upload event and request a run of the matching pipeline
    pub async fn dispatch(&self, event: ObjectCreatedEvent) -> Dispatch {
        let key = event.key().to_string();
        let slot = self
            .router
            .route(&event)
            .and_then(|rule| self.workers.get(&rule.service).map(|slot| (rule.service.clone(), slot)));

        let dispatch = match slot {
            None => Dispatch::Unmatched,
            Some((service, slot)) => {
                let mut queue = slot.queue.lock().await;
                let dispatch = if queue.pending.is_some() {
                    Dispatch::Coalesced(service)
                } else if queue.running {
                    Dispatch::Queued(service)
                } else {
                    queue.running = true;
                    Dispatch::Started(service)
                };
                queue.pending = Some(event);
                drop(queue);
                slot.wake.notify_one();
                dispatch
            }
        };

        info!("Upload {}: {:?}", key, dispatch);
        self.handlers.emit(ExecutionEvent::TriggerReceived {
            key,
            dispatch: dispatch.clone(),
        });
        dispatch
    }

    /// Parse and dispatch a JSON upload event
    pub async fn dispatch_json(&self, json: &str) -> Result<Dispatch, serde_json::Error> {
        let event = ObjectCreatedEvent::from_json(json)?;
        Ok(self.dispatch(event).await)
    }

    /// Current phase of a service's pipeline
    pub fn phase(&self, service: &str) -> Option<RunPhase> {
        self.workers.get(service).map(|slot| *slot.phase.borrow())
    }

    /// Wait until a service's pipeline reaches a phase matching `predicate`
    pub async fn wait_for_phase<F>(&self, service: &str, predicate: F) -> Option<RunPhase>
    where
        F: FnMut(&RunPhase) -> bool,
    {
        let mut phase = self.workers.get(service)?.phase.clone();
        let reached = phase.wait_for(predicate).await.ok()?;
        Some(*reached)
    }

    /// Cancel the service's active run. Returns false when nothing was running.
    pub fn cancel(&self, service: &str) -> bool {
        let Some(slot) = self.workers.get(service) else {
            return false;
        };
        if !slot.phase.borrow().is_active() {
            return false;
        }
        info!("Cancelling active run of {}", service);
        slot.cancel.send_modify(|generation| *generation += 1);
        true
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    /// Let every worker finish its active and pending runs, then stop.
    ///
    /// Returns each service's most recent runs in order, up to the engine's
    /// run log capacity.
    pub async fn shutdown(self) -> HashMap<String, Vec<RunRecord>> {
        for slot in self.workers.values() {
            slot.queue.lock().await.closed = true;
            slot.wake.notify_one();
        }

        let mut runs = HashMap::new();
        for (service, slot) in self.workers {
            match slot.task.await {
                Ok(records) => {
                    runs.insert(service, records);
                }
                Err(e) => error!("Worker for {} panicked: {}", service, e),
            }
        }
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryComputeService, InMemoryObjectStore, InMemoryRegistry, ObjectStore, SimulatedBuildEnvironment};
    use crate::core::{FleetConfig, ServiceSpec};
    use crate::execution::RetryPolicy;
    use crate::persistence::InMemoryPersistence;
    use crate::topology::FleetTopologyBuilder;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn fast_policy() -> RunPolicy {
        RunPolicy {
            source_retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
            build_timeout: Duration::from_secs(5),
            rollout_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
        }
    }

    async fn engine(services: &[&str]) -> (FleetEngine, Arc<InMemoryObjectStore>) {
        let config = FleetConfig {
            services: services
                .iter()
                .enumerate()
                .map(|(i, name)| ServiceSpec::new(*name, 8000 + i as u16))
                .collect(),
            ..FleetConfig::default()
        };
        let topology = FleetTopologyBuilder::new(&config).build().unwrap();

        let store = Arc::new(InMemoryObjectStore::new(&config.artifact_bucket));
        let registry = Arc::new(InMemoryRegistry::new("registry.local"));
        let builds = Arc::new(SimulatedBuildEnvironment::new(registry.clone()));
        let compute = Arc::new(InMemoryComputeService::new());
        for target in &topology.targets {
            compute.provision(target).await;
        }

        let collaborators = Collaborators::new(store.clone(), registry, builds, compute);
        (FleetEngine::new(topology, collaborators, fast_policy()), store)
    }

    #[tokio::test]
    async fn test_dispatch_runs_matching_pipeline_only() {
        let (engine, store) = engine(&["api", "worker"]).await;
        store.put("api/source.zip", b"bundle".to_vec()).await.unwrap();
        let history = Arc::new(InMemoryPersistence::new());
        let handle = engine.with_history(history.clone()).start();

        let dispatch = handle
            .dispatch(ObjectCreatedEvent::new("codepipeline-mimir-cicd", "api/source.zip"))
            .await;
        assert_eq!(dispatch, Dispatch::Started("api".to_string()));

        let runs = handle.shutdown().await;
        assert_eq!(runs["api"].len(), 1);
        assert!(runs["api"][0].succeeded());
        assert!(runs["worker"].is_empty());
        assert_eq!(history.list_runs("api").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_upload() {
        let (engine, _store) = engine(&["api"]).await;
        let handle = engine.start();

        let dispatch = handle
            .dispatch(ObjectCreatedEvent::new("codepipeline-mimir-cicd", "worker/source.zip"))
            .await;
        assert_eq!(dispatch, Dispatch::Unmatched);
        assert_eq!(handle.phase("api"), Some(RunPhase::Idle));
        assert!(!handle.cancel("api"));

        let runs = handle.shutdown().await;
        assert!(runs["api"].is_empty());
    }

    #[tokio::test]
    async fn test_events_reach_handlers() {
        let (mut engine, store) = engine(&["api"]).await;
        store.put("api/source.zip", b"bundle".to_vec()).await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        engine.add_event_handler(move |event| {
            if let ExecutionEvent::PhaseChanged { to, .. } = event {
                sink.lock().unwrap().push(to);
            }
        });

        let handle = engine.start();
        handle
            .dispatch_json(r#"{"source":"aws.s3","detail-type":"Object Created","detail":{"bucket":{"name":"codepipeline-mimir-cicd"},"object":{"key":"api/source.zip"}}}"#)
            .await
            .unwrap();
        handle.shutdown().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![RunPhase::Sourcing, RunPhase::Building, RunPhase::Deploying, RunPhase::Succeeded]
        );
    }

    #[tokio::test]
    async fn test_run_log_keeps_most_recent_runs() {
        let (mut engine, store) = engine(&["api"]).await;
        store.put("api/source.zip", b"bundle".to_vec()).await.unwrap();

        let started = Arc::new(StdMutex::new(Vec::new()));
        let sink = started.clone();
        engine.add_event_handler(move |event| {
            if let ExecutionEvent::RunStarted { run_id, .. } = event {
                sink.lock().unwrap().push(run_id);
            }
        });
        let history = Arc::new(InMemoryPersistence::new());
        let handle = engine.with_history(history.clone()).with_run_log(2).start();

        for finished in 1..=3 {
            handle
                .dispatch(ObjectCreatedEvent::new("codepipeline-mimir-cicd", "api/source.zip"))
                .await;
            while history.list_runs("api").await.unwrap().len() < finished {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        let runs = handle.shutdown().await;
        let kept: Vec<_> = runs["api"].iter().map(|r| r.run_id).collect();
        let started = started.lock().unwrap().clone();
        assert_eq!(started.len(), 3);
        assert_eq!(kept, started[1..].to_vec());
        // Evicted runs are still in the history store
        assert_eq!(history.list_runs("api").await.unwrap().len(), 3);
    }
}
