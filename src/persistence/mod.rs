//! Persistence layer for pipeline run history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::core::{FailureKind, RunPhase, RunRecord};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Summary of a finished pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique run ID
    pub run_id: Uuid,

    pub service: String,

    /// Pipeline name
    pub pipeline: String,

    /// Object key that triggered the run
    pub trigger_key: String,

    /// Terminal phase
    pub status: RunPhase,

    /// Phase the run failed in, if it failed
    pub failed_stage: Option<RunPhase>,

    pub failure_kind: Option<FailureKind>,

    pub cause: Option<String>,

    pub log_ref: Option<String>,

    /// Image the service was moved to
    pub image_ref: Option<String>,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a run
    async fn save_run(&self, run: &RunSummary) -> Result<()>;

    /// Load a run by ID
    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>>;

    /// List runs of a service, newest first
    async fn list_runs(&self, service: &str) -> Result<Vec<RunSummary>>;

    /// List all services with recorded runs
    async fn list_services(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or ephemeral use)
pub struct InMemoryPersistence {
    runs: RwLock<HashMap<Uuid, RunSummary>>,
    by_service: RwLock<HashMap<String, Vec<Uuid>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            by_service: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        let previous = self.runs.write().await.insert(run.run_id, run.clone());
        if previous.is_none() {
            self.by_service
                .write()
                .await
                .entry(run.service.clone())
                .or_default()
                .push(run.run_id);
        }
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, service: &str) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        let by_service = self.by_service.read().await;

        let mut result: Vec<RunSummary> = by_service
            .get(service)
            .map(|ids| ids.iter().filter_map(|id| runs.get(id).cloned()).collect())
            .unwrap_or_default();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        let mut services: Vec<String> = self.by_service.read().await.keys().cloned().collect();
        services.sort();
        Ok(services)
    }
}

/// Create a summary from a run record
pub fn create_summary(record: &RunRecord) -> RunSummary {
    let failure = record.failure.as_ref();
    RunSummary {
        run_id: record.run_id,
        service: record.service.clone(),
        pipeline: record.pipeline.clone(),
        trigger_key: record.trigger_key.clone(),
        status: record.phase,
        failed_stage: failure.map(|f| f.stage),
        failure_kind: failure.map(|f| f.kind),
        cause: failure.map(|f| f.cause.clone()),
        log_ref: failure.and_then(|f| f.log_ref.clone()),
        image_ref: record.image_ref.clone(),
        started_at: record.started_at,
        completed_at: record.completed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_build() -> RunRecord {
        let mut record = RunRecord::new("api", "api-CICD", "api/source.zip");
        record.advance(RunPhase::Sourcing);
        record.advance(RunPhase::Building);
        record.fail(FailureKind::BuildFailure, "exit status 2", Some("logs/api-build:1".to_string()));
        record
    }

    #[test]
    fn test_create_summary_from_failed_run() {
        let summary = create_summary(&failed_build());
        assert_eq!(summary.status, RunPhase::Failed);
        assert_eq!(summary.failed_stage, Some(RunPhase::Building));
        assert_eq!(summary.failure_kind, Some(FailureKind::BuildFailure));
        assert_eq!(summary.log_ref.as_deref(), Some("logs/api-build:1"));
        assert!(summary.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemoryPersistence::new();
        let summary = create_summary(&failed_build());
        store.save_run(&summary).await.unwrap();
        store.save_run(&summary).await.unwrap();

        assert_eq!(store.load_run(summary.run_id).await.unwrap(), Some(summary.clone()));
        assert_eq!(store.list_runs("api").await.unwrap().len(), 1);
        assert_eq!(store.list_services().await.unwrap(), vec!["api".to_string()]);
        assert!(store.list_runs("worker").await.unwrap().is_empty());
    }
}
