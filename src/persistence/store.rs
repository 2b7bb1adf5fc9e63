//! SQLite-based run history store

use crate::core::{FailureKind, RunPhase};
use crate::persistence::{PersistenceBackend, RunSummary};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::str::FromStr;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

const RUN_COLUMNS: &str = "id, service, pipeline, trigger_key, status, failed_stage, failure_kind, cause, \
                           log_ref, image_ref, started_at, completed_at";

/// SQLite run store
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Create a new SQLite store
    pub async fn new(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))
            .context("Invalid database path")?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store under the user's local data directory
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("mimir");
        std::fs::create_dir_all(&db_dir).with_context(|| format!("Failed to create {}", db_dir.display()))?;

        let db_path = db_dir.join("runs.db");
        let db_path = db_path
            .to_str()
            .ok_or_else(|| anyhow!("Database path is not valid UTF-8: {}", db_path.display()))?;
        Self::new(db_path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                service TEXT NOT NULL,
                pipeline TEXT NOT NULL,
                trigger_key TEXT NOT NULL,
                status TEXT NOT NULL,
                failed_stage TEXT,
                failure_kind TEXT,
                cause TEXT,
                log_ref TEXT,
                image_ref TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_service ON runs(service);
            CREATE INDEX IF NOT EXISTS idx_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_started_at ON runs(started_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn parse_phase(value: &str) -> Result<RunPhase> {
        RunPhase::parse(value).ok_or_else(|| anyhow!("Unknown run phase '{}'", value))
    }

    fn from_row(row: &SqliteRow) -> Result<RunSummary> {
        Ok(RunSummary {
            run_id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            service: row.get("service"),
            pipeline: row.get("pipeline"),
            trigger_key: row.get("trigger_key"),
            status: Self::parse_phase(&row.get::<String, _>("status"))?,
            failed_stage: row
                .get::<Option<String>, _>("failed_stage")
                .map(|s| Self::parse_phase(&s))
                .transpose()?,
            failure_kind: row
                .get::<Option<String>, _>("failure_kind")
                .and_then(|s| FailureKind::parse(&s)),
            cause: row.get("cause"),
            log_ref: row.get("log_ref"),
            image_ref: row.get("image_ref"),
            started_at: Self::from_naive(row.get("started_at")),
            completed_at: row.get::<Option<NaiveDateTime>, _>("completed_at").map(Self::from_naive),
        })
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for SqliteRunStore {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            RUN_COLUMNS
        ))
        .bind(run.run_id.to_string())
        .bind(&run.service)
        .bind(&run.pipeline)
        .bind(&run.trigger_key)
        .bind(run.status.as_str())
        .bind(run.failed_stage.map(|p| p.as_str()))
        .bind(run.failure_kind.map(|k| k.as_str()))
        .bind(&run.cause)
        .bind(&run.log_ref)
        .bind(&run.image_ref)
        .bind(Self::to_naive(run.started_at))
        .bind(run.completed_at.map(Self::to_naive))
        .execute(&self.pool)
        .await
        .context("Failed to save run")?;

        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load run")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_runs(&self, service: &str) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs WHERE service = ?1 ORDER BY started_at DESC",
            RUN_COLUMNS
        ))
        .bind(service)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT service FROM runs ORDER BY service ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list services")?;

        Ok(rows.iter().map(|row| row.get("service")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunRecord;
    use crate::persistence::create_summary;

    #[tokio::test]
    async fn test_sqlite_store() {
        let store = SqliteRunStore::new(":memory:").await.unwrap();

        let mut record = RunRecord::new("api", "api-CICD", "api/source.zip");
        record.advance(RunPhase::Sourcing);
        record.fail(FailureKind::SourceUnavailable, "api/source.zip not found", None);
        let summary = create_summary(&record);

        store.save_run(&summary).await.unwrap();

        let loaded = store.load_run(summary.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.service, "api");
        assert_eq!(loaded.status, RunPhase::Failed);
        assert_eq!(loaded.failed_stage, Some(RunPhase::Sourcing));
        assert_eq!(loaded.failure_kind, Some(FailureKind::SourceUnavailable));
        assert_eq!(loaded.log_ref, None);

        assert_eq!(store.list_runs("api").await.unwrap().len(), 1);
        assert_eq!(store.list_services().await.unwrap(), vec!["api".to_string()]);
    }
}
