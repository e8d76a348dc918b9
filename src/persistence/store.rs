//! SQLite-based persistence store

use crate::core::{
    NewRun, Pipeline, PipelineVersion, Run, RunStatus, RunTotals, Schedule, StepExecution,
    StepStatus, TriggerType, UserSecret,
};
use crate::persistence::Store;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

/// SQLite store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to a SQLite URL (e.g., "sqlite:/tmp/worker.db" or "sqlite::memory:")
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database URL: {}", url))?
            .create_if_missing(true);
        // An in-memory database exists per connection
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store under the local data directory
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("stepiq");
        std::fs::create_dir_all(&db_dir)?;

        let db_path = db_dir.join("worker.db");
        Self::new(&format!("sqlite:{}", db_path.display())).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pipelines (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                current_version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pipeline_versions (
                pipeline_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                definition TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (pipeline_id, version)
            );

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL,
                pipeline_version INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                status TEXT NOT NULL,
                input_data TEXT NOT NULL,
                output_data TEXT,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                total_cost_cents REAL NOT NULL DEFAULT 0.0,
                error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_runs_user_created ON runs(user_id, created_at);

            CREATE TABLE IF NOT EXISTS step_executions (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                status TEXT NOT NULL,
                prompt_sent TEXT,
                raw_output TEXT,
                parsed_output TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost_cents REAL NOT NULL DEFAULT 0.0,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_step_executions_run ON step_executions(run_id);

            CREATE TABLE IF NOT EXISTS user_secrets (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                pipeline_id TEXT,
                name TEXT NOT NULL,
                encrypted_value BLOB NOT NULL,
                key_version INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_user_secrets_lookup ON user_secrets(user_id, name);

            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL,
                cron_expression TEXT NOT NULL,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                input_data TEXT NOT NULL DEFAULT '{}',
                enabled INTEGER NOT NULL DEFAULT 1,
                next_run_at TEXT,
                last_run_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(enabled, next_run_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Add a pipeline and its current version
    pub async fn insert_pipeline(&self, pipeline: &Pipeline, definition: &Value) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO pipelines (id, user_id, name, current_version) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(pipeline.id.to_string())
        .bind(&pipeline.user_id)
        .bind(&pipeline.name)
        .bind(i64::from(pipeline.current_version))
        .execute(&self.pool)
        .await
        .context("Failed to save pipeline")?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO pipeline_versions (pipeline_id, version, definition, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(pipeline.id.to_string())
        .bind(i64::from(pipeline.current_version))
        .bind(definition.to_string())
        .bind(Self::to_naive(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to save pipeline version")?;

        Ok(())
    }

    /// Add a user secret
    pub async fn insert_secret(&self, secret: &UserSecret) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_secrets (id, user_id, pipeline_id, name, encrypted_value, key_version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(secret.id.to_string())
        .bind(&secret.user_id)
        .bind(secret.pipeline_id.map(|id| id.to_string()))
        .bind(&secret.name)
        .bind(&secret.encrypted_value)
        .bind(i64::from(secret.key_version))
        .execute(&self.pool)
        .await
        .context("Failed to save secret")?;
        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn opt_time(row: &SqliteRow, column: &str) -> Option<DateTime<Utc>> {
        row.get::<Option<NaiveDateTime>, _>(column).map(Self::from_naive)
    }

    fn opt_json(row: &SqliteRow, column: &str) -> Result<Option<Value>> {
        row.get::<Option<String>, _>(column)
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .with_context(|| format!("Invalid JSON in column {}", column))
    }

    fn uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
        Uuid::parse_str(&row.get::<String, _>(column))
            .with_context(|| format!("Invalid UUID in column {}", column))
    }

    fn run_from_row(row: &SqliteRow) -> Result<Run> {
        let status: String = row.get("status");
        let trigger: String = row.get("trigger_type");
        Ok(Run {
            id: Self::uuid(row, "id")?,
            pipeline_id: Self::uuid(row, "pipeline_id")?,
            pipeline_version: row.get::<i64, _>("pipeline_version") as u32,
            user_id: row.get("user_id"),
            trigger_type: TriggerType::parse(&trigger)
                .with_context(|| format!("Unknown trigger type {}", trigger))?,
            status: RunStatus::parse(&status)
                .with_context(|| format!("Unknown run status {}", status))?,
            input_data: Self::opt_json(row, "input_data")?.unwrap_or(Value::Null),
            output_data: Self::opt_json(row, "output_data")?,
            total_tokens: row.get::<i64, _>("total_tokens") as u64,
            total_cost_cents: row.get("total_cost_cents"),
            error: row.get("error"),
            created_at: Self::from_naive(row.get("created_at")),
            started_at: Self::opt_time(row, "started_at"),
            completed_at: Self::opt_time(row, "completed_at"),
        })
    }

    fn step_from_row(row: &SqliteRow) -> Result<StepExecution> {
        let status: String = row.get("status");
        Ok(StepExecution {
            id: Self::uuid(row, "id")?,
            run_id: Self::uuid(row, "run_id")?,
            step_id: row.get("step_id"),
            step_index: row.get::<i64, _>("step_index") as u32,
            status: StepStatus::parse(&status)
                .with_context(|| format!("Unknown step status {}", status))?,
            prompt_sent: row.get("prompt_sent"),
            raw_output: row.get("raw_output"),
            parsed_output: Self::opt_json(row, "parsed_output")?,
            input_tokens: row.get::<i64, _>("input_tokens") as u32,
            output_tokens: row.get::<i64, _>("output_tokens") as u32,
            cost_cents: row.get("cost_cents"),
            duration_ms: row.get::<i64, _>("duration_ms") as u64,
            error: row.get("error"),
            retry_count: row.get::<i64, _>("retry_count") as u32,
            started_at: Self::from_naive(row.get("started_at")),
            completed_at: Self::opt_time(row, "completed_at"),
        })
    }

    fn secret_from_row(row: &SqliteRow) -> Result<UserSecret> {
        Ok(UserSecret {
            id: Self::uuid(row, "id")?,
            user_id: row.get("user_id"),
            pipeline_id: row
                .get::<Option<String>, _>("pipeline_id")
                .map(|id| Uuid::parse_str(&id))
                .transpose()?,
            name: row.get("name"),
            encrypted_value: row.get("encrypted_value"),
            key_version: row.get::<i64, _>("key_version") as u32,
        })
    }

    fn schedule_from_row(row: &SqliteRow) -> Result<Schedule> {
        Ok(Schedule {
            id: Self::uuid(row, "id")?,
            pipeline_id: Self::uuid(row, "pipeline_id")?,
            cron_expression: row.get("cron_expression"),
            timezone: row.get("timezone"),
            input_data: Self::opt_json(row, "input_data")?.unwrap_or(Value::Null),
            enabled: row.get::<i64, _>("enabled") != 0,
            next_run_at: Self::opt_time(row, "next_run_at"),
            last_run_at: Self::opt_time(row, "last_run_at"),
        })
    }

    async fn run_exists(&self, run_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM runs WHERE id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Map an UPDATE's affected row count to the conditional-write result
    async fn conditional(&self, run_id: Uuid, rows_affected: u64) -> Result<bool> {
        if rows_affected > 0 {
            return Ok(true);
        }
        if !self.run_exists(run_id).await? {
            anyhow::bail!("Run {} not found", run_id);
        }
        Ok(false)
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load run")?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn create_run(&self, new_run: NewRun) -> Result<Run> {
        let run = Run::from_new(new_run);
        sqlx::query(
            r#"
            INSERT INTO runs
            (id, pipeline_id, pipeline_version, user_id, trigger_type, status, input_data, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.pipeline_id.to_string())
        .bind(i64::from(run.pipeline_version))
        .bind(&run.user_id)
        .bind(run.trigger_type.as_str())
        .bind(run.status.as_str())
        .bind(run.input_data.to_string())
        .bind(Self::to_naive(run.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to create run")?;
        Ok(run)
    }

    async fn mark_run_running(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'running', started_at = ?2 WHERE id = ?1 AND status = 'pending'",
        )
        .bind(run_id.to_string())
        .bind(Self::to_naive(started_at))
        .execute(&self.pool)
        .await
        .context("Failed to mark run running")?;
        self.conditional(run_id, result.rows_affected()).await
    }

    async fn complete_run(
        &self,
        run_id: Uuid,
        output: Option<Value>,
        totals: RunTotals,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'completed', output_data = ?2, total_tokens = ?3,
                total_cost_cents = ?4, completed_at = ?5
            WHERE id = ?1 AND status = 'running'
            "#,
        )
        .bind(run_id.to_string())
        .bind(output.map(|v| v.to_string()))
        .bind(totals.total_tokens as i64)
        .bind(totals.total_cost_cents)
        .bind(Self::to_naive(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to complete run")?;
        self.conditional(run_id, result.rows_affected()).await
    }

    async fn fail_run(&self, run_id: Uuid, error: &str, totals: RunTotals) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'failed', error = ?2, total_tokens = ?3,
                total_cost_cents = ?4, completed_at = ?5
            WHERE id = ?1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(run_id.to_string())
        .bind(error)
        .bind(totals.total_tokens as i64)
        .bind(totals.total_cost_cents)
        .bind(Self::to_naive(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to fail run")?;
        self.conditional(run_id, result.rows_affected()).await
    }

    async fn cancel_run(&self, run_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET status = 'cancelled', completed_at = ?2
            WHERE id = ?1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(run_id.to_string())
        .bind(Self::to_naive(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to cancel run")?;
        self.conditional(run_id, result.rows_affected()).await
    }

    async fn count_runs_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM runs WHERE user_id = ?1 AND created_at >= ?2")
            .bind(user_id)
            .bind(Self::to_naive(since))
            .fetch_one(&self.pool)
            .await
            .context("Failed to count runs")?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn insert_step_execution(&self, step: &StepExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO step_executions
            (id, run_id, step_id, step_index, status, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(step.id.to_string())
        .bind(step.run_id.to_string())
        .bind(&step.step_id)
        .bind(i64::from(step.step_index))
        .bind(step.status.as_str())
        .bind(Self::to_naive(step.started_at))
        .execute(&self.pool)
        .await
        .context("Failed to insert step execution")?;
        Ok(())
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = ?2, prompt_sent = ?3, raw_output = ?4, parsed_output = ?5,
                input_tokens = ?6, output_tokens = ?7, cost_cents = ?8, duration_ms = ?9,
                error = ?10, retry_count = ?11, completed_at = ?12
            WHERE id = ?1
            "#,
        )
        .bind(step.id.to_string())
        .bind(step.status.as_str())
        .bind(&step.prompt_sent)
        .bind(&step.raw_output)
        .bind(step.parsed_output.as_ref().map(|v| v.to_string()))
        .bind(i64::from(step.input_tokens))
        .bind(i64::from(step.output_tokens))
        .bind(step.cost_cents)
        .bind(step.duration_ms as i64)
        .bind(&step.error)
        .bind(i64::from(step.retry_count))
        .bind(step.completed_at.map(Self::to_naive))
        .execute(&self.pool)
        .await
        .context("Failed to update step execution")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Step execution {} not found", step.id);
        }
        Ok(())
    }

    async fn list_step_executions(&self, run_id: Uuid) -> Result<Vec<StepExecution>> {
        let rows = sqlx::query("SELECT * FROM step_executions WHERE run_id = ?1 ORDER BY step_index ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list step executions")?;
        rows.iter().map(Self::step_from_row).collect()
    }

    async fn get_pipeline(&self, pipeline_id: Uuid) -> Result<Option<Pipeline>> {
        let row = sqlx::query("SELECT * FROM pipelines WHERE id = ?1")
            .bind(pipeline_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load pipeline")?;

        row.map(|row| {
            Ok(Pipeline {
                id: Self::uuid(&row, "id")?,
                user_id: row.get("user_id"),
                name: row.get("name"),
                current_version: row.get::<i64, _>("current_version") as u32,
            })
        })
        .transpose()
    }

    async fn get_pipeline_version(
        &self,
        pipeline_id: Uuid,
        version: u32,
    ) -> Result<Option<PipelineVersion>> {
        let row = sqlx::query("SELECT * FROM pipeline_versions WHERE pipeline_id = ?1 AND version = ?2")
            .bind(pipeline_id.to_string())
            .bind(i64::from(version))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load pipeline version")?;

        row.map(|row| {
            Ok(PipelineVersion {
                pipeline_id: Self::uuid(&row, "pipeline_id")?,
                version: row.get::<i64, _>("version") as u32,
                definition: Self::opt_json(&row, "definition")?.unwrap_or(Value::Null),
                created_at: Self::from_naive(row.get("created_at")),
            })
        })
        .transpose()
    }

    async fn find_secret(
        &self,
        user_id: &str,
        pipeline_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<UserSecret>> {
        // `IS` matches NULL for the global scope
        let row = sqlx::query(
            "SELECT * FROM user_secrets WHERE user_id = ?1 AND pipeline_id IS ?2 AND name = ?3 LIMIT 1",
        )
        .bind(user_id)
        .bind(pipeline_id.map(|id| id.to_string()))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load secret")?;
        row.as_ref().map(Self::secret_from_row).transpose()
    }

    async fn list_secrets(&self) -> Result<Vec<UserSecret>> {
        let rows = sqlx::query("SELECT * FROM user_secrets")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list secrets")?;
        rows.iter().map(Self::secret_from_row).collect()
    }

    async fn update_secret_blob(
        &self,
        secret_id: Uuid,
        blob: &[u8],
        key_version: u32,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE user_secrets SET encrypted_value = ?2, key_version = ?3 WHERE id = ?1",
        )
        .bind(secret_id.to_string())
        .bind(blob)
        .bind(i64::from(key_version))
        .execute(&self.pool)
        .await
        .context("Failed to update secret")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Secret {} not found", secret_id);
        }
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM schedules
            WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
            ORDER BY next_run_at ASC
            LIMIT ?2
            "#,
        )
        .bind(Self::to_naive(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load due schedules")?;
        rows.iter().map(Self::schedule_from_row).collect()
    }

    async fn advance_schedule(
        &self,
        schedule_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET next_run_at = ?2, last_run_at = COALESCE(?3, last_run_at)
            WHERE id = ?1
            "#,
        )
        .bind(schedule_id.to_string())
        .bind(next_run_at.map(Self::to_naive))
        .bind(last_run_at.map(Self::to_naive))
        .execute(&self.pool)
        .await
        .context("Failed to advance schedule")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Schedule {} not found", schedule_id);
        }
        Ok(())
    }
}

impl SqliteStore {
    /// Add a schedule
    pub async fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules
            (id, pipeline_id, cron_expression, timezone, input_data, enabled, next_run_at, last_run_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(schedule.id.to_string())
        .bind(schedule.pipeline_id.to_string())
        .bind(&schedule.cron_expression)
        .bind(&schedule.timezone)
        .bind(schedule.input_data.to_string())
        .bind(schedule.enabled as i64)
        .bind(schedule.next_run_at.map(Self::to_naive))
        .bind(schedule.last_run_at.map(Self::to_naive))
        .execute(&self.pool)
        .await
        .context("Failed to save schedule")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    async fn store_with_pipeline() -> (SqliteStore, Pipeline) {
        let store = SqliteStore::new("sqlite::memory:").await.unwrap();
        let pipeline = Pipeline {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            name: "Digest".into(),
            current_version: 2,
        };
        store
            .insert_pipeline(&pipeline, &json!({"name": "Digest", "steps": []}))
            .await
            .unwrap();
        (store, pipeline)
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let (store, pipeline) = store_with_pipeline().await;
        let run = store
            .create_run(NewRun {
                pipeline_id: pipeline.id,
                pipeline_version: 2,
                user_id: "u1".into(),
                trigger_type: TriggerType::Api,
                input_data: json!({"topic": "rust"}),
            })
            .await
            .unwrap();

        assert!(store.mark_run_running(run.id, Utc::now()).await.unwrap());
        assert!(!store.mark_run_running(run.id, Utc::now()).await.unwrap());

        let totals = RunTotals {
            total_tokens: 42,
            total_cost_cents: 1.5,
        };
        assert!(store
            .complete_run(run.id, Some(json!({"ok": true})), totals)
            .await
            .unwrap());
        assert!(!store.fail_run(run.id, "late", totals).await.unwrap());

        let loaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.total_tokens, 42);
        assert_eq!(loaded.output_data, Some(json!({"ok": true})));
        assert_eq!(loaded.input_data["topic"], "rust");
        assert!(loaded.started_at.is_some());

        assert_eq!(
            store
                .count_runs_since("u1", Utc::now() - Duration::hours(1))
                .await
                .unwrap(),
            1
        );
        assert!(store.mark_run_running(Uuid::new_v4(), Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_step_executions_and_versions() {
        let (store, pipeline) = store_with_pipeline().await;
        let version = store
            .get_pipeline_version(pipeline.id, 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version.definition["name"], "Digest");
        assert!(store.get_pipeline_version(pipeline.id, 1).await.unwrap().is_none());

        let run_id = Uuid::new_v4();
        let mut step = StepExecution::start(run_id, "draft", 0);
        store.insert_step_execution(&step).await.unwrap();
        step.status = StepStatus::Completed;
        step.parsed_output = Some(json!({"title": "x"}));
        step.input_tokens = 5;
        store.update_step_execution(&step).await.unwrap();

        let steps = store.list_step_executions(run_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[0].parsed_output, Some(json!({"title": "x"})));
        assert_eq!(steps[0].input_tokens, 5);
    }

    #[tokio::test]
    async fn test_secret_scopes_and_schedules() {
        let (store, pipeline) = store_with_pipeline().await;
        let global = UserSecret {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            pipeline_id: None,
            name: "KEY".into(),
            encrypted_value: vec![1, 2, 3],
            key_version: 1,
        };
        store.insert_secret(&global).await.unwrap();

        assert!(store.find_secret("u1", Some(pipeline.id), "KEY").await.unwrap().is_none());
        let found = store.find_secret("u1", None, "KEY").await.unwrap().unwrap();
        assert_eq!(found.encrypted_value, vec![1, 2, 3]);

        store.update_secret_blob(global.id, &[9, 9], 2).await.unwrap();
        let updated = &store.list_secrets().await.unwrap()[0];
        assert_eq!(updated.encrypted_value, vec![9, 9]);
        assert_eq!(updated.key_version, 2);

        let now = Utc::now();
        let schedule = Schedule {
            id: Uuid::new_v4(),
            pipeline_id: pipeline.id,
            cron_expression: "*/5 * * * *".into(),
            timezone: "UTC".into(),
            input_data: json!({}),
            enabled: true,
            next_run_at: Some(now - Duration::minutes(1)),
            last_run_at: None,
        };
        store.insert_schedule(&schedule).await.unwrap();
        assert_eq!(store.due_schedules(now, 10).await.unwrap().len(), 1);

        store
            .advance_schedule(schedule.id, Some(now + Duration::minutes(5)), None)
            .await
            .unwrap();
        assert!(store.due_schedules(now, 10).await.unwrap().is_empty());
    }
}
