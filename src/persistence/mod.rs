//! Persistence boundary for the worker
//!
//! Runs, step executions and schedules are read and written; pipelines,
//! pipeline versions and user secrets are read (secrets are re-wrapped by the
//! rotation job). The schema is owned elsewhere.

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

use crate::core::{
    NewRun, Pipeline, PipelineVersion, Run, RunStatus, RunTotals, Schedule, StepExecution,
    UserSecret,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Storage operations used by the orchestrator, scheduler and rotation job
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>>;

    /// Insert a new `pending` run
    async fn create_run(&self, new_run: NewRun) -> Result<Run>;

    /// `pending -> running`; false when the run was not pending
    async fn mark_run_running(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<bool>;

    /// `running -> completed`; false when the run was no longer running
    async fn complete_run(
        &self,
        run_id: Uuid,
        output: Option<Value>,
        totals: RunTotals,
    ) -> Result<bool>;

    /// `pending|running -> failed`; false when the run was already terminal
    async fn fail_run(&self, run_id: Uuid, error: &str, totals: RunTotals) -> Result<bool>;

    /// `pending|running -> cancelled`
    async fn cancel_run(&self, run_id: Uuid) -> Result<bool>;

    /// Runs a user created at or after `since`
    async fn count_runs_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<u64>;

    async fn insert_step_execution(&self, step: &StepExecution) -> Result<()>;

    async fn update_step_execution(&self, step: &StepExecution) -> Result<()>;

    /// Step executions of a run, ordered by step index
    async fn list_step_executions(&self, run_id: Uuid) -> Result<Vec<StepExecution>>;

    async fn get_pipeline(&self, pipeline_id: Uuid) -> Result<Option<Pipeline>>;

    async fn get_pipeline_version(
        &self,
        pipeline_id: Uuid,
        version: u32,
    ) -> Result<Option<PipelineVersion>>;

    /// Secret with exactly this scope (`pipeline_id = None` is global)
    async fn find_secret(
        &self,
        user_id: &str,
        pipeline_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<UserSecret>>;

    async fn list_secrets(&self) -> Result<Vec<UserSecret>>;

    async fn update_secret_blob(&self, secret_id: Uuid, blob: &[u8], key_version: u32)
        -> Result<()>;

    /// Enabled schedules with `next_run_at <= now`, oldest first
    async fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>>;

    /// Set `next_run_at` and, when given, `last_run_at`
    async fn advance_schedule(
        &self,
        schedule_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// In-memory store (for tests and ephemeral use)
#[derive(Default)]
pub struct InMemoryStore {
    runs: RwLock<HashMap<Uuid, Run>>,
    steps: RwLock<HashMap<Uuid, StepExecution>>,
    pipelines: RwLock<HashMap<Uuid, Pipeline>>,
    versions: RwLock<HashMap<(Uuid, u32), PipelineVersion>>,
    secrets: RwLock<HashMap<Uuid, UserSecret>>,
    schedules: RwLock<HashMap<Uuid, Schedule>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pipeline and its current version
    pub async fn insert_pipeline(&self, pipeline: Pipeline, definition: Value) {
        let version = PipelineVersion {
            pipeline_id: pipeline.id,
            version: pipeline.current_version,
            definition,
            created_at: Utc::now(),
        };
        self.versions
            .write()
            .await
            .insert((pipeline.id, version.version), version);
        self.pipelines.write().await.insert(pipeline.id, pipeline);
    }

    pub async fn insert_secret(&self, secret: UserSecret) {
        self.secrets.write().await.insert(secret.id, secret);
    }

    pub async fn insert_schedule(&self, schedule: Schedule) {
        self.schedules.write().await.insert(schedule.id, schedule);
    }

    pub async fn get_schedule(&self, schedule_id: Uuid) -> Option<Schedule> {
        self.schedules.read().await.get(&schedule_id).cloned()
    }

    pub async fn list_runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.read().await.values().cloned().collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    async fn transition(
        &self,
        run_id: Uuid,
        next: RunStatus,
        apply: impl FnOnce(&mut Run),
    ) -> Result<bool> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(&run_id) {
            Some(run) if run.status.can_transition_to(next) => {
                run.status = next;
                apply(run);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => anyhow::bail!("Run {} not found", run_id),
        }
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {
    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn create_run(&self, new_run: NewRun) -> Result<Run> {
        let run = Run::from_new(new_run);
        self.runs.write().await.insert(run.id, run.clone());
        Ok(run)
    }

    async fn mark_run_running(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<bool> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Pending => {
                run.status = RunStatus::Running;
                run.started_at = Some(started_at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => anyhow::bail!("Run {} not found", run_id),
        }
    }

    async fn complete_run(
        &self,
        run_id: Uuid,
        output: Option<Value>,
        totals: RunTotals,
    ) -> Result<bool> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Running => {
                run.status = RunStatus::Completed;
                run.output_data = output;
                run.total_tokens = totals.total_tokens;
                run.total_cost_cents = totals.total_cost_cents;
                run.completed_at = Some(Utc::now());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => anyhow::bail!("Run {} not found", run_id),
        }
    }

    async fn fail_run(&self, run_id: Uuid, error: &str, totals: RunTotals) -> Result<bool> {
        self.transition(run_id, RunStatus::Failed, |run| {
            run.error = Some(error.to_string());
            run.total_tokens = totals.total_tokens;
            run.total_cost_cents = totals.total_cost_cents;
            run.completed_at = Some(Utc::now());
        })
        .await
    }

    async fn cancel_run(&self, run_id: Uuid) -> Result<bool> {
        self.transition(run_id, RunStatus::Cancelled, |run| {
            run.completed_at = Some(Utc::now());
        })
        .await
    }

    async fn count_runs_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<u64> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .filter(|r| r.user_id == user_id && r.created_at >= since)
            .count() as u64)
    }

    async fn insert_step_execution(&self, step: &StepExecution) -> Result<()> {
        self.steps.write().await.insert(step.id, step.clone());
        Ok(())
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<()> {
        let mut steps = self.steps.write().await;
        if !steps.contains_key(&step.id) {
            anyhow::bail!("Step execution {} not found", step.id);
        }
        steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn list_step_executions(&self, run_id: Uuid) -> Result<Vec<StepExecution>> {
        let steps = self.steps.read().await;
        let mut result: Vec<StepExecution> = steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        result.sort_by_key(|s| s.step_index);
        Ok(result)
    }

    async fn get_pipeline(&self, pipeline_id: Uuid) -> Result<Option<Pipeline>> {
        Ok(self.pipelines.read().await.get(&pipeline_id).cloned())
    }

    async fn get_pipeline_version(
        &self,
        pipeline_id: Uuid,
        version: u32,
    ) -> Result<Option<PipelineVersion>> {
        Ok(self
            .versions
            .read()
            .await
            .get(&(pipeline_id, version))
            .cloned())
    }

    async fn find_secret(
        &self,
        user_id: &str,
        pipeline_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<UserSecret>> {
        let secrets = self.secrets.read().await;
        Ok(secrets
            .values()
            .find(|s| s.user_id == user_id && s.pipeline_id == pipeline_id && s.name == name)
            .cloned())
    }

    async fn list_secrets(&self) -> Result<Vec<UserSecret>> {
        Ok(self.secrets.read().await.values().cloned().collect())
    }

    async fn update_secret_blob(
        &self,
        secret_id: Uuid,
        blob: &[u8],
        key_version: u32,
    ) -> Result<()> {
        let mut secrets = self.secrets.write().await;
        let secret = secrets
            .get_mut(&secret_id)
            .ok_or_else(|| anyhow::anyhow!("Secret {} not found", secret_id))?;
        secret.encrypted_value = blob.to_vec();
        secret.key_version = key_version;
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>> {
        let schedules = self.schedules.read().await;
        let mut due: Vec<Schedule> = schedules
            .values()
            .filter(|s| s.enabled && s.next_run_at.is_some_and(|next| next <= now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn advance_schedule(
        &self,
        schedule_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut schedules = self.schedules.write().await;
        let schedule = schedules
            .get_mut(&schedule_id)
            .ok_or_else(|| anyhow::anyhow!("Schedule {} not found", schedule_id))?;
        schedule.next_run_at = next_run_at;
        if last_run_at.is_some() {
            schedule.last_run_at = last_run_at;
        }
        Ok(())
    }
}
