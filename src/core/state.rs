//! Run and step execution state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, waiting for a worker
    Pending,
    /// A worker is executing steps
    Running,
    /// All steps succeeded
    Completed,
    /// A step failed or the run could not start
    Failed,
    /// Cancelled externally while running
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Status only ever moves forward
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Pending, RunStatus::Failed | RunStatus::Cancelled) => true,
            (RunStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// Status of a single step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(StepStatus::Pending),
            "running" => Some(StepStatus::Running),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            "skipped" => Some(StepStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// What created a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Api,
    Cron,
    Webhook,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Api => "api",
            TriggerType::Cron => "cron",
            TriggerType::Webhook => "webhook",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(TriggerType::Manual),
            "api" => Some(TriggerType::Api),
            "cron" => Some(TriggerType::Cron),
            "webhook" => Some(TriggerType::Webhook),
            _ => None,
        }
    }
}

/// One execution of a pipeline, pinned to a definition version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub pipeline_version: u32,
    pub user_id: String,
    pub trigger_type: TriggerType,
    pub status: RunStatus,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub total_tokens: u64,
    pub total_cost_cents: f64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields needed to create a run
#[derive(Debug, Clone)]
pub struct NewRun {
    pub pipeline_id: Uuid,
    pub pipeline_version: u32,
    pub user_id: String,
    pub trigger_type: TriggerType,
    pub input_data: Value,
}

impl Run {
    /// Build a pending run from creation fields
    pub fn from_new(new_run: NewRun) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id: new_run.pipeline_id,
            pipeline_version: new_run.pipeline_version,
            user_id: new_run.user_id,
            trigger_type: new_run.trigger_type,
            status: RunStatus::Pending,
            input_data: new_run.input_data,
            output_data: None,
            total_tokens: 0,
            total_cost_cents: 0.0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Token and cost totals accumulated across steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTotals {
    pub total_tokens: u64,
    pub total_cost_cents: f64,
}

impl RunTotals {
    pub fn add(&mut self, input_tokens: u32, output_tokens: u32, cost_cents: f64) {
        self.total_tokens += u64::from(input_tokens) + u64::from(output_tokens);
        self.total_cost_cents += cost_cents;
    }
}

/// A single step's execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub step_index: u32,
    pub status: StepStatus,
    /// Prompt as sent to the model, redacted
    pub prompt_sent: Option<String>,
    pub raw_output: Option<String>,
    pub parsed_output: Option<Value>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_cents: f64,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// Create a record for a step that is starting now
    pub fn start(run_id: Uuid, step_id: &str, step_index: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            step_id: step_id.to_string(),
            step_index,
            status: StepStatus::Running,
            prompt_sent: None,
            raw_output: None,
            parsed_output: None,
            input_tokens: 0,
            output_tokens: 0,
            cost_cents: 0.0,
            duration_ms: 0,
            error: None,
            retry_count: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}
