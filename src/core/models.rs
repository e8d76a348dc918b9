//! Records owned by other services that the worker reads (and, for
//! schedules, advances)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A pipeline and its current definition version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub current_version: u32,
}

/// Immutable snapshot of a pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineVersion {
    pub pipeline_id: Uuid,
    pub version: u32,
    /// Raw definition JSON, parsed by [`crate::core::PipelineDefinition`]
    pub definition: Value,
    pub created_at: DateTime<Utc>,
}

/// An encrypted user secret.
///
/// `pipeline_id = None` is the user's global scope; a pipeline-scoped
/// secret overrides a same-named global one for that pipeline.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserSecret {
    pub id: Uuid,
    pub user_id: String,
    pub pipeline_id: Option<Uuid>,
    pub name: String,
    pub encrypted_value: Vec<u8>,
    pub key_version: u32,
}

impl std::fmt::Debug for UserSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSecret")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("pipeline_id", &self.pipeline_id)
            .field("name", &self.name)
            .field("encrypted_value", &format_args!("<{} bytes>", self.encrypted_value.len()))
            .field("key_version", &self.key_version)
            .finish()
    }
}

/// A cron schedule for a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub cron_expression: String,
    pub timezone: String,
    pub input_data: Value,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// The parts of a user's plan that the scheduler enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub cron_enabled: bool,
    /// `None` means unlimited
    pub max_runs_per_day: Option<u32>,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            cron_enabled: false,
            max_runs_per_day: Some(10),
        }
    }
}
