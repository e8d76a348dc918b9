//! stepiq-worker - executes StepIQ pipeline runs, fires cron schedules,
//! decrypts user secrets and delivers run webhooks

pub mod cli;
pub mod core;
pub mod execution;
pub mod model;
pub mod persistence;
pub mod queue;
pub mod scheduler;
pub mod settings;
pub mod vault;
pub mod webhook;

// Re-export commonly used types
pub use core::{PipelineDefinition, Run, RunStatus, StepExecution, StepStatus, TriggerType};
pub use execution::{create_and_enqueue_run, RunError, RunOrchestrator, RunOutcome};
pub use model::{GatewayModelClient, ModelClient, ModelRequest, ModelResponse};
pub use persistence::{InMemoryStore, Store};
pub use queue::{ExecuteJob, JobQueue, MemoryQueue};
pub use scheduler::{CronExpression, CronScheduler, TickReport};
pub use settings::WorkerSettings;
pub use vault::{KeyProvider, RedactionSet};
pub use webhook::{RetryPolicy, WebhookDispatcher};
