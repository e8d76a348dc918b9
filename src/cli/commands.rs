//! CLI command definitions

use clap::Args;
use serde_json::Value;
use uuid::Uuid;

/// Run the scheduler and job consumer
#[derive(Debug, Args, Clone)]
pub struct WorkerCommand {
    /// Consume jobs only; do not tick the scheduler
    #[arg(long)]
    pub no_scheduler: bool,

    /// Override STEPIQ_WORKER_CONCURRENCY
    #[arg(long)]
    pub concurrency: Option<usize>,
}

/// Execute one run inline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Run to execute
    #[arg(long)]
    pub run_id: Uuid,

    /// Print the step execution records
    #[arg(long)]
    pub steps: bool,
}

/// Create a manual run
#[derive(Debug, Args, Clone)]
pub struct TriggerCommand {
    /// Pipeline to run
    #[arg(long)]
    pub pipeline_id: Uuid,

    /// Run input as a JSON object
    #[arg(long, value_parser = parse_json, default_value = "{}")]
    pub input: Value,
}

/// Re-wrap secrets after a master key change
#[derive(Debug, Args, Clone)]
pub struct RotateKeysCommand {
    /// Environment variable holding the previous 64-hex master key
    #[arg(long)]
    pub old_key_env: String,

    /// Verify every secret without writing
    #[arg(long)]
    pub dry_run: bool,
}

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Parse a JSON argument
pub fn parse_json(s: &str) -> Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("Invalid JSON: {}", e))
}
