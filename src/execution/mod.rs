//! Run execution

pub mod engine;
pub mod executor;
pub mod secrets;
pub mod trigger;

pub use engine::{RunError, RunOrchestrator, RunOutcome};
pub use executor::{StepError, StepExecutor, StepOutput};
pub use secrets::{required_secret_names, resolve_secrets, SecretResolutionError};
pub use trigger::create_and_enqueue_run;
