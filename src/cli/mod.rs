//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{RotateKeysCommand, RunCommand, TriggerCommand, ValidateCommand, WorkerCommand};

/// StepIQ background worker
#[derive(Debug, Parser, Clone)]
#[command(name = "stepiq-worker")]
#[command(version)]
#[command(about = "Runs StepIQ pipelines, cron schedules and webhooks", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the scheduler and job consumer until Ctrl-C
    Worker(WorkerCommand),

    /// Execute one run inline
    Run(RunCommand),

    /// Create a manual run and enqueue it
    Trigger(TriggerCommand),

    /// Re-wrap every stored secret under the current master key
    RotateKeys(RotateKeysCommand),

    /// Validate a pipeline definition file
    Validate(ValidateCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}

use std::ffi::OsString;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rotate_keys() {
        let cli = Cli::try_parse_from([
            "stepiq-worker",
            "rotate-keys",
            "--old-key-env",
            "OLD_MASTER_KEY",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Command::RotateKeys(cmd) => {
                assert_eq!(cmd.old_key_env, "OLD_MASTER_KEY");
                assert!(cmd.dry_run);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_trigger_input_must_be_json() {
        let ok = Cli::try_parse_from([
            "stepiq-worker",
            "trigger",
            "--pipeline-id",
            "6f1c2a7e-6a55-4c53-9a55-0d8f0b1b2c3d",
            "--input",
            r#"{"topic":"rust"}"#,
        ])
        .unwrap();
        match ok.command {
            Command::Trigger(cmd) => assert_eq!(cmd.input["topic"], "rust"),
            other => panic!("unexpected command: {:?}", other),
        }

        assert!(Cli::try_parse_from([
            "stepiq-worker",
            "trigger",
            "--pipeline-id",
            "6f1c2a7e-6a55-4c53-9a55-0d8f0b1b2c3d",
            "--input",
            "{not json",
        ])
        .is_err());
    }

    #[test]
    fn test_verbose_is_global() {
        let cli = Cli::try_parse_from(["stepiq-worker", "validate", "--file", "p.yaml", "-v"]).unwrap();
        assert!(cli.verbose);
    }
}
