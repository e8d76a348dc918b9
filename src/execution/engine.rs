//! Run orchestrator - executes a run's steps in order
//!
//! `pending -> running -> {completed, failed}`. Steps run strictly in order
//! and the first failure aborts the rest. Cancellation is applied externally
//! and observed between steps only.

use crate::{
    core::{
        interpolate, ExecutionContext, PipelineDefinition, Run, RunStatus, RunTotals,
        StepDefinition, StepExecution, StepStatus,
    },
    execution::{
        executor::StepExecutor,
        secrets::{required_secret_names, resolve_secrets},
    },
    model::ModelClient,
    persistence::Store,
    vault::{KeyProvider, RedactionSet},
    webhook::{DeliveryHandle, WebhookDispatcher, WebhookEnvelope, WebhookEvent, WebhookTarget},
};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Infrastructure failures; a failing step is a [`RunOutcome::Failed`], not an error
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("Storage error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        output: Option<Value>,
        totals: RunTotals,
    },
    Failed {
        error: String,
        totals: RunTotals,
    },
    /// Cancelled externally; status was left untouched
    Cancelled { completed_steps: usize },
    /// The run was not pending when the job arrived
    Skipped { status: RunStatus },
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed { .. } => "completed",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::Cancelled { .. } => "cancelled",
            RunOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// Executes runs end to end
pub struct RunOrchestrator {
    store: Arc<dyn Store>,
    executor: StepExecutor,
    kms: Option<Arc<dyn KeyProvider>>,
    webhooks: Option<WebhookDispatcher>,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        model: Arc<dyn ModelClient>,
        kms: Option<Arc<dyn KeyProvider>>,
    ) -> Self {
        Self {
            store,
            executor: StepExecutor::new(model),
            kms,
            webhooks: None,
        }
    }

    /// Notify definition webhooks when runs finish
    pub fn with_webhooks(mut self, dispatcher: WebhookDispatcher) -> Self {
        self.webhooks = Some(dispatcher);
        self
    }

    /// Execute a run by id
    pub async fn execute_run(&self, run_id: Uuid) -> Result<RunOutcome, RunError> {
        self.execute_run_with_delivery(run_id)
            .await
            .map(|(outcome, _)| outcome)
    }

    /// Execute a run and also return the webhook delivery handle, if one was started
    pub async fn execute_run_with_delivery(
        &self,
        run_id: Uuid,
    ) -> Result<(RunOutcome, Option<DeliveryHandle>), RunError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(RunError::RunNotFound(run_id))?;

        if run.status != RunStatus::Pending {
            info!(run_id = %run_id, "Skipping run in status {}", run.status.as_str());
            return Ok((RunOutcome::Skipped { status: run.status }, None));
        }

        let version = self
            .store
            .get_pipeline_version(run.pipeline_id, run.pipeline_version)
            .await?;
        let definition = match version {
            Some(version) => PipelineDefinition::from_json(&version.definition)
                .map_err(|e| format!("Invalid pipeline definition: {:#}", e)),
            None => Err(format!(
                "Pipeline version {} not found",
                run.pipeline_version
            )),
        };
        let definition = match definition {
            Ok(definition) => definition,
            Err(message) => {
                error!(run_id = %run_id, "{}", message);
                self.store
                    .fail_run(run_id, &message, RunTotals::default())
                    .await?;
                return Ok((
                    RunOutcome::Failed {
                        error: message,
                        totals: RunTotals::default(),
                    },
                    None,
                ));
            }
        };

        if !self.store.mark_run_running(run_id, Utc::now()).await? {
            let status = self
                .store
                .get_run(run_id)
                .await?
                .map(|r| r.status)
                .unwrap_or(run.status);
            info!(run_id = %run_id, "Run was claimed elsewhere ({})", status.as_str());
            return Ok((RunOutcome::Skipped { status }, None));
        }

        info!(
            run_id = %run_id,
            "Starting run of pipeline {} v{} ({} steps)",
            definition.name,
            run.pipeline_version,
            definition.steps.len()
        );

        let mut context = ExecutionContext::new(run.input_data.clone(), definition.variables.clone());
        let mut redactor = RedactionSet::new();

        let names = required_secret_names(&definition);
        let secrets = resolve_secrets(
            self.store.as_ref(),
            self.kms.as_ref(),
            &run.user_id,
            run.pipeline_id,
            &names,
        )
        .await;
        match secrets {
            Ok(secrets) => {
                debug!(run_id = %run_id, "Resolved {} of {} secrets", secrets.len(), names.len());
                for (name, value) in secrets {
                    redactor.insert(value.clone());
                    context.set_env(name, value);
                }
            }
            Err(e) => {
                let message = redactor.redact(&e.to_string());
                error!(run_id = %run_id, "{}", message);
                let outcome = self.fail(&run, &message, RunTotals::default()).await?;
                let delivery = self.notify(&run.id, &definition, &context).await;
                return Ok((outcome, delivery));
            }
        }

        let mut totals = RunTotals::default();
        for (index, step) in definition.steps.iter().enumerate() {
            if self.is_cancelled(run_id).await? {
                info!(run_id = %run_id, "Run cancelled before step {}", step.id);
                return Ok((RunOutcome::Cancelled { completed_steps: index }, None));
            }

            if let Err(message) = self
                .run_step(run_id, index, step, &mut context, &redactor, &mut totals)
                .await?
            {
                let message = format!("Step \"{}\" failed: {}", step.id, message);
                error!(run_id = %run_id, step_id = %step.id, "{}", message);
                let outcome = self.fail(&run, &message, totals).await?;
                let delivery = self.notify(&run.id, &definition, &context).await;
                return Ok((outcome, delivery));
            }
        }

        let output = definition
            .output_step_id()
            .and_then(|id| context.step_output(id))
            .map(|value| redactor.redact_value(value));

        if !self
            .store
            .complete_run(run_id, output.clone(), totals)
            .await?
        {
            warn!(run_id = %run_id, "Run left running state before completion; not completing");
            return Ok((RunOutcome::Cancelled { completed_steps: definition.steps.len() }, None));
        }

        info!(
            run_id = %run_id,
            "Run completed: {} tokens, {:.4} cents",
            totals.total_tokens,
            totals.total_cost_cents
        );
        let delivery = self.notify(&run.id, &definition, &context).await;
        Ok((RunOutcome::Completed { output, totals }, delivery))
    }

    /// Run one step and persist its execution record. The inner `Err` is the
    /// redacted failure message.
    async fn run_step(
        &self,
        run_id: Uuid,
        index: usize,
        step: &StepDefinition,
        context: &mut ExecutionContext,
        redactor: &RedactionSet,
        totals: &mut RunTotals,
    ) -> Result<Result<(), String>, RunError> {
        let mut record = StepExecution::start(run_id, &step.id, index as u32);
        self.store.insert_step_execution(&record).await?;

        let started = Instant::now();
        let result = self.executor.execute(step, context).await;
        record.duration_ms = started.elapsed().as_millis() as u64;
        record.completed_at = Some(Utc::now());

        match result {
            Ok(output) => {
                record.status = StepStatus::Completed;
                record.prompt_sent = Some(redactor.redact(&output.prompt_sent));
                record.raw_output = Some(redactor.redact(&output.raw_output));
                record.parsed_output = Some(redactor.redact_value(&output.parsed_output));
                record.input_tokens = output.input_tokens;
                record.output_tokens = output.output_tokens;
                record.cost_cents = output.cost_cents;
                self.store.update_step_execution(&record).await?;

                totals.add(output.input_tokens, output.output_tokens, output.cost_cents);
                context.set_step_output(&step.id, output.parsed_output);
                info!(
                    run_id = %run_id,
                    step_id = %step.id,
                    "Step completed in {}ms",
                    record.duration_ms
                );
                Ok(Ok(()))
            }
            Err(e) => {
                let message = redactor.redact(&e.to_string());
                record.status = StepStatus::Failed;
                record.error = Some(message.clone());
                self.store.update_step_execution(&record).await?;
                Ok(Err(message))
            }
        }
    }

    async fn is_cancelled(&self, run_id: Uuid) -> Result<bool, RunError> {
        Ok(self
            .store
            .get_run(run_id)
            .await?
            .is_some_and(|r| r.status == RunStatus::Cancelled))
    }

    async fn fail(&self, run: &Run, message: &str, totals: RunTotals) -> Result<RunOutcome, RunError> {
        if !self.store.fail_run(run.id, message, totals).await? {
            warn!(run_id = %run.id, "Run left running state before failure was recorded");
        }
        Ok(RunOutcome::Failed {
            error: message.to_string(),
            totals,
        })
    }

    /// Hand the finished run to the webhook dispatcher
    async fn notify(
        &self,
        run_id: &Uuid,
        definition: &PipelineDefinition,
        context: &ExecutionContext,
    ) -> Option<DeliveryHandle> {
        let dispatcher = self.webhooks.as_ref()?;
        let config = definition.webhook.as_ref()?;

        let run = match self.store.get_run(*run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => return None,
            Err(e) => {
                warn!(run_id = %run_id, "Could not load run for webhook: {:#}", e);
                return None;
            }
        };
        let event = WebhookEvent::for_status(run.status)?;
        if !config.wants(event.as_str()) {
            return None;
        }

        let signing_secret = match config.signing_secret.as_deref() {
            Some(template) => match interpolate(template, &context.to_value()) {
                Ok(secret) if !secret.is_empty() => Some(secret),
                Ok(_) => {
                    warn!(run_id = %run_id, "Webhook signing secret resolved to empty; sending unsigned");
                    None
                }
                Err(e) => {
                    warn!(run_id = %run_id, "Could not render webhook signing secret: {}", e);
                    None
                }
            },
            None => None,
        };

        let pipeline_name = match self.store.get_pipeline(run.pipeline_id).await {
            Ok(Some(pipeline)) => pipeline.name,
            _ => definition.name.clone(),
        };

        let envelope = WebhookEnvelope::for_run(event, &pipeline_name, &run);
        let target = WebhookTarget {
            url: config.url.clone(),
            method: config.method.clone(),
            signing_secret,
        };
        debug!(run_id = %run_id, "Dispatching {} webhook", event.as_str());
        Some(dispatcher.dispatch(target, envelope))
    }
}
