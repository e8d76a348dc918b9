//! Webhook dispatcher
//!
//! Run completion and failure are reported to a user-configured URL. Each
//! delivery runs as its own task so backoff sleeps never hold up run
//! execution, and a delivery failure never changes the run's outcome.

pub mod retry;
pub mod signing;
pub mod transport;

use crate::core::{Run, RunStatus, TriggerType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub use retry::{deliver_webhook_with_retry, AttemptOutcome, RetryPolicy};
pub use signing::{sign_payload, verify_signature};
pub use transport::{ReqwestTransport, WebhookRequest, WebhookTransport};

/// Resolves to every attempt's outcome once a delivery finishes
pub type DeliveryHandle = JoinHandle<Vec<AttemptOutcome>>;

pub const EVENT_HEADER: &str = "X-StepIQ-Event";
pub const TIMESTAMP_HEADER: &str = "X-StepIQ-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-StepIQ-Signature";

/// Transport failures
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Unsupported HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Failed to serialise webhook payload: {0}")]
    Payload(String),

    #[error("Failed to sign webhook payload: {0}")]
    Signing(String),
}

/// Events a run can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEvent {
    RunCompleted,
    RunFailed,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::RunCompleted => "run.completed",
            WebhookEvent::RunFailed => "run.failed",
        }
    }

    /// Event for a terminal run status; cancelled runs emit nothing
    pub fn for_status(status: RunStatus) -> Option<Self> {
        match status {
            RunStatus::Completed => Some(WebhookEvent::RunCompleted),
            RunStatus::Failed => Some(WebhookEvent::RunFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRef {
    pub id: Uuid,
    pub version: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRef {
    pub id: Uuid,
    pub status: RunStatus,
    pub trigger_type: TriggerType,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Stamped onto the envelope for each attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryMeta {
    pub sent_at: DateTime<Utc>,
    pub attempt: u32,
}

/// JSON body delivered to the webhook URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub event: String,
    pub pipeline: PipelineRef,
    pub run: RunRef,
    pub input: Value,
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<DeliveryMeta>,
}

impl WebhookEnvelope {
    pub fn for_run(event: WebhookEvent, pipeline_name: &str, run: &Run) -> Self {
        Self {
            event: event.as_str().to_string(),
            pipeline: PipelineRef {
                id: run.pipeline_id,
                version: run.pipeline_version,
                name: pipeline_name.to_string(),
            },
            run: RunRef {
                id: run.id,
                status: run.status,
                trigger_type: run.trigger_type,
                started_at: run.started_at,
                completed_at: run.completed_at,
            },
            input: run.input_data.clone(),
            output: run.output_data.clone(),
            meta: None,
        }
    }
}

/// Where and how to deliver
#[derive(Clone)]
pub struct WebhookTarget {
    pub url: String,
    pub method: String,
    pub signing_secret: Option<String>,
}

impl std::fmt::Debug for WebhookTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookTarget")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("signed", &self.signing_secret.is_some())
            .finish()
    }
}

/// Spawns deliveries as independent tasks
#[derive(Clone)]
pub struct WebhookDispatcher {
    transport: Arc<dyn WebhookTransport>,
    policy: RetryPolicy,
    timeout: Duration,
    cancel: CancellationToken,
}

impl WebhookDispatcher {
    pub fn new(transport: Arc<dyn WebhookTransport>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            transport,
            policy,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a shutdown token with the rest of the worker
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start delivering `envelope`; the handle resolves to every attempt's outcome
    pub fn dispatch(
        &self,
        target: WebhookTarget,
        envelope: WebhookEnvelope,
    ) -> DeliveryHandle {
        let transport = Arc::clone(&self.transport);
        let policy = self.policy;
        let timeout = self.timeout;
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let outcomes = deliver_webhook_with_retry(
                transport.as_ref(),
                &target,
                &envelope,
                &policy,
                timeout,
                &cancel,
            )
            .await;

            let delivered = outcomes.last().is_some_and(|o| o.ok);
            if delivered {
                info!(
                    run_id = %envelope.run.id,
                    "Delivered {} webhook to {} after {} attempt(s)",
                    envelope.event,
                    target.url,
                    outcomes.len()
                );
            } else {
                let last = outcomes.last();
                warn!(
                    run_id = %envelope.run.id,
                    "Webhook {} to {} failed after {} attempt(s) (status: {:?}, error: {:?})",
                    envelope.event,
                    target.url,
                    outcomes.len(),
                    last.and_then(|o| o.status),
                    last.and_then(|o| o.error.as_deref())
                );
            }
            outcomes
        })
    }

    /// Cancel in-flight backoff sleeps
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
