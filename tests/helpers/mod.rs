//! Test utility functions for stepiq-worker
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stepiq_worker::core::{
    NewRun, Pipeline, Run, RunStatus, StepExecution, StepStatus, TriggerType, UserSecret,
};
use stepiq_worker::execution::{RunOrchestrator, RunOutcome};
use stepiq_worker::model::{ModelClient, ModelError, ModelRequest, ModelResponse};
use stepiq_worker::persistence::{InMemoryStore, Store};
use stepiq_worker::vault::{encrypt_secret, kms::EnvKeyProvider, KeyProvider};
use stepiq_worker::webhook::{
    AttemptOutcome, RetryPolicy, WebhookDispatcher, WebhookError, WebhookRequest,
    WebhookTransport,
};
use uuid::Uuid;

pub const USER: &str = "user-1";
pub const MASTER_KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

/// One scripted model reply
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Error(String),
}

/// Model that answers from a script, in order
pub struct MockModel {
    replies: Arc<Vec<Reply>>,
    index: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<ModelRequest>>>,
    simulate_delay: Option<Duration>,
}

impl MockModel {
    /// Every call succeeds with the next text
    pub fn new(responses: Vec<&str>) -> Self {
        Self::scripted(responses.into_iter().map(|r| Reply::Text(r.to_string())).collect())
    }

    pub fn scripted(replies: Vec<Reply>) -> Self {
        Self {
            replies: Arc::new(replies),
            index: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            simulate_delay: None,
        }
    }

    /// Add artificial delay to simulate a slow model
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.simulate_delay = Some(delay);
        self
    }

    /// Number of calls made so far
    pub fn calls(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for MockModel {
    async fn call_model(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        if let Some(delay) = self.simulate_delay {
            tokio::time::sleep(delay).await;
        }

        self.requests.lock().unwrap().push(request);
        let idx = self.index.fetch_add(1, Ordering::SeqCst);

        match self.replies.get(idx) {
            Some(Reply::Text(text)) => Ok(ModelResponse {
                output: text.clone(),
                input_tokens: 10,
                output_tokens: 5,
                cost_cents: 0.25,
            }),
            Some(Reply::Error(message)) => Err(ModelError::Api(message.clone())),
            None => Err(ModelError::Internal(format!(
                "MockModel: No response available for request {}",
                idx + 1
            ))),
        }
    }
}

/// Webhook transport that answers from a list of statuses and records requests
pub struct MockTransport {
    statuses: Arc<Vec<Result<u16, String>>>,
    index: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<WebhookRequest>>>,
}

impl MockTransport {
    pub fn new(statuses: Vec<u16>) -> Self {
        Self::scripted(statuses.into_iter().map(Ok).collect())
    }

    /// `Err` entries simulate a network failure
    pub fn scripted(statuses: Vec<Result<u16, String>>) -> Self {
        Self {
            statuses: Arc::new(statuses),
            index: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<WebhookRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookTransport for MockTransport {
    async fn send(&self, request: &WebhookRequest, _timeout: Duration) -> Result<u16, WebhookError> {
        self.requests.lock().unwrap().push(request.clone());
        let idx = self.index.fetch_add(1, Ordering::SeqCst);
        match self.statuses.get(idx) {
            Some(Ok(status)) => Ok(*status),
            Some(Err(message)) => Err(WebhookError::Request(message.clone())),
            None => Ok(200),
        }
    }
}

/// Parse an inline YAML definition into the stored JSON form
pub fn definition_json(yaml: &str) -> Value {
    serde_yaml::from_str(yaml).expect("test definition is valid YAML")
}

/// Store a pipeline with `yaml` as its current version
pub async fn seed_pipeline(store: &InMemoryStore, yaml: &str) -> Pipeline {
    let pipeline = Pipeline {
        id: Uuid::new_v4(),
        user_id: USER.to_string(),
        name: "Test pipeline".to_string(),
        current_version: 1,
    };
    store
        .insert_pipeline(pipeline.clone(), definition_json(yaml))
        .await;
    pipeline
}

/// Create a pending run for `pipeline`
pub async fn seed_run(store: &InMemoryStore, pipeline: &Pipeline, input: Value) -> Run {
    store
        .create_run(NewRun {
            pipeline_id: pipeline.id,
            pipeline_version: pipeline.current_version,
            user_id: pipeline.user_id.clone(),
            trigger_type: TriggerType::Manual,
            input_data: input,
        })
        .await
        .unwrap()
}

/// Encrypt and store a secret under the test master key
pub async fn seed_secret(
    store: &InMemoryStore,
    pipeline_id: Option<Uuid>,
    name: &str,
    value: &str,
) {
    let key = hex::decode(MASTER_KEY_HEX).unwrap();
    store
        .insert_secret(UserSecret {
            id: Uuid::new_v4(),
            user_id: USER.to_string(),
            pipeline_id,
            name: name.to_string(),
            encrypted_value: encrypt_secret(USER, value, &key).unwrap(),
            key_version: 1,
        })
        .await;
}

pub fn test_kms() -> Arc<dyn KeyProvider> {
    Arc::new(EnvKeyProvider::from_hex(MASTER_KEY_HEX, 1).unwrap())
}

/// Orchestrator over `store` with the test KMS
pub fn orchestrator(store: Arc<InMemoryStore>, model: Arc<MockModel>) -> RunOrchestrator {
    RunOrchestrator::new(store, model, Some(test_kms()))
}

/// Orchestrator that delivers webhooks through `transport` without backoff
pub fn orchestrator_with_webhooks(
    store: Arc<InMemoryStore>,
    model: Arc<MockModel>,
    transport: Arc<MockTransport>,
) -> RunOrchestrator {
    let dispatcher =
        WebhookDispatcher::new(transport, RetryPolicy::immediate(3), Duration::from_secs(1));
    orchestrator(store, model).with_webhooks(dispatcher)
}

/// Everything observable about a finished run
#[derive(Debug, Clone)]
pub struct RunTestResult {
    pub outcome: RunOutcome,
    pub run: Run,
    pub steps: Vec<StepExecution>,
    pub webhook_attempts: Option<Vec<AttemptOutcome>>,
}

impl RunTestResult {
    pub fn step(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.step_id.as_str()).collect()
    }
}

/// Execute `run_id` and collect its records, waiting for any webhook
pub async fn execute(
    orchestrator: &RunOrchestrator,
    store: &InMemoryStore,
    run_id: Uuid,
) -> RunTestResult {
    let (outcome, delivery) = orchestrator
        .execute_run_with_delivery(run_id)
        .await
        .expect("run executes");
    let webhook_attempts = match delivery {
        Some(handle) => Some(handle.await.expect("delivery task")),
        None => None,
    };

    RunTestResult {
        outcome,
        run: store.get_run(run_id).await.unwrap().unwrap(),
        steps: store.list_step_executions(run_id).await.unwrap(),
        webhook_attempts,
    }
}

// Assertions

pub fn assert_run_status(result: &RunTestResult, status: RunStatus) {
    assert_eq!(
        result.run.status, status,
        "expected run to be {:?}, outcome was {:?}",
        status, result.outcome
    );
}

pub fn assert_step_status(result: &RunTestResult, step_id: &str, status: StepStatus) {
    let step = result
        .step(step_id)
        .unwrap_or_else(|| panic!("step {} has no execution record", step_id));
    assert_eq!(step.status, status, "step {} status", step_id);
}

pub fn assert_no_secret_leak(result: &RunTestResult, secret: &str) {
    let run_json = serde_json::to_string(&result.run).unwrap();
    assert!(!run_json.contains(secret), "secret leaked into run: {}", run_json);
    for step in &result.steps {
        let step_json = serde_json::to_string(step).unwrap();
        assert!(
            !step_json.contains(secret),
            "secret leaked into step {}: {}",
            step.step_id,
            step_json
        );
    }
}
