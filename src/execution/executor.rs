//! Step executor - runs individual steps against the model capability

use crate::{
    core::{interpolate, ExecutionContext, OutputFormat, StepDefinition, StepKind, TemplateError},
    model::{api_key_name, ModelClient, ModelError, ModelRequest},
};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Why a step failed
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Step type '{0}' is not implemented")]
    NotImplemented(&'static str),
}

/// Everything a successful step produced
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Rendered prompt as sent
    pub prompt_sent: String,
    pub raw_output: String,
    /// Output stored into the context for later steps
    pub parsed_output: Value,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_cents: f64,
}

/// Executes a single step
pub struct StepExecutor {
    model: Arc<dyn ModelClient>,
}

impl StepExecutor {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }

    /// Execute a step against the current context
    pub async fn execute(
        &self,
        step: &StepDefinition,
        context: &ExecutionContext,
    ) -> Result<StepOutput, StepError> {
        info!("Executing step: {} ({})", step.id, step.kind.type_name());
        let rendering = context.to_value();

        match &step.kind {
            StepKind::Llm(llm) => {
                let prompt = interpolate(&llm.prompt, &rendering)?;
                let system = llm
                    .system_prompt
                    .as_deref()
                    .map(|s| interpolate(s, &rendering))
                    .transpose()?;
                let api_key = api_key_name(&llm.model)
                    .and_then(|name| context.env(name))
                    .map(str::to_string);

                debug!("Prompt for step {} is {} bytes", step.id, prompt.len());

                let response = self
                    .model
                    .call_model(ModelRequest {
                        model: llm.model.clone(),
                        prompt: prompt.clone(),
                        system,
                        temperature: llm.temperature,
                        max_tokens: llm.max_tokens,
                        output_format: llm.output_format,
                        api_key,
                    })
                    .await?;

                let parsed_output = match llm.output_format {
                    OutputFormat::Json => parse_json_output(&response.output),
                    OutputFormat::Text => Value::String(response.output.clone()),
                };

                Ok(StepOutput {
                    prompt_sent: prompt,
                    raw_output: response.output,
                    parsed_output,
                    input_tokens: response.input_tokens,
                    output_tokens: response.output_tokens,
                    cost_cents: response.cost_cents,
                })
            }
            StepKind::Transform(transform) => {
                let rendered = interpolate(&transform.prompt, &rendering)?;
                Ok(StepOutput {
                    prompt_sent: rendered.clone(),
                    raw_output: rendered.clone(),
                    parsed_output: Value::String(rendered),
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_cents: 0.0,
                })
            }
            StepKind::Parallel(_)
            | StepKind::Condition(_)
            | StepKind::HumanReview(_)
            | StepKind::Code(_) => Err(StepError::NotImplemented(step.kind.type_name())),
        }
    }
}

/// Parse model output as JSON, tolerating a surrounding Markdown code fence.
/// Falls back to the raw string.
pub fn parse_json_output(raw: &str) -> Value {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    serde_json::from_str(unfenced).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineDefinition;
    use crate::model::ModelResponse;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::sync::Mutex;

    /// Records requests and answers with a fixed output
    struct RecordingModel {
        output: String,
        requests: Mutex<Vec<ModelRequest>>,
    }

    #[async_trait]
    impl ModelClient for RecordingModel {
        async fn call_model(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
            self.requests.lock().unwrap().push(request);
            Ok(ModelResponse {
                output: self.output.clone(),
                input_tokens: 7,
                output_tokens: 3,
                cost_cents: 0.5,
            })
        }
    }

    fn executor(output: &str) -> (StepExecutor, Arc<RecordingModel>) {
        let model = Arc::new(RecordingModel {
            output: output.to_string(),
            requests: Mutex::new(Vec::new()),
        });
        (StepExecutor::new(model.clone()), model)
    }

    fn definition(yaml: &str) -> PipelineDefinition {
        PipelineDefinition::from_yaml(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_llm_step_renders_and_passes_api_key() {
        let def = definition(
            r#"
name: "p"
steps:
  - id: "a"
    type: "llm"
    model: "gpt-4o-mini"
    system_prompt: "Be {{vars.mood}}"
    prompt: "Write about {{input.topic}}"
    output_format: "json"
"#,
        );
        let mut vars = Map::new();
        vars.insert("mood".into(), json!("brief"));
        let mut ctx = ExecutionContext::new(json!({"topic": "ferris"}), vars);
        ctx.set_env("OPENAI_API_KEY", "sk-test-1234");

        let (executor, model) = executor(r#"{"title": "Ferris"}"#);
        let output = executor.execute(&def.steps[0], &ctx).await.unwrap();

        assert_eq!(output.parsed_output, json!({"title": "Ferris"}));
        assert_eq!(output.prompt_sent, "Write about ferris");
        assert_eq!(output.input_tokens, 7);

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests[0].system.as_deref(), Some("Be brief"));
        assert_eq!(requests[0].api_key.as_deref(), Some("sk-test-1234"));
    }

    #[tokio::test]
    async fn test_missing_api_key_is_passed_as_none() {
        let def = definition(
            r#"
name: "p"
steps:
  - id: "a"
    type: "llm"
    model: "claude-3-5-haiku"
    prompt: "hi"
"#,
        );
        let (executor, model) = executor("hello");
        let output = executor
            .execute(&def.steps[0], &ExecutionContext::default())
            .await
            .unwrap();
        assert_eq!(output.parsed_output, json!("hello"));
        assert!(model.requests.lock().unwrap()[0].api_key.is_none());
    }

    #[tokio::test]
    async fn test_transform_makes_no_model_call() {
        let def = definition(
            r#"
name: "p"
steps:
  - id: "a"
    type: "transform"
    prompt: "Hello {{input.name}}"
"#,
        );
        let ctx = ExecutionContext::new(json!({"name": "World"}), Map::new());
        let (executor, model) = executor("unused");
        let output = executor.execute(&def.steps[0], &ctx).await.unwrap();

        assert_eq!(output.parsed_output, json!("Hello World"));
        assert!(model.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unimplemented_kinds_fail_explicitly() {
        let def = definition(
            r#"
name: "p"
steps:
  - id: "branch"
    type: "condition"
"#,
        );
        let (executor, _) = executor("unused");
        let err = executor
            .execute(&def.steps[0], &ExecutionContext::default())
            .await
            .unwrap_err();
        assert_matches!(err, StepError::NotImplemented("condition"));
    }

    #[test]
    fn test_json_parse_falls_back_to_raw() {
        assert_eq!(parse_json_output("[1, 2]"), json!([1, 2]));
        assert_eq!(parse_json_output("```json\n{\"a\": 1}\n```"), json!({"a": 1}));
        assert_eq!(parse_json_output("not json {"), json!("not json {"));
    }
}
