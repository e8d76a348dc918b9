//! Pipeline definitions
//!
//! Definitions are stored as JSON inside pipeline versions and can be
//! written as YAML for local validation. Step kinds are a tagged enum on the
//! `type` field.

use crate::core::template;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;

/// A versioned pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Variables exposed to templates as `vars.*`
    #[serde(default)]
    pub variables: Map<String, Value>,

    /// Steps, executed strictly in order
    pub steps: Vec<StepDefinition>,

    /// Which step's output becomes the run output
    #[serde(default)]
    pub output: Option<OutputConfig>,

    /// Webhook to notify when a run finishes
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

/// A single step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique step identifier
    pub id: String,

    /// Human-readable step name
    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub kind: StepKind,
}

/// Step kinds, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Call a model
    Llm(LlmStep),
    /// Render a template, no network call
    Transform(TransformStep),
    /// Declared in the schema, not executable yet
    Parallel(UnsupportedStep),
    Condition(UnsupportedStep),
    HumanReview(UnsupportedStep),
    Code(UnsupportedStep),
}

/// Model call configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmStep {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub output_format: OutputFormat,
}

/// Template-only step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformStep {
    pub prompt: String,
}

/// Placeholder body for kinds without execution semantics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnsupportedStep {}

/// How model output is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Run output selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Step id whose output becomes the run output (default: last step)
    #[serde(default)]
    pub from: Option<String>,
}

/// Completion webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,

    #[serde(default = "default_webhook_method")]
    pub method: String,

    /// Template for the HMAC signing secret, e.g. `{{env.WEBHOOK_SECRET}}`
    #[serde(default)]
    pub signing_secret: Option<String>,

    /// Events to deliver; empty means every event
    #[serde(default)]
    pub events: Vec<String>,
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

impl WebhookConfig {
    pub fn wants(&self, event: &str) -> bool {
        self.events.is_empty() || self.events.iter().any(|e| e == event)
    }
}

impl StepKind {
    /// Name as written in the `type` field
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Llm(_) => "llm",
            StepKind::Transform(_) => "transform",
            StepKind::Parallel(_) => "parallel",
            StepKind::Condition(_) => "condition",
            StepKind::HumanReview(_) => "human_review",
            StepKind::Code(_) => "code",
        }
    }

    /// Templates rendered when this step runs
    pub fn templates(&self) -> Vec<&str> {
        match self {
            StepKind::Llm(llm) => {
                let mut templates = vec![llm.prompt.as_str()];
                if let Some(system) = &llm.system_prompt {
                    templates.push(system.as_str());
                }
                templates
            }
            StepKind::Transform(transform) => vec![transform.prompt.as_str()],
            StepKind::Parallel(_)
            | StepKind::Condition(_)
            | StepKind::HumanReview(_)
            | StepKind::Code(_) => Vec::new(),
        }
    }
}

impl PipelineDefinition {
    /// Load a definition from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a definition from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(yaml)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Parse a definition from stored JSON
    pub fn from_json(value: &Value) -> Result<Self> {
        let definition: PipelineDefinition = serde_json::from_value(value.clone())?;
        definition.validate()?;
        Ok(definition)
    }

    /// Validate the definition
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            anyhow::bail!("Pipeline '{}' has no steps", self.name);
        }

        // Steps may only reference earlier steps
        let mut earlier: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                anyhow::bail!("Step ids must not be empty");
            }
            if earlier.contains(step.id.as_str()) {
                anyhow::bail!("Duplicate step ID: {}", step.id);
            }

            for text in step.kind.templates() {
                for referenced in template::referenced_steps(text) {
                    if !earlier.contains(referenced.as_str()) {
                        anyhow::bail!(
                            "Step '{}' references step '{}' which does not run before it",
                            step.id,
                            referenced
                        );
                    }
                }
            }

            earlier.insert(step.id.as_str());
        }

        if let Some(from) = self.output.as_ref().and_then(|o| o.from.as_ref()) {
            if !earlier.contains(from.as_str()) {
                anyhow::bail!("Output references non-existent step '{}'", from);
            }
        }

        if let Some(webhook) = &self.webhook {
            if !(webhook.url.starts_with("http://") || webhook.url.starts_with("https://")) {
                anyhow::bail!("Webhook URL must be http(s): {}", webhook.url);
            }
        }

        Ok(())
    }

    /// Step whose output becomes the run output
    pub fn output_step_id(&self) -> Option<&str> {
        self.output
            .as_ref()
            .and_then(|o| o.from.as_deref())
            .or_else(|| self.steps.last().map(|s| s.id.as_str()))
    }

    /// Every template in the definition, including the webhook signing secret
    pub fn all_templates(&self) -> Vec<&str> {
        let mut templates: Vec<&str> = self.steps.iter().flat_map(|s| s.kind.templates()).collect();
        if let Some(secret) = self.webhook.as_ref().and_then(|w| w.signing_secret.as_deref()) {
            templates.push(secret);
        }
        templates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const TWO_STEPS: &str = r#"
name: "Summarise"
variables:
  tone: "formal"
steps:
  - id: "draft"
    type: "llm"
    model: "gpt-4o-mini"
    prompt: "Summarise {{input.text}} in a {{vars.tone}} tone"
    system_prompt: "You are terse"
    temperature: 0.2
    max_tokens: 400
  - id: "format"
    type: "transform"
    prompt: "Summary: {{steps.draft.output}}"
output:
  from: "draft"
"#;

    #[test]
    fn test_parse_yaml_definition() {
        let definition = PipelineDefinition::from_yaml(TWO_STEPS).unwrap();
        assert_eq!(definition.steps.len(), 2);
        assert_matches!(&definition.steps[0].kind, StepKind::Llm(llm) if llm.model == "gpt-4o-mini" && llm.max_tokens == Some(400));
        assert_matches!(&definition.steps[1].kind, StepKind::Transform(_));
        assert_eq!(definition.output_step_id(), Some("draft"));
        assert_eq!(definition.variables.get("tone"), Some(&Value::String("formal".into())));
    }

    #[test]
    fn test_parse_json_definition_with_defaults() {
        let json = serde_json::json!({
            "name": "p",
            "steps": [
                {"id": "a", "type": "llm", "model": "claude-3-5-haiku", "prompt": "hi", "output_format": "json"},
                {"id": "b", "type": "human_review", "reviewers": ["x"]}
            ]
        });
        let definition = PipelineDefinition::from_json(&json).unwrap();
        assert_matches!(&definition.steps[0].kind, StepKind::Llm(llm) if llm.output_format == OutputFormat::Json);
        assert_eq!(definition.steps[1].kind.type_name(), "human_review");
        assert_eq!(definition.output_step_id(), Some("b"));
    }

    #[test]
    fn test_unknown_step_type_is_rejected() {
        let json = serde_json::json!({
            "name": "p",
            "steps": [{"id": "a", "type": "teleport"}]
        });
        assert!(PipelineDefinition::from_json(&json).is_err());
    }

    #[test]
    fn test_forward_reference_is_rejected() {
        let yaml = r#"
name: "Bad"
steps:
  - id: "first"
    type: "transform"
    prompt: "{{steps.second.output}}"
  - id: "second"
    type: "transform"
    prompt: "x"
"#;
        let err = PipelineDefinition::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("does not run before it"));
    }

    #[test]
    fn test_duplicate_ids_and_empty_steps() {
        let duplicate = r#"
name: "Dup"
steps:
  - id: "a"
    type: "transform"
    prompt: "x"
  - id: "a"
    type: "transform"
    prompt: "y"
"#;
        assert!(PipelineDefinition::from_yaml(duplicate).is_err());
        assert!(PipelineDefinition::from_yaml("name: empty\nsteps: []\n").is_err());
    }

    #[test]
    fn test_output_must_reference_existing_step() {
        let yaml = r#"
name: "Out"
steps:
  - id: "a"
    type: "transform"
    prompt: "x"
output:
  from: "missing"
"#;
        assert!(PipelineDefinition::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_webhook_defaults() {
        let yaml = r#"
name: "Hooked"
steps:
  - id: "a"
    type: "transform"
    prompt: "x"
webhook:
  url: "https://example.com/hook"
  signing_secret: "{{env.WEBHOOK_SECRET}}"
"#;
        let definition = PipelineDefinition::from_yaml(yaml).unwrap();
        let webhook = definition.webhook.as_ref().unwrap();
        assert_eq!(webhook.method, "POST");
        assert!(webhook.wants("run.completed"));
        assert!(definition.all_templates().contains(&"{{env.WEBHOOK_SECRET}}"));
    }
}
