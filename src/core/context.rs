//! Execution context - the data templates are rendered against

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Context for a single run.
///
/// Rendered to templates as `input`, `vars`, `env` and `steps`, where
/// `steps.<id>.output` holds each completed step's parsed output.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    /// The run's input data
    pub input: Value,

    /// Definition variables
    pub vars: Map<String, Value>,

    /// Decrypted secrets by name
    env: BTreeMap<String, String>,

    /// Outputs of completed steps (step_id -> {"output": ..})
    steps: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(input: Value, vars: Map<String, Value>) -> Self {
        Self {
            input,
            vars,
            env: BTreeMap::new(),
            steps: Map::new(),
        }
    }

    /// Set a decrypted secret
    pub fn set_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.env.insert(name.into(), value.into());
    }

    /// Get a decrypted secret
    pub fn env(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    /// Record a step's parsed output
    pub fn set_step_output(&mut self, step_id: &str, output: Value) {
        self.steps
            .insert(step_id.to_string(), json!({ "output": output }));
    }

    /// Parsed output of a completed step
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id).and_then(|s| s.get("output"))
    }

    /// JSON view used for template rendering
    pub fn to_value(&self) -> Value {
        json!({
            "input": self.input,
            "vars": self.vars,
            "env": self.env,
            "steps": self.steps,
        })
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("input", &self.input)
            .field("vars", &self.vars)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("steps", &self.steps)
            .finish()
    }
}
