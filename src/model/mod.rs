//! Model capability - the external service that runs LLM calls

pub mod client;
pub mod provider;

use crate::core::OutputFormat;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::{GatewayModelClient, ModelClientConfig};
pub use provider::{api_key_name, Provider};

/// Error types for model calls
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("No model gateway configured")]
    NotConfigured,
}

/// A single model call
#[derive(Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub output_format: OutputFormat,
    /// The user's provider key, when they have one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl std::fmt::Debug for ModelRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRequest")
            .field("model", &self.model)
            .field("prompt_len", &self.prompt.len())
            .field("system", &self.system.as_ref().map(|s| s.len()))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("output_format", &self.output_format)
            .field("api_key", &self.api_key.as_ref().map(|_| "<set>"))
            .finish()
    }
}

/// Result of a model call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Raw text output
    pub output: String,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub cost_cents: f64,
}

impl ModelResponse {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }
}

/// Trait for model execution - allows for different implementations
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call_model(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}
