//! HTTP client for the model gateway

use super::{ModelClient, ModelError, ModelRequest, ModelResponse};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for the model gateway client
#[derive(Debug, Clone)]
pub struct ModelClientConfig {
    /// Gateway base URL, e.g. `http://model-gateway:8080`
    pub endpoint: Option<String>,

    /// Timeout for a single call in seconds
    pub timeout_secs: u64,
}

impl Default for ModelClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 300,
        }
    }
}

impl ModelClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// Calls `POST {endpoint}/v1/call` with the request as JSON
#[derive(Debug, Clone)]
pub struct GatewayModelClient {
    client: reqwest::Client,
    endpoint: Option<String>,
    timeout_secs: u64,
}

impl GatewayModelClient {
    pub fn new(config: ModelClientConfig) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ModelError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config
                .endpoint
                .map(|e| e.trim_end_matches('/').to_string()),
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl ModelClient for GatewayModelClient {
    async fn call_model(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let endpoint = self.endpoint.as_deref().ok_or(ModelError::NotConfigured)?;
        debug!(
            "Calling model {} with prompt length: {}",
            request.model,
            request.prompt.len()
        );

        let response = self
            .client
            .post(format!("{}/v1/call", endpoint))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(self.timeout_secs)
                } else {
                    ModelError::Internal(format!("Model gateway request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Model gateway returned {}: {}", status.as_u16(), body.trim());
            return Err(ModelError::Api(format!(
                "model gateway returned {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        let parsed: ModelResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Internal(format!("Failed to decode model response: {}", e)))?;

        debug!(
            "Model {} returned {} bytes ({} in / {} out tokens)",
            request.model,
            parsed.output.len(),
            parsed.input_tokens,
            parsed.output_tokens
        );

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OutputFormat;

    #[test]
    fn test_config_builder() {
        let config = ModelClientConfig::new()
            .with_endpoint("http://localhost:8080/")
            .with_timeout(60);

        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:8080/"));
        assert_eq!(config.timeout_secs, 60);

        let client = GatewayModelClient::new(config).unwrap();
        assert_eq!(client.endpoint.as_deref(), Some("http://localhost:8080"));
    }

    #[tokio::test]
    async fn test_unconfigured_gateway() {
        let client = GatewayModelClient::new(ModelClientConfig::default()).unwrap();
        let result = client
            .call_model(ModelRequest {
                model: "gpt-4o".into(),
                prompt: "hi".into(),
                system: None,
                temperature: None,
                max_tokens: None,
                output_format: OutputFormat::Text,
                api_key: None,
            })
            .await;
        assert!(matches!(result, Err(ModelError::NotConfigured)));
    }
}
