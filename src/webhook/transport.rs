//! Outbound HTTP for webhook delivery

use super::WebhookError;
use async_trait::async_trait;
use std::time::Duration;

/// A fully prepared delivery request
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl WebhookRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Sends a webhook request and reports the HTTP status
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn send(&self, request: &WebhookRequest, timeout: Duration) -> Result<u16, WebhookError>;
}

/// Transport backed by a shared reqwest client
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn send(&self, request: &WebhookRequest, timeout: Duration) -> Result<u16, WebhookError> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| WebhookError::InvalidMethod(request.method.clone()))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                WebhookError::Timeout(timeout.as_millis() as u64)
            } else {
                WebhookError::Request(e.to_string())
            }
        })?;

        Ok(response.status().as_u16())
    }
}
