//! Signed delivery with exponential backoff

use super::signing::sign_payload;
use super::transport::{WebhookRequest, WebhookTransport};
use super::{
    DeliveryMeta, WebhookEnvelope, WebhookError, WebhookTarget, EVENT_HEADER, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Attempt budget and backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles each time
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Retries without sleeping
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): 1s, 2s, 4s, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub attempt: u32,
    pub ok: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
}

enum Verdict {
    Delivered,
    Terminal,
    Retry,
}

fn classify(result: &Result<u16, super::WebhookError>) -> Verdict {
    match result {
        Ok(status) if (200..300).contains(status) => Verdict::Delivered,
        Ok(status) if (400..500).contains(status) => Verdict::Terminal,
        _ => Verdict::Retry,
    }
}

fn build_request(
    target: &WebhookTarget,
    envelope: &WebhookEnvelope,
    attempt: u32,
) -> Result<WebhookRequest, WebhookError> {
    let mut stamped = envelope.clone();
    stamped.meta = Some(DeliveryMeta {
        sent_at: Utc::now(),
        attempt,
    });
    let body =
        serde_json::to_string(&stamped).map_err(|e| WebhookError::Payload(e.to_string()))?;
    let timestamp = Utc::now().timestamp();

    let mut headers = vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        (EVENT_HEADER.to_string(), envelope.event.clone()),
        (TIMESTAMP_HEADER.to_string(), timestamp.to_string()),
    ];
    if let Some(secret) = target.signing_secret.as_deref() {
        headers.push((
            SIGNATURE_HEADER.to_string(),
            sign_payload(secret, timestamp, &body)?,
        ));
    }

    Ok(WebhookRequest {
        url: target.url.clone(),
        method: target.method.clone(),
        headers,
        body,
    })
}

/// Deliver an envelope, retrying 5xx and transport errors.
///
/// A 2xx stops with success and a 4xx stops as a permanent failure. Every
/// attempt's outcome is returned. Cancelling `cancel` ends the backoff sleep
/// and stops further attempts.
pub async fn deliver_webhook_with_retry(
    transport: &dyn WebhookTransport,
    target: &WebhookTarget,
    envelope: &WebhookEnvelope,
    policy: &RetryPolicy,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Vec<AttemptOutcome> {
    let mut outcomes = Vec::new();

    for attempt in 1..=policy.max_attempts.max(1) {
        let request = match build_request(target, envelope, attempt) {
            Ok(request) => request,
            Err(e) => {
                outcomes.push(AttemptOutcome {
                    attempt,
                    ok: false,
                    status: None,
                    error: Some(e.to_string()),
                });
                break;
            }
        };

        let result = transport.send(&request, timeout).await;
        let verdict = classify(&result);
        let outcome = match &result {
            Ok(status) => AttemptOutcome {
                attempt,
                ok: matches!(verdict, Verdict::Delivered),
                status: Some(*status),
                error: None,
            },
            Err(e) => AttemptOutcome {
                attempt,
                ok: false,
                status: None,
                error: Some(e.to_string()),
            },
        };
        debug!(attempt, url = %target.url, "Webhook attempt: {:?}", outcome);
        outcomes.push(outcome);

        match verdict {
            Verdict::Delivered | Verdict::Terminal => break,
            Verdict::Retry if attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(attempt, url = %target.url, "Webhook delivery failed, retrying in {:?}", delay);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!(url = %target.url, "Webhook delivery cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Verdict::Retry => {}
        }
    }

    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
        assert_eq!(policy.delay_for(64), Duration::from_secs(60));
    }

    #[test]
    fn test_immediate_policy_never_sleeps() {
        let policy = RetryPolicy::immediate(5);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for(4), Duration::ZERO);
    }

    #[test]
    fn test_classification() {
        assert!(matches!(classify(&Ok(204)), Verdict::Delivered));
        assert!(matches!(classify(&Ok(404)), Verdict::Terminal));
        assert!(matches!(classify(&Ok(503)), Verdict::Retry));
        assert!(matches!(classify(&Ok(301)), Verdict::Retry));
        assert!(matches!(
            classify(&Err(super::super::WebhookError::Timeout(10))),
            Verdict::Retry
        ));
    }
}
