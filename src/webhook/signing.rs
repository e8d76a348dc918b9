//! Webhook payload signing
//!
//! `X-StepIQ-Signature: v1=<hex HMAC-SHA256(secret, "<timestamp>.<body>")>`

use super::WebhookError;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signature scheme prefix
pub const SIGNATURE_VERSION: &str = "v1";

fn mac_for(secret: &str, timestamp: i64, body: &str) -> Result<HmacSha256, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::Signing(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    Ok(mac)
}

/// Compute the signature header value for a body sent at `timestamp` (unix seconds)
pub fn sign_payload(secret: &str, timestamp: i64, body: &str) -> Result<String, WebhookError> {
    let digest = mac_for(secret, timestamp, body)?.finalize().into_bytes();
    Ok(format!("{}={}", SIGNATURE_VERSION, hex::encode(digest)))
}

/// Check a signature header in constant time
pub fn verify_signature(secret: &str, timestamp: i64, body: &str, header: &str) -> bool {
    let Some(hex_digest) = header.strip_prefix("v1=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mac) = mac_for(secret, timestamp, body) else {
        return false;
    };
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_format_and_determinism() {
        let a = sign_payload("whsec", 1_700_000_000, r#"{"event":"run.completed"}"#).unwrap();
        let b = sign_payload("whsec", 1_700_000_000, r#"{"event":"run.completed"}"#).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("v1="));
        assert_eq!(a.len(), 3 + 64);
    }

    #[test]
    fn test_signature_binds_timestamp_body_and_secret() {
        let sig = sign_payload("whsec", 100, "body").unwrap();
        assert!(verify_signature("whsec", 100, "body", &sig));
        assert!(!verify_signature("whsec", 101, "body", &sig));
        assert!(!verify_signature("whsec", 100, "body!", &sig));
        assert!(!verify_signature("other", 100, "body", &sig));
        assert!(!verify_signature("whsec", 100, "body", "v2=00"));
        assert!(!verify_signature("whsec", 100, "body", "v1=zz"));
    }

    #[test]
    fn test_empty_secret_still_signs() {
        let sig = sign_payload("", 100, "body").unwrap();
        assert!(verify_signature("", 100, "body", &sig));
    }

    #[test]
    fn test_known_vector() {
        // HMAC-SHA256("key", "0.") computed independently
        let mut mac = HmacSha256::new_from_slice(b"key").unwrap();
        mac.update(b"0.");
        let expected = format!("v1={}", hex::encode(mac.finalize().into_bytes()));
        assert_eq!(sign_payload("key", 0, "").unwrap(), expected);
    }
}
