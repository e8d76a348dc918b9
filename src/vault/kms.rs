//! Master key providers
//!
//! A [`KeyProvider`] hands out the 32-byte master key. The env provider
//! validates its key once at construction; the remote provider fetches the
//! key from a secret store over HTTP and keeps it in memory for the rest of
//! the process lifetime after the first successful fetch.

use crate::vault::{SecretKey, KEY_LEN};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Errors raised while obtaining the master key
#[derive(Debug, Error)]
pub enum KmsError {
    #[error("no KMS provider configured: set STEPIQ_KMS_ENDPOINT and STEPIQ_KMS_TOKEN, or STEPIQ_MASTER_KEY")]
    NotConfigured,

    #[error("invalid master key: {0}")]
    InvalidKey(String),

    #[error("secret store returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("secret store request failed: {0}")]
    Request(String),

    #[error("master key version {0} is not available from this provider")]
    UnknownVersion(u32),
}

/// Source of the master key
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Fetch the master key. `None` means the current version.
    async fn master_key(&self, version: Option<u32>) -> Result<SecretKey, KmsError>;

    /// Version number of the current master key
    fn current_version(&self) -> u32;

    /// Short provider name for logs
    fn name(&self) -> &'static str;
}

/// Parse a 64-hex-char master key
pub fn parse_master_key_hex(hex_key: &str) -> Result<SecretKey, KmsError> {
    let trimmed = hex_key.trim();
    if trimmed.len() != KEY_LEN * 2 {
        return Err(KmsError::InvalidKey(format!(
            "expected {} hex characters, got {}",
            KEY_LEN * 2,
            trimmed.len()
        )));
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hex::decode_to_slice(trimmed, key.as_mut_slice())
        .map_err(|e| KmsError::InvalidKey(e.to_string()))?;
    Ok(key)
}

/// Master key held in process environment
pub struct EnvKeyProvider {
    key: SecretKey,
    version: u32,
}

impl EnvKeyProvider {
    /// Build from a hex key, validating it immediately
    pub fn from_hex(hex_key: &str, version: u32) -> Result<Self, KmsError> {
        Ok(Self {
            key: parse_master_key_hex(hex_key)?,
            version,
        })
    }

    /// Build from a named environment variable
    pub fn from_env_var(var: &str, version: u32) -> Result<Self, KmsError> {
        let value = std::env::var(var).map_err(|_| KmsError::NotConfigured)?;
        Self::from_hex(&value, version)
    }
}

#[async_trait]
impl KeyProvider for EnvKeyProvider {
    async fn master_key(&self, version: Option<u32>) -> Result<SecretKey, KmsError> {
        match version {
            Some(v) if v != self.version => Err(KmsError::UnknownVersion(v)),
            _ => Ok(self.key.clone()),
        }
    }

    fn current_version(&self) -> u32 {
        self.version
    }

    fn name(&self) -> &'static str {
        "env"
    }
}

/// Remote secret store settings
#[derive(Clone)]
pub struct RemoteKmsSettings {
    pub endpoint: String,
    pub token: String,
    pub secret_path: String,
}

impl std::fmt::Debug for RemoteKmsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteKmsSettings")
            .field("endpoint", &self.endpoint)
            .field("token", &"[REDACTED]")
            .field("secret_path", &self.secret_path)
            .finish()
    }
}

/// Master key fetched from a remote secret store with a bearer token.
///
/// The raw key is cached in memory for the process lifetime once fetched.
pub struct RemoteKeyProvider {
    client: reqwest::Client,
    settings: RemoteKmsSettings,
    version: u32,
    cache: OnceCell<SecretKey>,
}

impl RemoteKeyProvider {
    pub fn new(settings: RemoteKmsSettings, version: u32) -> Result<Self, KmsError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| KmsError::Request(e.to_string()))?;

        Ok(Self {
            client,
            settings,
            version,
            cache: OnceCell::new(),
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/{}",
            self.settings.endpoint.trim_end_matches('/'),
            self.settings.secret_path.trim_start_matches('/')
        )
    }

    async fn fetch(&self) -> Result<SecretKey, KmsError> {
        let url = self.url();
        debug!(url = %url, "Fetching master key from secret store");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.settings.token)
            .send()
            .await
            .map_err(|e| KmsError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KmsError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| KmsError::Request(format!("invalid response body: {}", e)))?;

        let hex_key = extract_key_value(&payload).ok_or_else(|| {
            KmsError::InvalidKey("secret store response has no key value".to_string())
        })?;
        let key = parse_master_key_hex(hex_key)?;

        info!("Master key loaded from secret store");
        Ok(key)
    }
}

/// Accepts `{"secret":{"secretValue":..}}`, `{"data":{"value":..}}` or `{"value":..}`
fn extract_key_value(payload: &Value) -> Option<&str> {
    payload
        .pointer("/secret/secretValue")
        .or_else(|| payload.pointer("/data/value"))
        .or_else(|| payload.get("value"))
        .and_then(Value::as_str)
}

#[async_trait]
impl KeyProvider for RemoteKeyProvider {
    async fn master_key(&self, version: Option<u32>) -> Result<SecretKey, KmsError> {
        if let Some(v) = version {
            if v != self.version {
                return Err(KmsError::UnknownVersion(v));
            }
        }
        let key = self.cache.get_or_try_init(|| self.fetch()).await?;
        Ok(key.clone())
    }

    fn current_version(&self) -> u32 {
        self.version
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

/// Inputs for selecting a provider
#[derive(Clone, Default)]
pub struct KmsSettings {
    pub master_key_hex: Option<String>,
    pub master_key_version: u32,
    pub remote: Option<RemoteKmsSettings>,
}

impl std::fmt::Debug for KmsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsSettings")
            .field("master_key_hex", &self.master_key_hex.as_ref().map(|_| "[REDACTED]"))
            .field("master_key_version", &self.master_key_version)
            .field("remote", &self.remote)
            .finish()
    }
}

impl KmsSettings {
    /// Read from the `STEPIQ_MASTER_KEY*` and `STEPIQ_KMS_*` variables
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let remote = match (non_empty("STEPIQ_KMS_ENDPOINT"), non_empty("STEPIQ_KMS_TOKEN")) {
            (Some(endpoint), Some(token)) => Some(RemoteKmsSettings {
                endpoint,
                token,
                secret_path: non_empty("STEPIQ_KMS_SECRET_PATH")
                    .unwrap_or_else(|| "stepiq/master-key".to_string()),
            }),
            _ => None,
        };

        Self {
            master_key_hex: non_empty("STEPIQ_MASTER_KEY"),
            master_key_version: non_empty("STEPIQ_MASTER_KEY_VERSION")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            remote,
        }
    }
}

/// Pick a provider: remote store if configured, else env key, else fail.
///
/// Never falls back to a built-in key.
pub fn provider_from_settings(settings: &KmsSettings) -> Result<Arc<dyn KeyProvider>, KmsError> {
    let version = settings.master_key_version.max(1);

    if let Some(remote) = &settings.remote {
        info!(endpoint = %remote.endpoint, "Using remote KMS provider");
        return Ok(Arc::new(RemoteKeyProvider::new(remote.clone(), version)?));
    }

    if let Some(hex_key) = &settings.master_key_hex {
        info!("Using environment KMS provider");
        return Ok(Arc::new(EnvKeyProvider::from_hex(hex_key, version)?));
    }

    Err(KmsError::NotConfigured)
}

/// Like [`provider_from_settings`], but an unconfigured KMS is `Ok(None)`.
/// A configured provider that fails to build is still an error.
pub fn optional_provider(
    settings: &KmsSettings,
) -> Result<Option<Arc<dyn KeyProvider>>, KmsError> {
    match provider_from_settings(settings) {
        Ok(provider) => Ok(Some(provider)),
        Err(KmsError::NotConfigured) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const HEX_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    /// Answer every connection with a fixed status and body
    async fn serve(status: &'static str, body: String, hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}", addr)
    }

    fn remote(endpoint: String) -> RemoteKeyProvider {
        RemoteKeyProvider::new(
            RemoteKmsSettings {
                endpoint,
                token: "token".to_string(),
                secret_path: "/stepiq/master".to_string(),
            },
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_master_key_hex() {
        let key = parse_master_key_hex(HEX_KEY).unwrap();
        assert_eq!(key[0], 0);
        assert_eq!(key[31], 31);
        assert_matches!(parse_master_key_hex("abcd"), Err(KmsError::InvalidKey(_)));
        assert_matches!(parse_master_key_hex(&"zz".repeat(32)), Err(KmsError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_env_provider() {
        let provider = EnvKeyProvider::from_hex(HEX_KEY, 2).unwrap();
        assert_eq!(provider.master_key(None).await.unwrap()[1], 1);
        assert!(provider.master_key(Some(2)).await.is_ok());
        assert_matches!(provider.master_key(Some(1)).await, Err(KmsError::UnknownVersion(1)));
    }

    #[test]
    fn test_factory_fails_without_configuration() {
        let settings = KmsSettings::default();
        assert!(matches!(
            provider_from_settings(&settings),
            Err(KmsError::NotConfigured)
        ));
        assert!(optional_provider(&settings).unwrap().is_none());
    }

    #[test]
    fn test_malformed_master_key_is_not_reported_as_missing() {
        let settings = KmsSettings {
            master_key_hex: Some("abcd".to_string()),
            master_key_version: 1,
            remote: None,
        };
        assert!(matches!(
            optional_provider(&settings),
            Err(KmsError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_factory_prefers_remote() {
        let settings = KmsSettings {
            master_key_hex: Some(HEX_KEY.to_string()),
            master_key_version: 1,
            remote: Some(RemoteKmsSettings {
                endpoint: "http://localhost:1".to_string(),
                token: "t".to_string(),
                secret_path: "p".to_string(),
            }),
        };
        assert_eq!(provider_from_settings(&settings).unwrap().name(), "remote");

        let env_only = KmsSettings { remote: None, ..settings };
        assert_eq!(provider_from_settings(&env_only).unwrap().name(), "env");
    }

    #[tokio::test]
    async fn test_remote_provider_caches_after_first_fetch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let body = format!(r#"{{"secret":{{"secretValue":"{}"}}}}"#, HEX_KEY);
        let endpoint = serve("200 OK", body, hits.clone()).await;
        let provider = remote(endpoint);

        let first = provider.master_key(None).await.unwrap();
        let second = provider.master_key(None).await.unwrap();

        assert_eq!(*first, *second);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_provider_surfaces_status() {
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = serve("403 Forbidden", r#"{"error":"denied"}"#.to_string(), hits).await;
        let provider = remote(endpoint);

        let err = provider.master_key(None).await.unwrap_err();
        assert_matches!(err, KmsError::Http { status: 403, .. });
    }
}
