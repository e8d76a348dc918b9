//! Master key rotation
//!
//! Re-wraps every stored secret's DEK envelope from the old master key to the
//! new one. A secret that fails is recorded in the report and the batch
//! carries on.

use super::{decrypt_secret, rewrap_secret, VaultError};
use crate::persistence::Store;
use anyhow::Result;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Outcome of a rotation batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RotationReport {
    /// Secrets examined
    pub total: usize,
    /// Secrets re-wrapped (or that would be, in a dry run)
    pub rewrapped: usize,
    /// Secrets that already open under the new key
    pub skipped: usize,
    /// Secrets that could not be re-wrapped, with the reason
    pub failed: Vec<(Uuid, String)>,
    pub dry_run: bool,
}

impl RotationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Re-wrap every secret from `old_key` to `new_key`.
///
/// A secret is skipped only when it already decrypts under `new_key`; the
/// stored key version is not trusted for that. Each re-wrapped blob is
/// decrypted under the new key before it is written. With `dry_run` nothing
/// is persisted.
pub async fn rotate_all_secrets(
    store: &dyn Store,
    old_key: &[u8],
    new_key: &[u8],
    new_version: u32,
    dry_run: bool,
) -> Result<RotationReport> {
    let secrets = store.list_secrets().await?;
    let mut report = RotationReport {
        total: secrets.len(),
        dry_run,
        ..Default::default()
    };

    info!(
        "Rotating {} secrets to key version {}{}",
        secrets.len(),
        new_version,
        if dry_run { " (dry run)" } else { "" }
    );

    for secret in secrets {
        if opens_under(&secret.user_id, &secret.encrypted_value, new_key) {
            if secret.key_version != new_version && !dry_run {
                if let Err(e) = store
                    .update_secret_blob(secret.id, &secret.encrypted_value, new_version)
                    .await
                {
                    warn!(secret_id = %secret.id, "Failed to update key version: {:#}", e);
                    report.failed.push((secret.id, format!("{:#}", e)));
                    continue;
                }
            }
            report.skipped += 1;
            continue;
        }

        let rewrapped = rewrap_secret(&secret.user_id, &secret.encrypted_value, old_key, new_key)
            .and_then(|blob| {
                // The plaintext is dropped immediately and wiped
                let _verified =
                    Zeroizing::new(decrypt_secret(&secret.user_id, &blob, new_key)?);
                Ok::<_, VaultError>(blob)
            });

        let blob = match rewrapped {
            Ok(blob) => blob,
            Err(e) => {
                warn!(secret_id = %secret.id, "Failed to re-wrap secret '{}': {}", secret.name, e);
                report.failed.push((secret.id, e.to_string()));
                continue;
            }
        };

        if !dry_run {
            if let Err(e) = store.update_secret_blob(secret.id, &blob, new_version).await {
                warn!(secret_id = %secret.id, "Failed to store re-wrapped secret: {:#}", e);
                report.failed.push((secret.id, format!("{:#}", e)));
                continue;
            }
        }

        report.rewrapped += 1;
    }

    info!(
        "Rotation finished: {} re-wrapped, {} skipped, {} failed",
        report.rewrapped,
        report.skipped,
        report.failed.len()
    );

    Ok(report)
}

fn opens_under(user_id: &str, blob: &[u8], key: &[u8]) -> bool {
    decrypt_secret(user_id, blob, key)
        .map(Zeroizing::new)
        .is_ok()
}
