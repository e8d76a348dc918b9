//! Secret resolution for a run

use crate::core::{template, PipelineDefinition, StepKind};
use crate::model::api_key_name;
use crate::persistence::Store;
use crate::vault::{decrypt_secret, KeyProvider, KmsError, VaultError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SecretResolutionError {
    /// The master key could not be obtained. Distinct from a secret the user never configured.
    #[error("Cannot decrypt secrets: {0}")]
    KmsUnavailable(#[from] KmsError),

    #[error("Failed to decrypt secret '{name}': {source}")]
    Decrypt {
        name: String,
        #[source]
        source: VaultError,
    },

    #[error("Failed to load secret '{name}': {message}")]
    Store { name: String, message: String },
}

/// Secret names a definition needs: every `{{env.NAME}}` reference plus the
/// provider API key of every `llm` step's model
pub fn required_secret_names(definition: &PipelineDefinition) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = definition
        .all_templates()
        .into_iter()
        .flat_map(template::referenced_env_names)
        .collect();

    for step in &definition.steps {
        if let StepKind::Llm(llm) = &step.kind {
            if let Some(key_name) = api_key_name(&llm.model) {
                names.insert(key_name.to_string());
            }
        }
    }
    names
}

/// Look up and decrypt the named secrets for a user.
///
/// A pipeline-scoped secret wins over a global one of the same name. Names
/// with no stored secret are left out. The master key is only requested when
/// at least one secret needs decrypting.
pub async fn resolve_secrets(
    store: &dyn Store,
    kms: Option<&Arc<dyn KeyProvider>>,
    user_id: &str,
    pipeline_id: Uuid,
    names: &BTreeSet<String>,
) -> Result<BTreeMap<String, String>, SecretResolutionError> {
    let mut found = Vec::new();
    for name in names {
        let lookup = async {
            match store.find_secret(user_id, Some(pipeline_id), name).await? {
                Some(secret) => Ok::<_, anyhow::Error>(Some(secret)),
                None => store.find_secret(user_id, None, name).await,
            }
        };
        match lookup.await {
            Ok(Some(secret)) => found.push(secret),
            Ok(None) => debug!("No secret named {} configured", name),
            Err(e) => {
                return Err(SecretResolutionError::Store {
                    name: name.clone(),
                    message: format!("{:#}", e),
                })
            }
        }
    }

    let mut resolved = BTreeMap::new();
    if found.is_empty() {
        return Ok(resolved);
    }

    let kms = kms.ok_or(KmsError::NotConfigured)?;
    let master_key = kms.master_key(None).await?;

    for secret in found {
        if secret.key_version != kms.current_version() {
            warn!(
                "Secret {} is stored under key version {}, current is {}",
                secret.name,
                secret.key_version,
                kms.current_version()
            );
        }
        let plaintext = decrypt_secret(user_id, &secret.encrypted_value, master_key.as_slice())
            .map_err(|source| SecretResolutionError::Decrypt {
                name: secret.name.clone(),
                source,
            })?;
        resolved.insert(secret.name, plaintext);
    }

    Ok(resolved)
}
