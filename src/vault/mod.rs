//! Secret vault - envelope encryption for user provider keys
//!
//! Every secret gets its own random data encryption key (DEK). The DEK is
//! sealed under a per-user key derived from the master key, and the secret
//! is sealed under the DEK. Rotating the master key only re-wraps the DEK
//! envelope; the secret ciphertext is never touched.
//!
//! Blob layout:
//!
//! ```text
//! [version:1][dekNonce:12][encryptedDEK:32][dekTag:16][secretNonce:12][ciphertext:N][secretTag:16]
//! ```

pub mod kms;
pub mod redact;
pub mod rotation;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

pub use kms::{KeyProvider, KmsError, KmsSettings};
pub use redact::{redact_secrets, RedactionSet, REDACTED};
pub use rotation::{rotate_all_secrets, RotationReport};

/// Length of master keys, user keys and DEKs
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// Current blob format version
pub const BLOB_VERSION: u8 = 1;

const DEK_NONCE_OFFSET: usize = 1;
const DEK_ENVELOPE_OFFSET: usize = DEK_NONCE_OFFSET + NONCE_LEN;
const DEK_ENVELOPE_LEN: usize = KEY_LEN + TAG_LEN;
const SECRET_NONCE_OFFSET: usize = DEK_ENVELOPE_OFFSET + DEK_ENVELOPE_LEN;
const SECRET_OFFSET: usize = SECRET_NONCE_OFFSET + NONCE_LEN;

/// Smallest blob that can hold a one-byte secret
pub const MIN_BLOB_LEN: usize = SECRET_OFFSET + 1 + TAG_LEN;

const USER_KEY_INFO_PREFIX: &str = "stepiq:user-key:";

/// Key material that is wiped when dropped
pub type SecretKey = Zeroizing<[u8; KEY_LEN]>;

/// Errors raised by vault operations
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("master key must be exactly 32 bytes")]
    InvalidMasterKey,

    #[error("cannot encrypt an empty secret")]
    EmptyPlaintext,

    #[error("encrypted secret is malformed ({0} bytes)")]
    MalformedBlob(usize),

    #[error("unsupported secret format version {0}")]
    UnsupportedVersion(u8),

    /// AEAD authentication failed: tampered blob, wrong user or wrong key
    #[error("secret failed integrity check")]
    Integrity,

    #[error("decrypted secret is not valid UTF-8")]
    InvalidUtf8,
}

/// Derive the per-user key encryption key.
///
/// HKDF-SHA256 over the master key with no salt and
/// `info = "stepiq:user-key:" + user_id`. Deterministic, never persisted.
pub fn derive_user_key(master_key: &[u8], user_id: &str) -> Result<SecretKey, VaultError> {
    if master_key.len() != KEY_LEN {
        return Err(VaultError::InvalidMasterKey);
    }

    let hkdf = Hkdf::<Sha256>::new(None, master_key);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    let info = format!("{}{}", USER_KEY_INFO_PREFIX, user_id);
    hkdf.expand(info.as_bytes(), okm.as_mut_slice())
        .map_err(|_| VaultError::InvalidMasterKey)?;

    Ok(okm)
}

/// Encrypt a secret for a user under the given master key
pub fn encrypt_secret(user_id: &str, plaintext: &str, master_key: &[u8]) -> Result<Vec<u8>, VaultError> {
    if plaintext.is_empty() {
        return Err(VaultError::EmptyPlaintext);
    }
    let user_key = derive_user_key(master_key, user_id)?;

    let mut dek = Zeroizing::new([0u8; KEY_LEN]);
    rand::rng().fill_bytes(dek.as_mut_slice());

    let dek_nonce = random_nonce();
    let dek_envelope = seal(&user_key, &dek_nonce, dek.as_slice())?;

    let secret_nonce = random_nonce();
    let secret_sealed = seal(&dek, &secret_nonce, plaintext.as_bytes())?;

    let mut blob = Vec::with_capacity(SECRET_OFFSET + secret_sealed.len());
    blob.push(BLOB_VERSION);
    blob.extend_from_slice(&dek_nonce);
    blob.extend_from_slice(&dek_envelope);
    blob.extend_from_slice(&secret_nonce);
    blob.extend_from_slice(&secret_sealed);

    Ok(blob)
}

/// Decrypt a secret blob. Any tampering or key mismatch fails closed.
pub fn decrypt_secret(user_id: &str, blob: &[u8], master_key: &[u8]) -> Result<String, VaultError> {
    let parts = BlobParts::parse(blob)?;
    let user_key = derive_user_key(master_key, user_id)?;

    let dek = open_dek(&user_key, &parts)?;
    let plaintext = Zeroizing::new(open(&dek, parts.secret_nonce, parts.secret_sealed)?);

    String::from_utf8(plaintext.to_vec()).map_err(|e| {
        let mut bytes = e.into_bytes();
        bytes.zeroize();
        VaultError::InvalidUtf8
    })
}

/// Re-wrap a secret's DEK under a new master key.
///
/// Only the DEK envelope changes; the secret nonce, ciphertext and tag are
/// copied byte-for-byte.
pub fn rewrap_secret(
    user_id: &str,
    blob: &[u8],
    old_master_key: &[u8],
    new_master_key: &[u8],
) -> Result<Vec<u8>, VaultError> {
    let parts = BlobParts::parse(blob)?;
    let old_user_key = derive_user_key(old_master_key, user_id)?;
    let new_user_key = derive_user_key(new_master_key, user_id)?;

    let dek = open_dek(&old_user_key, &parts)?;
    let dek_nonce = random_nonce();
    let dek_envelope = seal(&new_user_key, &dek_nonce, dek.as_slice())?;

    let mut rewrapped = Vec::with_capacity(blob.len());
    rewrapped.push(BLOB_VERSION);
    rewrapped.extend_from_slice(&dek_nonce);
    rewrapped.extend_from_slice(&dek_envelope);
    rewrapped.extend_from_slice(&blob[SECRET_NONCE_OFFSET..]);

    Ok(rewrapped)
}

/// Borrowed view over the regions of a blob
struct BlobParts<'a> {
    dek_nonce: &'a [u8],
    dek_envelope: &'a [u8],
    secret_nonce: &'a [u8],
    secret_sealed: &'a [u8],
}

impl<'a> BlobParts<'a> {
    fn parse(blob: &'a [u8]) -> Result<Self, VaultError> {
        if blob.len() < MIN_BLOB_LEN {
            return Err(VaultError::MalformedBlob(blob.len()));
        }
        if blob[0] != BLOB_VERSION {
            return Err(VaultError::UnsupportedVersion(blob[0]));
        }

        Ok(Self {
            dek_nonce: &blob[DEK_NONCE_OFFSET..DEK_ENVELOPE_OFFSET],
            dek_envelope: &blob[DEK_ENVELOPE_OFFSET..SECRET_NONCE_OFFSET],
            secret_nonce: &blob[SECRET_NONCE_OFFSET..SECRET_OFFSET],
            secret_sealed: &blob[SECRET_OFFSET..],
        })
    }
}

fn open_dek(user_key: &[u8; KEY_LEN], parts: &BlobParts<'_>) -> Result<SecretKey, VaultError> {
    let opened = Zeroizing::new(open(user_key, parts.dek_nonce, parts.dek_envelope)?);
    if opened.len() != KEY_LEN {
        return Err(VaultError::Integrity);
    }

    let mut dek = Zeroizing::new([0u8; KEY_LEN]);
    dek.copy_from_slice(&opened);
    Ok(dek)
}

fn seal(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| VaultError::InvalidMasterKey)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| VaultError::Integrity)
}

fn open(key: &[u8; KEY_LEN], nonce: &[u8], sealed: &[u8]) -> Result<Vec<u8>, VaultError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| VaultError::InvalidMasterKey)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| VaultError::Integrity)
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}
