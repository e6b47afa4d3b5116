//! Tenant-bound payload encryption
//!
//! AES-256-GCM encrypt/decrypt over keys managed by the [`KeyVault`].
//! The tenant id is fed in as associated authenticated data, so ciphertext
//! copied across tenants fails authentication instead of decrypting.
//! Every call draws a fresh random 96-bit nonce.

use crate::error::{Result, SecurityError};
use crate::keyvault::KeyVault;
use aes_gcm::aead::{Aead, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// AES-GCM authentication tag length in bytes
const TAG_LEN: usize = 16;

/// AES-GCM nonce length in bytes (96-bit)
const NONCE_LEN: usize = 12;

/// Encrypted envelope persisted in place of a sensitive field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedRecord {
    /// Identifies which tenant key produced this ciphertext
    pub key_id: String,

    /// Base64-encoded nonce (96-bit)
    pub iv: String,

    /// Base64-encoded ciphertext (tag stripped)
    pub ciphertext: String,

    /// Base64-encoded authentication tag
    pub tag: String,

    /// Marker to identify encrypted envelopes
    #[serde(default = "default_encrypted")]
    pub encrypted: bool,
}

fn default_encrypted() -> bool {
    true
}

impl EncryptedRecord {
    /// Check if a JSON value is an encrypted envelope
    pub fn is_encrypted(value: &serde_json::Value) -> bool {
        value
            .get("encrypted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Tenant-scoped AEAD cipher over the key vault
///
/// Encrypts with the tenant's active key; decrypts with whichever key the
/// envelope's `key_id` names, including rotated keys.
pub struct TenantCipher {
    vault: Arc<KeyVault>,
}

impl TenantCipher {
    /// Create a cipher over a shared vault
    pub fn new(vault: Arc<KeyVault>) -> Self {
        Self { vault }
    }

    /// Encrypt raw bytes under the tenant's active key
    pub async fn encrypt(&self, plaintext: &[u8], tenant_id: &str) -> Result<EncryptedRecord> {
        let key = self.vault.get_active_key(tenant_id).await?;
        let cipher = Aes256Gcm::new(key.key_bytes().into());

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: tenant_id.as_bytes(),
                },
            )
            .map_err(|e| SecurityError::Integrity(format!("encryption failed: {}", e)))?;

        // aes-gcm appends the tag; split it out for the envelope shape
        let (ct, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(EncryptedRecord {
            key_id: key.key_id,
            iv: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ct),
            tag: BASE64.encode(tag),
            encrypted: true,
        })
    }

    /// Decrypt an envelope for the given tenant
    ///
    /// Fails with [`SecurityError::Integrity`] on tag mismatch, wrong tenant,
    /// or unknown key id. The failure is fatal for the record — no partial
    /// plaintext is ever returned.
    pub async fn decrypt(&self, record: &EncryptedRecord, tenant_id: &str) -> Result<Vec<u8>> {
        let key = self
            .vault
            .get_key(tenant_id, &record.key_id)
            .await
            .map_err(|_| {
                SecurityError::Integrity(format!(
                    "no resolvable key '{}' for tenant",
                    record.key_id
                ))
            })?;
        let cipher = Aes256Gcm::new(key.key_bytes().into());

        let nonce_bytes = BASE64
            .decode(&record.iv)
            .map_err(|e| SecurityError::Integrity(format!("invalid iv encoding: {}", e)))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(SecurityError::Integrity(format!(
                "invalid iv length: {} bytes",
                nonce_bytes.len()
            )));
        }
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut sealed = BASE64
            .decode(&record.ciphertext)
            .map_err(|e| SecurityError::Integrity(format!("invalid ciphertext encoding: {}", e)))?;
        let tag = BASE64
            .decode(&record.tag)
            .map_err(|e| SecurityError::Integrity(format!("invalid tag encoding: {}", e)))?;
        sealed.extend_from_slice(&tag);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed,
                    aad: tenant_id.as_bytes(),
                },
            )
            .map_err(|_| {
                SecurityError::Integrity("authentication failed for encrypted record".into())
            })
    }

    /// Encrypt a JSON value under the tenant's active key
    pub async fn encrypt_json(
        &self,
        value: &serde_json::Value,
        tenant_id: &str,
    ) -> Result<EncryptedRecord> {
        let plaintext = serde_json::to_vec(value)?;
        self.encrypt(&plaintext, tenant_id).await
    }

    /// Decrypt an envelope back to a JSON value
    pub async fn decrypt_json(
        &self,
        record: &EncryptedRecord,
        tenant_id: &str,
    ) -> Result<serde_json::Value> {
        let plaintext = self.decrypt(record, tenant_id).await?;
        serde_json::from_slice(&plaintext).map_err(Into::into)
    }

    /// Deterministic tenant-salted hash for equality search over encrypted fields
    ///
    /// Same (value, tenant) always hashes identically; different tenants
    /// produce unrelated hashes for the same value.
    pub fn searchable_hash(&self, value: &str, tenant_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tenant_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
