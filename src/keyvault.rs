//! Tenant-scoped key management
//!
//! One active AES-256 key per tenant, with rotation that retains inactive
//! keys so historical ciphertext referencing their key ids stays
//! decryptable. Key material lives in process memory only — a production
//! deployment puts this behind an external key-management boundary.

use crate::error::{Result, SecurityError};
use aes_gcm::aead::OsRng;
use aes_gcm::{Aes256Gcm, KeyInit};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// A symmetric key bound to one tenant
#[derive(Clone)]
pub struct TenantKey {
    /// Owning tenant
    pub tenant_id: String,

    /// Unique key identifier (key-<uuid>), referenced by ciphertext envelopes
    pub key_id: String,

    /// Raw 256-bit key material (in-process only)
    key: [u8; 32],

    /// When the key was generated
    pub created_at: DateTime<Utc>,

    /// When the key was deactivated by rotation, if it has been
    pub rotated_at: Option<DateTime<Utc>>,

    /// Whether this is the tenant's current encryption key
    pub active: bool,
}

impl TenantKey {
    fn generate(tenant_id: &str) -> Self {
        let key: [u8; 32] = Aes256Gcm::generate_key(&mut OsRng).into();
        Self {
            tenant_id: tenant_id.to_string(),
            key_id: format!("key-{}", uuid::Uuid::new_v4()),
            key,
            created_at: Utc::now(),
            rotated_at: None,
            active: true,
        }
    }

    /// Raw key bytes, for cipher construction
    pub(crate) fn key_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Age of the key since generation
    pub fn age(&self) -> Duration {
        Utc::now() - self.created_at
    }
}

impl std::fmt::Debug for TenantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantKey")
            .field("tenant_id", &self.tenant_id)
            .field("key_id", &self.key_id)
            .field("key", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("rotated_at", &self.rotated_at)
            .field("active", &self.active)
            .finish()
    }
}

/// KeyVault configuration
#[derive(Debug, Clone)]
pub struct KeyVaultConfig {
    /// Active-key age beyond which rotation is recommended
    pub rotation_interval_days: i64,
}

impl Default for KeyVaultConfig {
    fn default() -> Self {
        Self {
            rotation_interval_days: 90,
        }
    }
}

/// Per-tenant key vault with serialized generate/rotate
///
/// Mutations for a given tenant run under a per-tenant mutex so two
/// concurrent `generate`/`rotate` calls cannot both succeed and leave
/// two active keys.
pub struct KeyVault {
    config: KeyVaultConfig,

    /// Full key history per tenant, newest last
    keys: RwLock<HashMap<String, Vec<TenantKey>>>,

    /// Per-tenant writer guards
    guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyVault {
    /// Create a vault with the default 90-day rotation interval
    pub fn new() -> Self {
        Self::with_config(KeyVaultConfig::default())
    }

    /// Create a vault with explicit configuration
    pub fn with_config(config: KeyVaultConfig) -> Self {
        Self {
            config,
            keys: RwLock::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
        }
    }

    async fn tenant_guard(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        let mut guards = self.guards.lock().await;
        guards
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Generate and activate a fresh key for the tenant
    ///
    /// Any previously active key is deactivated first.
    pub async fn generate_key(&self, tenant_id: &str) -> Result<TenantKey> {
        if tenant_id.is_empty() {
            return Err(SecurityError::Validation("tenant id is empty".into()));
        }

        let guard = self.tenant_guard(tenant_id).await;
        let _held = guard.lock().await;

        let key = TenantKey::generate(tenant_id);
        let mut keys = self.keys.write().await;
        let history = keys.entry(tenant_id.to_string()).or_default();
        let now = Utc::now();
        for old in history.iter_mut().filter(|k| k.active) {
            old.active = false;
            old.rotated_at = Some(now);
        }
        history.push(key.clone());

        tracing::info!(tenant = %tenant_id, key_id = %key.key_id, "Generated tenant key");
        Ok(key)
    }

    /// Get the tenant's active key, generating one on first use
    pub async fn get_active_key(&self, tenant_id: &str) -> Result<TenantKey> {
        {
            let keys = self.keys.read().await;
            if let Some(key) = keys
                .get(tenant_id)
                .and_then(|h| h.iter().find(|k| k.active))
            {
                return Ok(key.clone());
            }
        }
        // Bootstrap: no key yet for this tenant
        self.generate_key(tenant_id).await
    }

    /// Resolve a key by id, active or rotated
    pub async fn get_key(&self, tenant_id: &str, key_id: &str) -> Result<TenantKey> {
        let keys = self.keys.read().await;
        keys.get(tenant_id)
            .and_then(|h| h.iter().find(|k| k.key_id == key_id))
            .cloned()
            .ok_or_else(|| SecurityError::KeyNotFound {
                tenant_id: tenant_id.to_string(),
                key_id: key_id.to_string(),
            })
    }

    /// Deactivate the current key and activate a fresh one
    ///
    /// Fails with `KeyNotFound` when the tenant has no key history —
    /// callers should `generate_key` instead.
    pub async fn rotate_key(&self, tenant_id: &str) -> Result<TenantKey> {
        let guard = self.tenant_guard(tenant_id).await;
        let _held = guard.lock().await;

        let mut keys = self.keys.write().await;
        let history = keys
            .get_mut(tenant_id)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| SecurityError::KeyNotFound {
                tenant_id: tenant_id.to_string(),
                key_id: "<active>".to_string(),
            })?;

        let now = Utc::now();
        let old_id = history
            .iter_mut()
            .filter(|k| k.active)
            .map(|k| {
                k.active = false;
                k.rotated_at = Some(now);
                k.key_id.clone()
            })
            .last();

        let key = TenantKey::generate(tenant_id);
        history.push(key.clone());

        tracing::info!(
            tenant = %tenant_id,
            old_key = ?old_id,
            new_key = %key.key_id,
            "Rotated tenant key"
        );
        Ok(key)
    }

    /// Whether the tenant's active key is past the rotation interval
    ///
    /// Also true when the tenant has no key at all.
    pub async fn is_rotation_needed(&self, tenant_id: &str) -> bool {
        let keys = self.keys.read().await;
        match keys
            .get(tenant_id)
            .and_then(|h| h.iter().find(|k| k.active))
        {
            Some(key) => key.age() > Duration::days(self.config.rotation_interval_days),
            None => true,
        }
    }

    /// Number of keys (active + rotated) held for a tenant
    pub async fn key_count(&self, tenant_id: &str) -> usize {
        let keys = self.keys.read().await;
        keys.get(tenant_id).map(|h| h.len()).unwrap_or(0)
    }
}

impl Default for KeyVault {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_key() {
        let vault = KeyVault::new();
        let key = vault.generate_key("t1").await.unwrap();

        assert!(key.key_id.starts_with("key-"));
        assert!(key.active);
        assert!(key.rotated_at.is_none());
        assert_eq!(key.tenant_id, "t1");
    }

    #[tokio::test]
    async fn test_generate_rejects_empty_tenant() {
        let vault = KeyVault::new();
        assert!(matches!(
            vault.generate_key("").await,
            Err(SecurityError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_get_active_key_bootstraps() {
        let vault = KeyVault::new();
        let key = vault.get_active_key("t1").await.unwrap();
        let again = vault.get_active_key("t1").await.unwrap();

        // Idempotent: second call returns the same key
        assert_eq!(key.key_id, again.key_id);
        assert_eq!(vault.key_count("t1").await, 1);
    }

    #[tokio::test]
    async fn test_rotate_changes_active_key() {
        let vault = KeyVault::new();
        let first = vault.generate_key("t1").await.unwrap();
        let second = vault.rotate_key("t1").await.unwrap();

        assert_ne!(first.key_id, second.key_id);
        assert_eq!(vault.get_active_key("t1").await.unwrap().key_id, second.key_id);

        // Old key retained and resolvable, but inactive
        let old = vault.get_key("t1", &first.key_id).await.unwrap();
        assert!(!old.active);
        assert!(old.rotated_at.is_some());
        assert_eq!(vault.key_count("t1").await, 2);
    }

    #[tokio::test]
    async fn test_rotate_without_history_fails() {
        let vault = KeyVault::new();
        assert!(matches!(
            vault.rotate_key("t1").await,
            Err(SecurityError::KeyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_key_unknown_id_fails() {
        let vault = KeyVault::new();
        vault.generate_key("t1").await.unwrap();
        assert!(matches!(
            vault.get_key("t1", "key-nope").await,
            Err(SecurityError::KeyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_keys_are_tenant_isolated() {
        let vault = KeyVault::new();
        let k1 = vault.generate_key("t1").await.unwrap();
        vault.generate_key("t2").await.unwrap();

        assert!(matches!(
            vault.get_key("t2", &k1.key_id).await,
            Err(SecurityError::KeyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_rotation_needed_when_no_key() {
        let vault = KeyVault::new();
        assert!(vault.is_rotation_needed("t1").await);

        vault.generate_key("t1").await.unwrap();
        assert!(!vault.is_rotation_needed("t1").await);
    }

    #[tokio::test]
    async fn test_rotation_needed_for_old_key() {
        let vault = KeyVault::with_config(KeyVaultConfig {
            rotation_interval_days: 0,
        });
        vault.generate_key("t1").await.unwrap();
        // Interval of zero days: any key is immediately due
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(vault.is_rotation_needed("t1").await);
    }

    #[tokio::test]
    async fn test_single_active_key_under_concurrency() {
        let vault = Arc::new(KeyVault::new());
        vault.generate_key("t1").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let vault = vault.clone();
            handles.push(tokio::spawn(async move {
                vault.rotate_key("t1").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let keys = vault.keys.read().await;
        let active = keys["t1"].iter().filter(|k| k.active).count();
        assert_eq!(active, 1);
        assert_eq!(keys["t1"].len(), 9);
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let key = TenantKey::generate("t1");
        let debug = format!("{:?}", key);
        assert!(debug.contains("<redacted>"));
    }
}
