//! # aegis-core
//!
//! Security, audit, and resilience services for multi-tenant platforms.
//!
//! ## Overview
//!
//! `aegis-core` bundles the security plumbing a multi-tenant backend needs:
//! per-tenant encryption keys with rotation, AEAD field encryption bound to
//! the owning tenant, an audit log with sliding-window threat detection,
//! metric-driven alerting with health checks, and encrypted backup/restore.
//!
//! ## Quick Start
//!
//! ```rust
//! use aegis_core::{AuditLog, AuditEvent, MemoryStore, KeyVault, TenantCipher};
//! use std::sync::Arc;
//!
//! # async fn example() -> aegis_core::Result<()> {
//! // Encrypt a field under a tenant's active key
//! let cipher = TenantCipher::new(Arc::new(KeyVault::new()));
//! let record = cipher.encrypt(b"client secret", "tenant-1").await?;
//! let plaintext = cipher.decrypt(&record, "tenant-1").await?;
//!
//! // Record an audit event; threat analysis runs in the background
//! let audit = Arc::new(AuditLog::new(Arc::new(MemoryStore::new())));
//! let event_id = audit
//!     .log_event(AuditEvent::new("tenant-1", "user-1", "login", "session"))
//!     .await;
//!
//! println!("Logged: {}", event_id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Components
//!
//! - **KeyVault** — per-tenant AES-256 key generation and rotation
//! - **TenantCipher** — AEAD envelopes with tenant binding and searchable hashes
//! - **AuditLog** — event pipeline, threat rules, metrics, retention
//! - **AlertEngine** — alert rules with cooldowns, notifications, system health
//! - **BackupManager** — full/incremental encrypted backups and best-effort restore
//! - **Scheduler** — periodic background tasks with clean shutdown

pub mod alert;
pub mod audit;
pub mod backup;
pub mod cipher;
pub mod error;
pub mod keyvault;
pub mod rules;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export core types
pub use alert::{
    Alert, AlertEngine, AlertEngineConfig, AlertRule, AlertStatus, ComponentHealth, HealthCheck,
    HealthStatus, Notifier, SystemHealth, SystemMetrics, TracingNotifier,
};
pub use audit::{AuditConfig, AuditLog};
pub use backup::{
    BackupConfig, BackupManager, BackupMetadata, BackupStatus, BackupType, BlobStore,
    FileBlobStore, MemoryBlobStore, MemoryTableSource, RestoreOptions, RestoreResult, TableRow,
    TableSource,
};
pub use cipher::{EncryptedRecord, TenantCipher};
pub use error::{Result, SecurityError};
pub use keyvault::{KeyVault, KeyVaultConfig, TenantKey};
pub use rules::{default_rules, ThreatRule};
pub use scheduler::Scheduler;
pub use store::{MemoryStore, SecurityStore};
pub use types::{AuditEvent, SecurityThreat, ThreatSeverity, ThreatStatus};
