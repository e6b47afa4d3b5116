//! Persistence boundary for the security core
//!
//! `SecurityStore` abstracts the relational store the platform provides.
//! The core only needs a few query shapes: events for a tenant since a
//! point in time, open threats, active alerts, and backup metadata by
//! id/tenant. `MemoryStore` implements the trait over tokio locks for
//! tests and single-process use.

use crate::alert::{Alert, AlertStatus};
use crate::backup::BackupMetadata;
use crate::error::{Result, SecurityError};
use crate::types::{AuditEvent, SecurityThreat, ThreatSeverity, ThreatStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Storage abstraction for audit events, threats, alerts, and backup metadata
#[async_trait]
pub trait SecurityStore: Send + Sync {
    /// Persist an audit event (append-only)
    async fn insert_event(&self, event: &AuditEvent) -> Result<()>;

    /// Fetch a tenant's events with `timestamp >= since`, oldest first
    async fn events_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuditEvent>>;

    /// Delete events older than the cutoff, returning the number removed
    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// All tenant ids that have recorded events
    async fn tenants(&self) -> Result<Vec<String>>;

    /// Persist a detected threat
    async fn insert_threat(&self, threat: &SecurityThreat) -> Result<()>;

    /// Fetch a tenant's open threats (not resolved or dismissed)
    async fn open_threats(&self, tenant_id: &str) -> Result<Vec<SecurityThreat>>;

    /// Update a threat's lifecycle status
    async fn update_threat_status(
        &self,
        id: &str,
        status: ThreatStatus,
        resolved_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Update a threat's assessed severity
    async fn update_threat_severity(&self, id: &str, severity: ThreatSeverity) -> Result<()>;

    /// Delete resolved/dismissed threats older than the cutoff
    async fn delete_resolved_threats_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Persist a triggered alert
    async fn insert_alert(&self, alert: &Alert) -> Result<()>;

    /// Fetch all currently active alerts
    async fn active_alerts(&self) -> Result<Vec<Alert>>;

    /// Transition an alert to resolved
    async fn resolve_alert(&self, id: &str, resolved_at: DateTime<Utc>) -> Result<()>;

    /// Insert or update backup metadata by id
    async fn upsert_backup(&self, meta: &BackupMetadata) -> Result<()>;

    /// Fetch backup metadata by id
    async fn get_backup(&self, id: &str) -> Result<Option<BackupMetadata>>;

    /// List backup metadata, optionally restricted to one tenant, newest first
    async fn list_backups(&self, tenant_id: Option<&str>) -> Result<Vec<BackupMetadata>>;

    /// Delete backup metadata by id
    async fn delete_backup(&self, id: &str) -> Result<()>;
}

/// In-memory store for testing and single-process use
///
/// Thread-safe via tokio locks. Events and threats are kept in insertion
/// order; backup metadata is keyed by id.
#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<Vec<AuditEvent>>,
    threats: RwLock<Vec<SecurityThreat>>,
    alerts: RwLock<Vec<Alert>>,
    backups: RwLock<HashMap<String, BackupMetadata>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecurityStore for MemoryStore {
    async fn insert_event(&self, event: &AuditEvent) -> Result<()> {
        let mut events = self.events.write().await;
        events.push(event.clone());
        Ok(())
    }

    async fn events_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuditEvent>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff);
        Ok((before - events.len()) as u64)
    }

    async fn tenants(&self) -> Result<Vec<String>> {
        let events = self.events.read().await;
        let mut tenants: Vec<String> = events.iter().map(|e| e.tenant_id.clone()).collect();
        tenants.sort();
        tenants.dedup();
        Ok(tenants)
    }

    async fn insert_threat(&self, threat: &SecurityThreat) -> Result<()> {
        let mut threats = self.threats.write().await;
        threats.push(threat.clone());
        Ok(())
    }

    async fn open_threats(&self, tenant_id: &str) -> Result<Vec<SecurityThreat>> {
        let threats = self.threats.read().await;
        Ok(threats
            .iter()
            .filter(|t| t.tenant_id == tenant_id && t.is_open())
            .cloned()
            .collect())
    }

    async fn update_threat_status(
        &self,
        id: &str,
        status: ThreatStatus,
        resolved_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut threats = self.threats.write().await;
        let threat = threats
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| SecurityError::NotFound(format!("threat {}", id)))?;
        threat.status = status;
        threat.resolved_at = resolved_at;
        Ok(())
    }

    async fn update_threat_severity(&self, id: &str, severity: ThreatSeverity) -> Result<()> {
        let mut threats = self.threats.write().await;
        let threat = threats
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| SecurityError::NotFound(format!("threat {}", id)))?;
        threat.severity = severity;
        Ok(())
    }

    async fn delete_resolved_threats_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut threats = self.threats.write().await;
        let before = threats.len();
        threats.retain(|t| {
            t.is_open() || t.resolved_at.map(|r| r >= cutoff).unwrap_or(true)
        });
        Ok((before - threats.len()) as u64)
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        let mut alerts = self.alerts.write().await;
        alerts.push(alert.clone());
        Ok(())
    }

    async fn active_alerts(&self) -> Result<Vec<Alert>> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .iter()
            .filter(|a| a.status == AlertStatus::Active)
            .cloned()
            .collect())
    }

    async fn resolve_alert(&self, id: &str, resolved_at: DateTime<Utc>) -> Result<()> {
        let mut alerts = self.alerts.write().await;
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| SecurityError::NotFound(format!("alert {}", id)))?;
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(resolved_at);
        Ok(())
    }

    async fn upsert_backup(&self, meta: &BackupMetadata) -> Result<()> {
        let mut backups = self.backups.write().await;
        backups.insert(meta.id.clone(), meta.clone());
        Ok(())
    }

    async fn get_backup(&self, id: &str) -> Result<Option<BackupMetadata>> {
        let backups = self.backups.read().await;
        Ok(backups.get(id).cloned())
    }

    async fn list_backups(&self, tenant_id: Option<&str>) -> Result<Vec<BackupMetadata>> {
        let backups = self.backups.read().await;
        let mut list: Vec<BackupMetadata> = backups
            .values()
            .filter(|b| match tenant_id {
                Some(t) => b.tenant_id.as_deref() == Some(t),
                None => true,
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn delete_backup(&self, id: &str) -> Result<()> {
        let mut backups = self.backups.write().await;
        backups.remove(id);
        Ok(())
    }
}
