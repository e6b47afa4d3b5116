//! Audit event pipeline with stateful threat detection
//!
//! `AuditLog` persists structured security events and runs the registered
//! threat rules over a recent window. Audit-write failures are caught,
//! logged, and swallowed — they must never surface into the caller's
//! primary business operation.

use crate::alert::SystemMetrics;
use crate::error::Result;
use crate::rules::{default_rules, ThreatRule};
use crate::store::SecurityStore;
use crate::types::{AuditEvent, SecurityThreat, ThreatSeverity};
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;

/// AuditLog configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Audit rows older than this are removed by `cleanup_old_logs`
    pub retention_days: i64,

    /// Window the scheduled intrusion sweep looks back over
    pub detection_window_minutes: i64,

    /// Window the synchronous login-failure fast path looks back over
    pub fast_path_window_minutes: i64,

    /// Failed logins within the fast-path window that raise a threat
    pub fast_path_login_threshold: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: 365,
            detection_window_minutes: 60,
            fast_path_window_minutes: 15,
            fast_path_login_threshold: 5,
        }
    }
}

/// Security audit log with pluggable threat detection
pub struct AuditLog {
    store: Arc<dyn SecurityStore>,
    rules: RwLock<Vec<Box<dyn ThreatRule>>>,
    config: AuditConfig,
}

impl AuditLog {
    /// Create an audit log with the default rule set and configuration
    pub fn new(store: Arc<dyn SecurityStore>) -> Self {
        Self::with_config(store, AuditConfig::default())
    }

    /// Create an audit log with explicit configuration
    pub fn with_config(store: Arc<dyn SecurityStore>, config: AuditConfig) -> Self {
        Self {
            store,
            rules: RwLock::new(default_rules()),
            config,
        }
    }

    /// Append a rule to the registry (evaluated after existing rules)
    pub async fn register_rule(&self, rule: Box<dyn ThreatRule>) {
        let mut rules = self.rules.write().await;
        tracing::info!(rule = %rule.name(), "Threat rule registered");
        rules.push(rule);
    }

    /// Replace the entire rule registry
    pub async fn set_rules(&self, new_rules: Vec<Box<dyn ThreatRule>>) {
        let mut rules = self.rules.write().await;
        *rules = new_rules;
    }

    /// Record an audit event, returning its id
    ///
    /// The write is best-effort: a store failure is logged and swallowed so
    /// the caller's primary operation is never disturbed. Threat analysis
    /// for the event runs asynchronously.
    pub async fn log_event(self: &Arc<Self>, event: AuditEvent) -> String {
        let event_id = event.id.clone();

        if let Err(e) = self.store.insert_event(&event).await {
            tracing::warn!(
                event_id = %event_id,
                tenant = %event.tenant_id,
                error = %e,
                "Audit write failed; event dropped"
            );
            return event_id;
        }

        let log = Arc::clone(self);
        tokio::spawn(async move {
            log.analyze_for_threats(&event).await;
        });

        event_id
    }

    /// Fast-path analysis for a single just-logged event
    ///
    /// Checks for repeated login failures in a short window so a
    /// brute-force threat is raised without waiting for the next scheduled
    /// sweep. Failures are logged and swallowed.
    pub async fn analyze_for_threats(&self, event: &AuditEvent) {
        if event.action_type != "login" || event.success {
            return;
        }

        let since = Utc::now() - Duration::minutes(self.config.fast_path_window_minutes);
        let recent = match self.store.events_since(&event.tenant_id, since).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(tenant = %event.tenant_id, error = %e, "Threat fast path skipped");
                return;
            }
        };

        let failures = recent
            .iter()
            .filter(|e| {
                e.action_type == "login"
                    && !e.success
                    && e.user_id == event.user_id
                    && e.ip_address == event.ip_address
            })
            .count();

        if failures < self.config.fast_path_login_threshold {
            return;
        }

        let threat = SecurityThreat::detected(
            &event.tenant_id,
            "brute_force_login",
            ThreatSeverity::Medium,
        )
        .with_user(&event.user_id)
        .with_resources(vec!["session".to_string()]);
        let threat = match &event.ip_address {
            Some(ip) => threat.with_ip(ip),
            None => threat,
        };

        if self.open_duplicate(&threat).await.is_some() {
            return;
        }
        if let Err(e) = self.store.insert_threat(&threat).await {
            tracing::warn!(tenant = %event.tenant_id, error = %e, "Threat write failed");
            return;
        }
        tracing::warn!(
            tenant = %event.tenant_id,
            user = %event.user_id,
            failures,
            "Fast-path brute force threat detected"
        );
    }

    /// Run every registered rule over the tenant's recent event window
    ///
    /// Rules are evaluated in isolation: a panicking rule is logged and the
    /// remaining rules still run. Threats duplicating a currently open one
    /// (same type, user, ip) are suppressed. Newly detected threats are
    /// persisted and returned.
    pub async fn detect_intrusions(&self, tenant_id: &str) -> Result<Vec<SecurityThreat>> {
        let since = Utc::now() - Duration::minutes(self.config.detection_window_minutes);
        let window = self.store.events_since(tenant_id, since).await?;
        if window.is_empty() {
            return Ok(Vec::new());
        }

        let mut detected = Vec::new();
        {
            let rules = self.rules.read().await;
            for rule in rules.iter() {
                match std::panic::catch_unwind(AssertUnwindSafe(|| rule.evaluate(&window))) {
                    Ok(threats) => detected.extend(threats),
                    Err(_) => {
                        tracing::error!(
                            rule = %rule.name(),
                            tenant = %tenant_id,
                            "Threat rule panicked; continuing with remaining rules"
                        );
                    }
                }
            }
        }

        let mut new_threats = Vec::new();
        for threat in detected {
            if let Some(existing) = self.open_duplicate(&threat).await {
                // An ongoing attack can grow worse between sweeps; raise the
                // open threat's severity instead of dropping the detection
                if threat.severity > existing.severity {
                    self.store
                        .update_threat_severity(&existing.id, threat.severity)
                        .await?;
                    tracing::warn!(
                        tenant = %tenant_id,
                        threat_type = %threat.threat_type,
                        from = ?existing.severity,
                        to = ?threat.severity,
                        "Open threat severity escalated"
                    );
                }
                continue;
            }
            self.store.insert_threat(&threat).await?;
            tracing::warn!(
                tenant = %tenant_id,
                threat_type = %threat.threat_type,
                severity = ?threat.severity,
                user = ?threat.user_id,
                "Security threat detected"
            );
            new_threats.push(threat);
        }

        Ok(new_threats)
    }

    /// Find an already-open threat equivalent to the given one
    async fn open_duplicate(&self, threat: &SecurityThreat) -> Option<SecurityThreat> {
        match self.store.open_threats(&threat.tenant_id).await {
            Ok(open) => open.into_iter().find(|t| {
                t.threat_type == threat.threat_type
                    && t.user_id == threat.user_id
                    && t.ip_address == threat.ip_address
            }),
            Err(e) => {
                tracing::warn!(tenant = %threat.tenant_id, error = %e, "Threat dedup check failed");
                None
            }
        }
    }

    /// Aggregate the tenant's recent events into the alerting metric feed
    pub async fn security_metrics(
        &self,
        tenant_id: &str,
        window: Duration,
    ) -> Result<SystemMetrics> {
        let since = Utc::now() - window;
        let events = self.store.events_since(tenant_id, since).await?;
        let open_threats = self.store.open_threats(tenant_id).await?;

        let total = events.len();
        let failures = events.iter().filter(|e| !e.success).count();
        let users: HashSet<&str> = events.iter().map(|e| e.user_id.as_str()).collect();

        // Response times arrive as per-event metadata from the gateway
        let durations: Vec<f64> = events
            .iter()
            .filter_map(|e| e.metadata.get("durationMs"))
            .filter_map(|v| v.parse::<f64>().ok())
            .collect();
        let avg_response_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        Ok(SystemMetrics {
            error_rate: if total == 0 {
                0.0
            } else {
                failures as f64 / total as f64 * 100.0
            },
            avg_response_ms,
            intrusion_attempts: open_threats.len() as u64,
            active_users: users.len() as u64,
            event_count: total as u64,
        })
    }

    /// Delete audit rows past retention and resolved violations past twice
    /// the retention period
    ///
    /// Returns (events removed, threats removed).
    pub async fn cleanup_old_logs(&self) -> Result<(u64, u64)> {
        let now = Utc::now();
        let event_cutoff = now - Duration::days(self.config.retention_days);
        let threat_cutoff = now - Duration::days(self.config.retention_days * 2);

        let events_removed = self.store.delete_events_before(event_cutoff).await?;
        let threats_removed = self
            .store
            .delete_resolved_threats_before(threat_cutoff)
            .await?;

        if events_removed > 0 || threats_removed > 0 {
            tracing::info!(
                events_removed,
                threats_removed,
                "Audit retention cleanup completed"
            );
        }
        Ok((events_removed, threats_removed))
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn SecurityStore> {
        &self.store
    }
}
