//! Rule-based alerting and health monitoring
//!
//! `AlertEngine` evaluates alert rules against the metric feed produced by
//! the audit log, applies per-(rule, tenant) cooldown, and dispatches
//! notifications through a pluggable `Notifier`. It also aggregates
//! component health checks into an overall system status.

use crate::cipher::TenantCipher;
use crate::error::Result;
use crate::store::SecurityStore;
use crate::types::ThreatSeverity;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Metrics snapshot the alert conditions evaluate against
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    /// Failed operations as a percentage of all operations in the window
    pub error_rate: f64,

    /// Average request duration reported by the gateway, in milliseconds
    pub avg_response_ms: f64,

    /// Currently open threats for the tenant
    pub intrusion_attempts: u64,

    /// Distinct users active in the window
    pub active_users: u64,

    /// Total events observed in the window
    pub event_count: u64,
}

/// Predicate over a metrics snapshot
///
/// Implemented for any `Fn(&SystemMetrics) -> bool` closure.
pub trait AlertCondition: Send + Sync {
    fn evaluate(&self, metrics: &SystemMetrics) -> bool;
}

impl<F> AlertCondition for F
where
    F: Fn(&SystemMetrics) -> bool + Send + Sync,
{
    fn evaluate(&self, metrics: &SystemMetrics) -> bool {
        self(metrics)
    }
}

/// A configured alert rule
pub struct AlertRule {
    /// Stable rule identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Trigger predicate
    pub condition: Box<dyn AlertCondition>,

    /// Severity assigned to alerts this rule raises
    pub severity: ThreatSeverity,

    /// Minimum minutes between alerts for the same (rule, tenant)
    pub cooldown_minutes: i64,

    /// Disabled rules are skipped at evaluation time
    pub enabled: bool,

    /// Restrict the rule to one tenant; `None` applies it to every tenant
    pub tenant_id: Option<String>,
}

impl AlertRule {
    /// Create an enabled, all-tenant rule
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        severity: ThreatSeverity,
        cooldown_minutes: i64,
        condition: impl AlertCondition + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            condition: Box::new(condition),
            severity,
            cooldown_minutes,
            enabled: true,
            tenant_id: None,
        }
    }

    /// Restrict the rule to a single tenant
    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Disable the rule
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Alert lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Resolved,
    Suppressed,
}

/// An alert raised by a triggered rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Unique alert identifier (alr-<uuid>)
    pub id: String,

    /// Rule that raised the alert
    pub rule_id: String,

    /// Tenant the alert was raised for
    pub tenant_id: String,

    /// Severity inherited from the rule
    pub severity: ThreatSeverity,

    /// When the rule triggered
    pub triggered_at: DateTime<Utc>,

    /// When the alert was resolved, if it has been
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    /// Current lifecycle status
    pub status: AlertStatus,

    /// Rule name and metric context at trigger time
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Dispatch target for raised alerts
///
/// Implementations may page, post to chat, or simply record. A notifier
/// failure is logged and never fails the evaluation tick.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Notifier that logs alerts through tracing
#[derive(Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        tracing::warn!(
            alert_id = %alert.id,
            rule = %alert.rule_id,
            tenant = %alert.tenant_id,
            severity = ?alert.severity,
            "Alert raised"
        );
        Ok(())
    }
}

/// In-memory notifier for testing
#[derive(Default)]
pub struct MemoryNotifier {
    alerts: RwLock<Vec<Alert>>,
}

impl MemoryNotifier {
    /// Number of notifications dispatched
    pub async fn count(&self) -> usize {
        self.alerts.read().await.len()
    }

    /// All dispatched notifications, oldest first
    pub async fn dispatched(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }
}

/// AlertEngine configuration
#[derive(Debug, Clone)]
pub struct AlertEngineConfig {
    /// Error-rate percentage above which the default rule triggers
    pub error_rate_threshold: f64,

    /// Average response time above which the default rule triggers (ms)
    pub response_time_threshold_ms: f64,

    /// Active-user count above which the default rule triggers
    pub active_user_threshold: u64,

    /// Default cooldown applied to the shipped rules
    pub default_cooldown_minutes: i64,
}

impl Default for AlertEngineConfig {
    fn default() -> Self {
        Self {
            error_rate_threshold: 5.0,
            response_time_threshold_ms: 2000.0,
            active_user_threshold: 500,
            default_cooldown_minutes: 15,
        }
    }
}

/// The default rule set shipped with the engine
pub fn default_alert_rules(config: &AlertEngineConfig) -> Vec<AlertRule> {
    let error_rate = config.error_rate_threshold;
    let response_ms = config.response_time_threshold_ms;
    let user_limit = config.active_user_threshold;
    let cooldown = config.default_cooldown_minutes;

    vec![
        AlertRule::new(
            "high-error-rate",
            "Error rate above threshold",
            ThreatSeverity::High,
            cooldown,
            move |m: &SystemMetrics| m.error_rate > error_rate,
        ),
        AlertRule::new(
            "slow-responses",
            "Average response time above threshold",
            ThreatSeverity::Medium,
            cooldown,
            move |m: &SystemMetrics| m.avg_response_ms > response_ms,
        ),
        AlertRule::new(
            "intrusion-attempt",
            "Intrusion attempt detected",
            ThreatSeverity::Critical,
            cooldown,
            |m: &SystemMetrics| m.intrusion_attempts > 0,
        ),
        AlertRule::new(
            "active-user-surge",
            "Active user count above threshold",
            ThreatSeverity::Low,
            cooldown,
            move |m: &SystemMetrics| m.active_users > user_limit,
        ),
    ]
}

/// Rule-based alert engine with per-(rule, tenant) cooldown
pub struct AlertEngine {
    store: Arc<dyn SecurityStore>,
    notifier: Arc<dyn Notifier>,
    rules: RwLock<Vec<AlertRule>>,
    cooldowns: RwLock<HashMap<(String, String), DateTime<Utc>>>,
    health_checks: RwLock<Vec<Box<dyn HealthCheck>>>,
}

impl AlertEngine {
    /// Create an engine with the default rule set and a tracing notifier
    pub fn new(store: Arc<dyn SecurityStore>) -> Self {
        Self::with_notifier(store, Arc::new(TracingNotifier), AlertEngineConfig::default())
    }

    /// Create an engine with an explicit notifier and configuration
    pub fn with_notifier(
        store: Arc<dyn SecurityStore>,
        notifier: Arc<dyn Notifier>,
        config: AlertEngineConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            rules: RwLock::new(default_alert_rules(&config)),
            cooldowns: RwLock::new(HashMap::new()),
            health_checks: RwLock::new(Vec::new()),
        }
    }

    /// Register an alert rule (replaces any rule with the same id)
    pub async fn add_alert_rule(&self, rule: AlertRule) {
        let mut rules = self.rules.write().await;
        rules.retain(|r| r.id != rule.id);
        tracing::info!(rule = %rule.id, "Alert rule registered");
        rules.push(rule);
    }

    /// Remove an alert rule by id, returning whether it existed
    pub async fn remove_alert_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() != before
    }

    /// Replace the entire rule registry
    pub async fn set_rules(&self, new_rules: Vec<AlertRule>) {
        *self.rules.write().await = new_rules;
    }

    /// Evaluate every enabled rule against per-tenant metric snapshots
    ///
    /// A rule scoped to a tenant only sees that tenant's metrics; unscoped
    /// rules run against every tenant in the snapshot. Cooldown guarantees
    /// at most one alert per (rule, tenant) per window, regardless of how
    /// many ticks occur within it. Raised alerts are persisted, dispatched,
    /// and returned.
    pub async fn evaluate_tick(
        &self,
        metrics_by_tenant: &HashMap<String, SystemMetrics>,
    ) -> Result<Vec<Alert>> {
        let now = Utc::now();
        let mut raised = Vec::new();

        let rules = self.rules.read().await;
        for rule in rules.iter().filter(|r| r.enabled) {
            let tenants: Vec<&String> = match &rule.tenant_id {
                Some(tenant) => metrics_by_tenant.keys().filter(|t| *t == tenant).collect(),
                None => metrics_by_tenant.keys().collect(),
            };

            for tenant in tenants {
                let metrics = &metrics_by_tenant[tenant];
                let triggered = match std::panic::catch_unwind(AssertUnwindSafe(|| {
                    rule.condition.evaluate(metrics)
                })) {
                    Ok(triggered) => triggered,
                    Err(_) => {
                        tracing::error!(
                            rule = %rule.id,
                            tenant = %tenant,
                            "Alert condition panicked; rule skipped this tick"
                        );
                        continue;
                    }
                };
                if !triggered {
                    continue;
                }

                if self.in_cooldown(rule, tenant, now).await {
                    tracing::debug!(rule = %rule.id, tenant = %tenant, "Alert suppressed by cooldown");
                    continue;
                }

                let mut metadata = HashMap::new();
                metadata.insert("ruleName".to_string(), rule.name.clone());
                metadata.insert("errorRate".to_string(), metrics.error_rate.to_string());
                metadata.insert(
                    "intrusionAttempts".to_string(),
                    metrics.intrusion_attempts.to_string(),
                );

                let alert = Alert {
                    id: format!("alr-{}", uuid::Uuid::new_v4()),
                    rule_id: rule.id.clone(),
                    tenant_id: tenant.clone(),
                    severity: rule.severity,
                    triggered_at: now,
                    resolved_at: None,
                    status: AlertStatus::Active,
                    metadata,
                };

                self.store.insert_alert(&alert).await?;
                if let Err(e) = self.notifier.notify(&alert).await {
                    tracing::error!(alert_id = %alert.id, error = %e, "Alert notification failed");
                }

                let mut cooldowns = self.cooldowns.write().await;
                cooldowns.insert((rule.id.clone(), tenant.clone()), now);
                raised.push(alert);
            }
        }

        Ok(raised)
    }

    async fn in_cooldown(&self, rule: &AlertRule, tenant: &str, now: DateTime<Utc>) -> bool {
        let cooldowns = self.cooldowns.read().await;
        match cooldowns.get(&(rule.id.clone(), tenant.to_string())) {
            Some(last) => now < *last + Duration::minutes(rule.cooldown_minutes),
            None => false,
        }
    }

    /// Transition an active alert to resolved
    pub async fn resolve_alert(&self, id: &str) -> Result<()> {
        self.store.resolve_alert(id, Utc::now()).await?;
        tracing::info!(alert_id = %id, "Alert resolved");
        Ok(())
    }

    /// All currently active alerts
    pub async fn active_alerts(&self) -> Result<Vec<Alert>> {
        self.store.active_alerts().await
    }

    /// Register a component health check
    pub async fn register_health_check(&self, check: Box<dyn HealthCheck>) {
        self.health_checks.write().await.push(check);
    }

    /// Run every registered health check and combine worst-of-component
    pub async fn get_system_health(&self) -> SystemHealth {
        let checks = self.health_checks.read().await;
        let mut components = Vec::with_capacity(checks.len());
        let mut overall = HealthStatus::Healthy;

        for check in checks.iter() {
            let component = check.check().await;
            overall = overall.combine(component.status);
            components.push(component);
        }

        SystemHealth {
            status: overall,
            components,
            checked_at: Utc::now(),
        }
    }
}

/// Overall or per-component health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    /// Combine two statuses, worst wins
    pub fn combine(self, other: HealthStatus) -> HealthStatus {
        match (self, other) {
            (HealthStatus::Critical, _) | (_, HealthStatus::Critical) => HealthStatus::Critical,
            (HealthStatus::Warning, _) | (_, HealthStatus::Warning) => HealthStatus::Warning,
            _ => HealthStatus::Healthy,
        }
    }
}

/// One component's health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    /// Component name (e.g., "datastore", "encryption")
    pub name: String,

    /// Component status
    pub status: HealthStatus,

    /// Optional detail, usually set when degraded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Check duration in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    /// A healthy component
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            latency_ms: None,
        }
    }

    /// A degraded component
    pub fn warning(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Warning,
            message: Some(message.into()),
            latency_ms: None,
        }
    }

    /// A failed component
    pub fn critical(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Critical,
            message: Some(message.into()),
            latency_ms: None,
        }
    }

    /// Attach the check latency
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Aggregated system health
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    /// Worst-of-component overall status
    pub status: HealthStatus,

    /// Individual component results
    pub components: Vec<ComponentHealth>,

    /// When the checks ran
    pub checked_at: DateTime<Utc>,
}

/// A single component health probe
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> ComponentHealth;
}

/// Datastore reachability probe
pub struct StoreHealthCheck {
    store: Arc<dyn SecurityStore>,
}

impl StoreHealthCheck {
    pub fn new(store: Arc<dyn SecurityStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthCheck for StoreHealthCheck {
    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        match self.store.tenants().await {
            Ok(_) => ComponentHealth::healthy("datastore")
                .with_latency(start.elapsed().as_millis() as u64),
            Err(e) => ComponentHealth::critical("datastore", e.to_string()),
        }
    }
}

/// Encryption round-trip probe
///
/// Encrypts and decrypts a small payload under a reserved probe tenant.
pub struct CipherHealthCheck {
    cipher: Arc<TenantCipher>,
}

impl CipherHealthCheck {
    pub fn new(cipher: Arc<TenantCipher>) -> Self {
        Self { cipher }
    }
}

#[async_trait]
impl HealthCheck for CipherHealthCheck {
    async fn check(&self) -> ComponentHealth {
        const PROBE_TENANT: &str = "__health_probe";
        let start = Instant::now();

        let result = async {
            let record = self.cipher.encrypt(b"probe", PROBE_TENANT).await?;
            self.cipher.decrypt(&record, PROBE_TENANT).await
        }
        .await;

        match result {
            Ok(plaintext) if plaintext == b"probe" => ComponentHealth::healthy("encryption")
                .with_latency(start.elapsed().as_millis() as u64),
            Ok(_) => ComponentHealth::critical("encryption", "round-trip mismatch"),
            Err(e) => ComponentHealth::critical("encryption", e.to_string()),
        }
    }
}
