//! Core audit and threat types for the aegis security core
//!
//! All persisted types use camelCase JSON serialization for wire
//! compatibility with the surrounding platform services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Failed-authorization error code recognized by the unauthorized-access rule
pub const ERROR_INSUFFICIENT_PERMISSIONS: &str = "INSUFFICIENT_PERMISSIONS";

/// Action types considered sensitive by the off-hours detection rule
pub const SENSITIVE_ACTIONS: [&str; 4] = ["delete", "export", "decrypt", "admin_action"];

/// A single audit event recorded for a user action
///
/// Events are immutable once persisted. Consumers (CRUD services, gateway,
/// middleware) construct one per significant user action and hand it to
/// [`crate::audit::AuditLog::log_event`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Unique event identifier (evt-<uuid>)
    pub id: String,

    /// Tenant the action occurred under
    pub tenant_id: String,

    /// Acting user
    pub user_id: String,

    /// Action performed (e.g., "login", "delete", "export")
    pub action_type: String,

    /// Resource kind acted upon (e.g., "case", "document", "invoice")
    pub resource_type: String,

    /// Specific resource, when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    /// Caller's security context (role, session origin)
    pub security_context: String,

    /// Whether the action succeeded
    pub success: bool,

    /// Machine-readable failure code for unsuccessful actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// Source IP, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// When the action occurred
    pub timestamp: DateTime<Utc>,

    /// Optional key-value metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AuditEvent {
    /// Create a new successful event with auto-generated id and timestamp
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        action_type: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            action_type: action_type.into(),
            resource_type: resource_type.into(),
            resource_id: None,
            security_context: "user".to_string(),
            success: true,
            error_code: None,
            ip_address: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Mark the event as failed with a machine-readable error code
    pub fn failed(mut self, error_code: impl Into<String>) -> Self {
        self.success = false;
        self.error_code = Some(error_code.into());
        self
    }

    /// Set the specific resource acted upon
    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Set the caller's security context
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.security_context = context.into();
        self
    }

    /// Set the source IP address
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    /// Override the event timestamp (defaults to now)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether this action type is in the sensitive set
    pub fn is_sensitive(&self) -> bool {
        SENSITIVE_ACTIONS.contains(&self.action_type.as_str())
    }
}

/// Threat severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Lifecycle status of a detected threat
///
/// Created as `Detected`; the resolution workflow (external to this core)
/// drives the remaining transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatStatus {
    Detected,
    Investigating,
    Mitigated,
    Resolved,
    FalsePositive,
}

/// A security threat or violation detected from the audit stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityThreat {
    /// Unique threat identifier (thr-<uuid>)
    pub id: String,

    /// Tenant the threat was detected for
    pub tenant_id: String,

    /// Rule-assigned type (e.g., "brute_force_login")
    pub threat_type: String,

    /// Assessed severity
    pub severity: ThreatSeverity,

    /// Resources touched by the suspicious activity
    #[serde(default)]
    pub affected_resources: Vec<String>,

    /// Suspected user, when attributable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Source IP, when attributable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// Current lifecycle status
    pub status: ThreatStatus,

    /// When the threat was first detected
    pub detected_at: DateTime<Utc>,

    /// When the threat was resolved, if it has been
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SecurityThreat {
    /// Create a freshly detected threat
    pub fn detected(
        tenant_id: impl Into<String>,
        threat_type: impl Into<String>,
        severity: ThreatSeverity,
    ) -> Self {
        Self {
            id: format!("thr-{}", uuid::Uuid::new_v4()),
            tenant_id: tenant_id.into(),
            threat_type: threat_type.into(),
            severity,
            affected_resources: Vec::new(),
            user_id: None,
            ip_address: None,
            status: ThreatStatus::Detected,
            detected_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Attribute the threat to a user
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attribute the threat to a source IP
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    /// Record the resources touched by the suspicious activity
    pub fn with_resources(mut self, resources: Vec<String>) -> Self {
        self.affected_resources = resources;
        self
    }

    /// Whether the threat is still open (not resolved or dismissed)
    pub fn is_open(&self) -> bool {
        !matches!(
            self.status,
            ThreatStatus::Resolved | ThreatStatus::FalsePositive
        )
    }
}
