//! Threat detection rules
//!
//! Each rule is a pure function over a window of audit events, returning
//! zero or more detected threats. Rules are registered in an ordered list
//! and evaluated in isolation — one rule's failure never blocks the rest.

use crate::types::{
    AuditEvent, SecurityThreat, ThreatSeverity, ERROR_INSUFFICIENT_PERMISSIONS,
};
use chrono::Timelike;
use std::collections::{HashMap, HashSet};

/// A detection rule evaluated over a recent window of audit events
pub trait ThreatRule: Send + Sync {
    /// Stable rule name, used in logs and threat dedup
    fn name(&self) -> &str;

    /// Evaluate the window and return newly detected threats
    fn evaluate(&self, events: &[AuditEvent]) -> Vec<SecurityThreat>;
}

/// The default rule set in evaluation order
pub fn default_rules() -> Vec<Box<dyn ThreatRule>> {
    vec![
        Box::new(BruteForceLoginRule::default()),
        Box::new(UnauthorizedAccessRule::default()),
        Box::new(OffHoursActivityRule::default()),
    ]
}

/// Repeated failed logins from one (user, ip) pair
///
/// At least `medium_threshold` failures raise a medium threat; at least
/// `high_threshold` escalate it to high.
pub struct BruteForceLoginRule {
    pub medium_threshold: usize,
    pub high_threshold: usize,
}

impl Default for BruteForceLoginRule {
    fn default() -> Self {
        Self {
            medium_threshold: 5,
            high_threshold: 10,
        }
    }
}

impl ThreatRule for BruteForceLoginRule {
    fn name(&self) -> &str {
        "brute_force_login"
    }

    fn evaluate(&self, events: &[AuditEvent]) -> Vec<SecurityThreat> {
        let mut groups: HashMap<(String, String), Vec<&AuditEvent>> = HashMap::new();
        for event in events {
            if event.action_type == "login" && !event.success {
                let ip = event.ip_address.clone().unwrap_or_default();
                groups
                    .entry((event.user_id.clone(), ip))
                    .or_default()
                    .push(event);
            }
        }

        groups
            .into_iter()
            .filter(|(_, hits)| hits.len() >= self.medium_threshold)
            .map(|((user, ip), hits)| {
                let severity = if hits.len() >= self.high_threshold {
                    ThreatSeverity::High
                } else {
                    ThreatSeverity::Medium
                };
                let mut threat =
                    SecurityThreat::detected(hits[0].tenant_id.clone(), self.name(), severity)
                    .with_user(user)
                    .with_resources(vec!["session".to_string()]);
                if !ip.is_empty() {
                    threat = threat.with_ip(ip);
                }
                threat
            })
            .collect()
    }
}

/// Repeated permission-denied failures by one user
///
/// At least `threshold` `INSUFFICIENT_PERMISSIONS` failures raise a medium
/// threat, escalated to high when the user probed `threshold` or more
/// distinct resource types.
pub struct UnauthorizedAccessRule {
    pub threshold: usize,
}

impl Default for UnauthorizedAccessRule {
    fn default() -> Self {
        Self { threshold: 3 }
    }
}

impl ThreatRule for UnauthorizedAccessRule {
    fn name(&self) -> &str {
        "unauthorized_access"
    }

    fn evaluate(&self, events: &[AuditEvent]) -> Vec<SecurityThreat> {
        let mut groups: HashMap<String, Vec<&AuditEvent>> = HashMap::new();
        for event in events {
            if !event.success
                && event.error_code.as_deref() == Some(ERROR_INSUFFICIENT_PERMISSIONS)
            {
                groups.entry(event.user_id.clone()).or_default().push(event);
            }
        }

        groups
            .into_iter()
            .filter(|(_, hits)| hits.len() >= self.threshold)
            .map(|(user, hits)| {
                let resource_types: HashSet<&str> =
                    hits.iter().map(|e| e.resource_type.as_str()).collect();
                let severity = if resource_types.len() >= self.threshold {
                    ThreatSeverity::High
                } else {
                    ThreatSeverity::Medium
                };
                let mut resources: Vec<String> =
                    resource_types.into_iter().map(String::from).collect();
                resources.sort();

                SecurityThreat::detected(hits[0].tenant_id.clone(), self.name(), severity)
                    .with_user(user)
                    .with_resources(resources)
            })
            .collect()
    }
}

/// Business-hours window for the off-hours rule (UTC hours, [start, end))
#[derive(Debug, Clone, Copy)]
pub struct BusinessHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: 8,
            end_hour: 18,
        }
    }
}

impl BusinessHours {
    /// Whether the timestamp falls inside business hours
    pub fn contains(&self, timestamp: chrono::DateTime<chrono::Utc>) -> bool {
        let hour = timestamp.hour();
        hour >= self.start_hour && hour < self.end_hour
    }
}

/// Sensitive actions performed outside business hours
///
/// `threshold` or more sensitive actions (delete, export, decrypt,
/// admin_action) by the same user outside the configured window raise a
/// medium threat.
pub struct OffHoursActivityRule {
    pub business_hours: BusinessHours,
    pub threshold: usize,
}

impl Default for OffHoursActivityRule {
    fn default() -> Self {
        Self {
            business_hours: BusinessHours::default(),
            threshold: 2,
        }
    }
}

impl ThreatRule for OffHoursActivityRule {
    fn name(&self) -> &str {
        "off_hours_activity"
    }

    fn evaluate(&self, events: &[AuditEvent]) -> Vec<SecurityThreat> {
        let mut groups: HashMap<String, Vec<&AuditEvent>> = HashMap::new();
        for event in events {
            if event.is_sensitive() && !self.business_hours.contains(event.timestamp) {
                groups.entry(event.user_id.clone()).or_default().push(event);
            }
        }

        groups
            .into_iter()
            .filter(|(_, hits)| hits.len() >= self.threshold)
            .map(|(user, hits)| {
                let mut resources: Vec<String> = hits
                    .iter()
                    .map(|e| e.resource_type.clone())
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                resources.sort();

                SecurityThreat::detected(
                    hits[0].tenant_id.clone(),
                    self.name(),
                    ThreatSeverity::Medium,
                )
                .with_user(user)
                .with_resources(resources)
            })
            .collect()
    }
}
