//! Documents returned by the upstream data service and the combined
//! aggregation result.
//!
//! Decoding is tolerant: missing fields fall back to defaults so a partially
//! populated upstream document still yields a usable value.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::Category;

/// Upstream data service routes.
pub mod paths {
    pub const HEALTH: &str = "/api/system/health";
    pub const USERS: &str = "/api/users/status";
    pub const SERVICES: &str = "/api/services/list";
    pub const LOGS: &str = "/api/logs/query";
    pub const METRICS: &str = "/api/metrics/current";
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    #[serde(other)]
    Unknown,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    #[serde(default)]
    pub status: HealthState,
    #[serde(default)]
    pub services: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserState {
    Active,
    Inactive,
    Suspended,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserStatus {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub status: UserState,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_count: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Stopped,
    Degraded,
    Error,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_id: String,
    pub name: String,
    #[serde(default)]
    pub status: ServiceState,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub service: String,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub disk_usage: f64,
    #[serde(default)]
    pub network_in_mbps: f64,
    #[serde(default)]
    pub network_out_mbps: f64,
    #[serde(default)]
    pub request_rate: f64,
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// `GET /api/users/status` envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRoster {
    #[serde(default)]
    pub users: Vec<UserStatus>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub active: usize,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// `GET /api/services/list` envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceRoster {
    #[serde(default)]
    pub services: Vec<ServiceInfo>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub running: usize,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// `POST /api/logs/query` envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogPage {
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub timeframe: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Combined outcome of one fan-out. A field is `Some` only when its category
/// was requested and succeeded; each failure adds one `"<category>: <message>"`
/// entry to `errors`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<UserStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ServiceInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<LogEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SystemMetrics>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub execution_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl AggregationResult {
    pub fn empty() -> Self {
        Self {
            health: None,
            users: None,
            services: None,
            logs: None,
            metrics: None,
            errors: Vec::new(),
            execution_time_ms: 0.0,
            timestamp: Utc::now(),
        }
    }

    pub fn has(&self, category: Category) -> bool {
        match category {
            Category::Health => self.health.is_some(),
            Category::Users => self.users.is_some(),
            Category::Services => self.services.is_some(),
            Category::Logs => self.logs.is_some(),
            Category::Metrics => self.metrics.is_some(),
        }
    }

    /// Categories that produced a payload, in reporting order.
    pub fn succeeded(&self) -> Vec<Category> {
        Category::ALL.into_iter().filter(|c| self.has(*c)).collect()
    }

    pub fn record_failure(&mut self, category: Category, message: impl std::fmt::Display) {
        self.errors.push(format!("{category}: {message}"));
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_decodes_with_missing_fields() {
        let h: HealthStatus = serde_json::from_str(r#"{"status":"healthy"}"#).unwrap();
        assert_eq!(h.status, HealthState::Healthy);
        assert!(h.services.is_empty());
        assert!(h.uptime_seconds.is_none());
    }

    #[test]
    fn unknown_states_fall_back() {
        let h: HealthStatus = serde_json::from_str(r#"{"status":"on fire"}"#).unwrap();
        assert_eq!(h.status, HealthState::Unknown);

        let s: ServiceInfo =
            serde_json::from_str(r#"{"service_id":"x","name":"X","status":"rebooting"}"#).unwrap();
        assert_eq!(s.status, ServiceState::Unknown);
    }

    #[test]
    fn service_roster_accepts_degraded() {
        let json = r#"{"services":[{"service_id":"svc-005","name":"analytics-service","status":"degraded","version":"2.1.0"}],"total":1,"running":0}"#;
        let roster: ServiceRoster = serde_json::from_str(json).unwrap();
        assert_eq!(roster.services[0].status, ServiceState::Degraded);
        assert!(roster.services[0].endpoints.is_empty());
    }

    #[test]
    fn log_entry_roundtrips_rfc3339() {
        let json = r#"{"timestamp":"2025-01-01T10:00:00Z","level":"error","service":"api","message":"boom"}"#;
        let entry: LogEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.level, "error");
        assert!(entry.metadata.is_empty());
    }

    #[test]
    fn unrequested_categories_are_absent_from_json() {
        let mut result = AggregationResult::empty();
        result.users = Some(Vec::new());
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("health").is_none());
        assert_eq!(json["users"], serde_json::json!([]));
        assert_eq!(json["errors"], serde_json::json!([]));
    }

    #[test]
    fn succeeded_is_presence_based_and_ordered() {
        let mut result = AggregationResult::empty();
        result.logs = Some(Vec::new());
        result.health = Some(HealthStatus {
            status: HealthState::Healthy,
            services: BTreeMap::new(),
            uptime_seconds: None,
            timestamp: Utc::now(),
        });
        assert_eq!(result.succeeded(), vec![Category::Health, Category::Logs]);
    }

    #[test]
    fn record_failure_prefixes_category() {
        let mut result = AggregationResult::empty();
        assert!(result.is_complete());
        result.record_failure(Category::Metrics, "timeout after 30s");
        assert_eq!(result.errors, vec!["metrics: timeout after 30s".to_string()]);
        assert!(!result.is_complete());
    }
}
