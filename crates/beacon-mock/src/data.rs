//! Fixed rosters and randomised documents served by the mock upstream.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Map};

use beacon_core::{
    HealthState, HealthStatus, LogEntry, LogLevel, LogPage, LogQuery, ServiceInfo, ServiceRoster,
    ServiceState, SystemMetrics, UserRoster, UserState, UserStatus,
};

const SERVICES: &[(&str, &str, ServiceState, &str, [&str; 2])] = &[
    ("svc-001", "api-gateway", ServiceState::Running, "2.3.1", ["/api/v1/users", "/api/v1/auth"]),
    ("svc-002", "user-service", ServiceState::Running, "1.8.0", ["/users", "/profiles"]),
    ("svc-003", "payment-service", ServiceState::Running, "3.2.5", ["/payments", "/transactions"]),
    ("svc-004", "notification-service", ServiceState::Running, "1.5.2", ["/notifications", "/emails"]),
    ("svc-005", "analytics-service", ServiceState::Degraded, "2.1.0", ["/analytics", "/reports"]),
];

/// (id, name, status, minutes since last login, sessions)
const USERS: &[(&str, &str, UserState, i64, u32)] = &[
    ("usr-001", "admin", UserState::Active, 15, 2),
    ("usr-002", "john.doe", UserState::Active, 120, 1),
    ("usr-003", "jane.smith", UserState::Active, 45, 3),
    ("usr-004", "bob.wilson", UserState::Inactive, 5 * 24 * 60, 0),
    ("usr-005", "alice.brown", UserState::Active, 60, 1),
];

const LOG_MESSAGES: &[&str] = &[
    "User authentication successful",
    "Payment processed successfully",
    "Database connection established",
    "Cache hit for user profile",
    "API request completed in 145ms",
    "Email notification sent",
    "Failed login attempt detected",
    "Rate limit exceeded for IP",
    "Database query timeout",
    "Service health check passed",
    "Backup completed successfully",
    "Invalid token provided",
    "Session expired",
    "File upload completed",
    "Report generation started",
];

const LOG_LEVELS: &[LogLevel] = &[LogLevel::Debug, LogLevel::Info, LogLevel::Warning, LogLevel::Error];

/// Entries produced when the timeframe has no recognised unit.
const DEFAULT_LOG_COUNT: u32 = 50;

pub fn services(healthy_only: bool) -> Vec<ServiceInfo> {
    SERVICES
        .iter()
        .map(|(id, name, status, version, endpoints)| ServiceInfo {
            service_id: (*id).into(),
            name: (*name).into(),
            status: if healthy_only { ServiceState::Running } else { *status },
            version: (*version).into(),
            endpoints: endpoints.iter().map(|e| (*e).to_string()).collect(),
        })
        .collect()
}

pub fn health(healthy_only: bool) -> HealthStatus {
    let services: BTreeMap<String, String> = self::services(healthy_only)
        .into_iter()
        .map(|s| (s.name, service_state_str(s.status).to_string()))
        .collect();
    let degraded = services.values().any(|s| s == "degraded");

    HealthStatus {
        status: if degraded { HealthState::Degraded } else { HealthState::Healthy },
        services,
        uptime_seconds: Some(rand::thread_rng().gen_range(86_400..=2_592_000)),
        timestamp: Utc::now(),
    }
}

pub fn user_roster() -> UserRoster {
    let now = Utc::now();
    let users: Vec<UserStatus> = USERS
        .iter()
        .map(|(id, name, status, minutes_ago, sessions)| UserStatus {
            user_id: (*id).into(),
            username: (*name).into(),
            status: *status,
            last_login: Some(now - Duration::minutes(*minutes_ago)),
            session_count: *sessions,
        })
        .collect();
    let active = users.iter().filter(|u| u.status == UserState::Active).count();

    UserRoster {
        total: users.len(),
        active,
        users,
        timestamp: now,
    }
}

pub fn service_roster(healthy_only: bool) -> ServiceRoster {
    let services = services(healthy_only);
    let running = services.iter().filter(|s| s.status == ServiceState::Running).count();
    ServiceRoster {
        total: services.len(),
        running,
        services,
        timestamp: Utc::now(),
    }
}

/// Number of entries a timeframe yields before the limit applies:
/// 20 per hour, 480 per day, 2 per minute.
pub fn log_count(timeframe: &str, limit: u32) -> u32 {
    let per_unit = |suffix: char, rate: u32| {
        timeframe
            .strip_suffix(suffix)
            .and_then(|n| n.trim().parse::<u32>().ok())
            .map(|n| n.saturating_mul(rate))
    };
    let count = per_unit('h', 20)
        .or_else(|| per_unit('d', 480))
        .or_else(|| per_unit('m', 2))
        .unwrap_or(DEFAULT_LOG_COUNT);
    count.min(limit)
}

pub fn query_logs(query: &LogQuery) -> LogPage {
    let now = Utc::now();
    let count = log_count(&query.timeframe, query.limit);
    let mut rng = rand::thread_rng();

    let mut logs: Vec<LogEntry> = (0..count)
        .map(|_| {
            let level = query
                .level
                .or_else(|| LOG_LEVELS.choose(&mut rng).copied())
                .unwrap_or(LogLevel::Info);
            let service = query.service.clone().unwrap_or_else(|| {
                SERVICES
                    .choose(&mut rng)
                    .map(|s| s.1)
                    .unwrap_or("api-gateway")
                    .to_string()
            });
            let message = LOG_MESSAGES.choose(&mut rng).copied().unwrap_or("ok");

            let mut metadata = Map::new();
            metadata.insert("request_id".into(), json!(format!("req-{}", rng.gen_range(10_000..=99_999))));
            metadata.insert("duration_ms".into(), json!(rng.gen_range(10..=500)));

            LogEntry {
                timestamp: now - Duration::minutes(rng.gen_range(1..=60)),
                level: level.as_str().to_string(),
                service,
                message: message.to_string(),
                metadata,
            }
        })
        .collect();

    if let Some(term) = query.search.as_deref().map(str::to_lowercase) {
        logs.retain(|l| l.message.to_lowercase().contains(&term));
    }
    logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    LogPage {
        total: logs.len(),
        logs,
        timeframe: query.timeframe.clone(),
        timestamp: now,
    }
}

pub fn metrics() -> SystemMetrics {
    let mut rng = rand::thread_rng();
    let mut sample = |lo: f64, hi: f64| round2(rng.gen_range(lo..hi));
    SystemMetrics {
        cpu_usage: sample(20.0, 80.0),
        memory_usage: sample(40.0, 85.0),
        disk_usage: sample(30.0, 70.0),
        network_in_mbps: sample(10.0, 100.0),
        network_out_mbps: sample(5.0, 50.0),
        request_rate: sample(100.0, 1000.0),
        error_rate: sample(0.1, 5.0),
        timestamp: Utc::now(),
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn service_state_str(state: ServiceState) -> &'static str {
    match state {
        ServiceState::Running => "running",
        ServiceState::Stopped => "stopped",
        ServiceState::Degraded => "degraded",
        ServiceState::Error => "error",
        ServiceState::Unknown => "unknown",
    }
}
