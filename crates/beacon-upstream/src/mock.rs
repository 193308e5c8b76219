use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use beacon_core::models::paths;
use beacon_core::UpstreamError;

use crate::transport::{UpstreamRequest, UpstreamTransport};

/// Pre-programmed reply for deterministic tests without a live service.
#[derive(Clone, Debug)]
pub enum MockReply {
    Json(Value),
    Error(UpstreamError),
    /// Wait a duration, then produce the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    pub fn network(msg: &str) -> Self {
        Self::Error(UpstreamError::Network(msg.to_string()))
    }

    pub fn status(status: u16, reason: &str) -> Self {
        Self::Error(UpstreamError::from_status(status, reason, ""))
    }
}

/// Transport that answers from per-path scripts.
///
/// Queued replies are consumed in order; once a path's queue is empty its
/// sticky reply (if any) is returned on every further call.
#[derive(Default)]
pub struct ScriptedTransport {
    queued: Mutex<HashMap<String, VecDeque<MockReply>>>,
    sticky: Mutex<HashMap<String, MockReply>>,
    calls: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every endpoint answers with a healthy fixture.
    pub fn healthy() -> Self {
        Self::new()
            .always(paths::HEALTH, MockReply::Json(fixtures::health()))
            .always(paths::USERS, MockReply::Json(fixtures::users()))
            .always(paths::SERVICES, MockReply::Json(fixtures::services()))
            .always(paths::LOGS, MockReply::Json(fixtures::logs(5)))
            .always(paths::METRICS, MockReply::Json(fixtures::metrics()))
    }

    /// Queue a one-shot reply for `path`.
    pub fn then(self, path: &str, reply: MockReply) -> Self {
        self.queued
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Reply used whenever `path` has nothing queued.
    pub fn always(self, path: &str, reply: MockReply) -> Self {
        self.sticky.lock().insert(path.to_string(), reply);
        self
    }

    pub fn call_count(&self, path: &str) -> usize {
        self.calls.lock().iter().filter(|r| r.path == path).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.calls.lock().clone()
    }

    fn next_reply(&self, path: &str) -> Option<MockReply> {
        if let Some(reply) = self.queued.lock().get_mut(path).and_then(VecDeque::pop_front) {
            return Some(reply);
        }
        self.sticky.lock().get(path).cloned()
    }
}

#[async_trait]
impl UpstreamTransport for ScriptedTransport {
    fn base_url(&self) -> &str {
        "mock://upstream"
    }

    async fn send(&self, request: &UpstreamRequest) -> Result<Value, UpstreamError> {
        self.calls.lock().push(request.clone());
        let mut reply = self.next_reply(&request.path).ok_or_else(|| {
            UpstreamError::InvalidRequest(format!("no scripted reply for {}", request.path))
        })?;
        loop {
            match reply {
                MockReply::Json(value) => return Ok(value),
                MockReply::Error(err) => return Err(err),
                MockReply::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        }
    }
}

/// Canned upstream documents.
pub mod fixtures {
    use super::*;

    pub fn health() -> Value {
        json!({
            "status": "healthy",
            "uptime_seconds": 86_400,
            "timestamp": Utc::now(),
            "services": {"api-gateway": "running", "user-service": "running"}
        })
    }

    pub fn users() -> Value {
        json!({
            "users": [
                {"user_id": "usr-001", "username": "admin", "status": "active",
                 "last_login": Utc::now() - ChronoDuration::minutes(15), "session_count": 2},
                {"user_id": "usr-002", "username": "bob.wilson", "status": "inactive",
                 "last_login": null, "session_count": 0}
            ],
            "total": 2,
            "active": 1,
            "timestamp": Utc::now()
        })
    }

    pub fn services() -> Value {
        json!({
            "services": [
                {"service_id": "svc-001", "name": "api-gateway", "status": "running",
                 "version": "2.3.1", "endpoints": ["/api/v1/users"]},
                {"service_id": "svc-002", "name": "user-service", "status": "running",
                 "version": "1.8.0", "endpoints": ["/users"]}
            ],
            "total": 2,
            "running": 2,
            "timestamp": Utc::now()
        })
    }

    /// `count` entries, oldest first so callers must sort.
    pub fn logs(count: usize) -> Value {
        let now = Utc::now();
        let logs: Vec<Value> = (0..count)
            .map(|i| {
                json!({
                    "timestamp": now - ChronoDuration::minutes((count - i) as i64),
                    "level": if i % 3 == 0 { "error" } else { "info" },
                    "service": "api-gateway",
                    "message": format!("request {i} completed"),
                    "metadata": {"request_id": format!("req-{i}")}
                })
            })
            .collect();
        json!({"logs": logs, "total": count, "timeframe": "1h", "timestamp": now})
    }

    pub fn metrics() -> Value {
        json!({
            "cpu_usage": 42.5,
            "memory_usage": 61.0,
            "disk_usage": 48.2,
            "network_in_mbps": 55.1,
            "network_out_mbps": 21.7,
            "request_rate": 512.0,
            "error_rate": 0.8,
            "timestamp": Utc::now()
        })
    }
}
