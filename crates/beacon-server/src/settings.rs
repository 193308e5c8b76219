//! Layered server settings.
//!
//! 1. compiled defaults ([`Settings::default`])
//! 2. an optional JSON file, deep-merged over the defaults
//! 3. environment variables, strictly parsed (invalid values are ignored)
//! 4. command-line flags ([`CliOverrides`])

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use beacon_telemetry::{parse_level, LogFormat, TelemetryConfig};
use beacon_upstream::{HttpConfig, PoolConfig, RetryConfig};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub upstream: UpstreamSettings,
    pub sse: SseSettings,
    pub tools: ToolSettings,
    pub webhook: WebhookSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// `json` or `compact`.
    pub log_format: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub pool_max_connections: usize,
    pub pool_max_per_host: usize,
    pub pool_idle_ttl_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SseSettings {
    pub heartbeat_interval_secs: u64,
    pub max_connections: usize,
    /// Inbound and outbound queue depth per session.
    pub queue_capacity: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    /// Base URL of the workflow instance that calls us; informational only.
    pub instance_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            upstream: UpstreamSettings::default(),
            sse: SseSettings::default(),
            tools: ToolSettings::default(),
            webhook: WebhookSettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3001,
            log_level: "info".into(),
            log_format: "json".into(),
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            api_key: String::new(),
            timeout_secs: 30,
            max_attempts: 3,
            backoff_min_ms: 1000,
            backoff_max_ms: 10_000,
            pool_max_connections: 100,
            pool_max_per_host: 30,
            pool_idle_ttl_secs: 300,
        }
    }
}

impl Default for SseSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            max_connections: 100,
            queue_capacity: 256,
        }
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

/// Flags given on the command line; `None` leaves the loaded value alone.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub upstream_url: Option<String>,
    pub log_level: Option<String>,
}

impl Settings {
    /// Load defaults, merge `path` if it exists, then apply the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        Self::load_with_env(path, |name| std::env::var(name).ok())
    }

    pub fn load_with_env(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SettingsError> {
        let defaults = serde_json::to_value(Self::default())?;
        let merged = match path {
            Some(path) if path.exists() => {
                debug!(?path, "loading settings from file");
                let content = std::fs::read_to_string(path)?;
                let user: Value = serde_json::from_str(&content)?;
                deep_merge(defaults, user)
            }
            Some(path) => {
                warn!(?path, "settings file not found, using defaults");
                defaults
            }
            None => defaults,
        };

        let mut settings: Self = serde_json::from_value(merged)?;
        settings.apply_env(env);
        Ok(settings)
    }

    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        let read = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = read("BEACON_HOST") {
            self.server.host = v;
        }
        if let Some(v) = parsed(&read, "BEACON_PORT", |s| parse_range::<u16>(s, 1, u16::MAX)) {
            self.server.port = v;
        }
        if let Some(v) = parsed(&read, "LOG_LEVEL", |s| parse_level(s).map(|_| s.trim().to_lowercase())) {
            self.server.log_level = v;
        }
        if let Some(v) = parsed(&read, "LOG_FORMAT", |s| s.parse::<LogFormat>().ok().map(|_| s.to_lowercase())) {
            self.server.log_format = v;
        }
        if let Some(v) = read("UPSTREAM_BASE_URL") {
            self.upstream.base_url = v;
        }
        if let Some(v) = env("UPSTREAM_API_KEY") {
            self.upstream.api_key = v;
        }
        if let Some(v) = parsed(&read, "UPSTREAM_TIMEOUT_SECS", |s| parse_range::<u64>(s, 1, 3600)) {
            self.upstream.timeout_secs = v;
        }
        if let Some(v) = parsed(&read, "UPSTREAM_MAX_ATTEMPTS", |s| parse_range::<u32>(s, 1, 20)) {
            self.upstream.max_attempts = v;
        }
        if let Some(v) = parsed(&read, "UPSTREAM_BACKOFF_MIN_MS", |s| parse_range::<u64>(s, 0, 600_000)) {
            self.upstream.backoff_min_ms = v;
        }
        if let Some(v) = parsed(&read, "UPSTREAM_BACKOFF_MAX_MS", |s| parse_range::<u64>(s, 0, 600_000)) {
            self.upstream.backoff_max_ms = v;
        }
        if let Some(v) = parsed(&read, "SSE_HEARTBEAT_INTERVAL_SECS", |s| parse_range::<u64>(s, 1, 3600)) {
            self.sse.heartbeat_interval_secs = v;
        }
        if let Some(v) = parsed(&read, "SSE_MAX_CONNECTIONS", |s| parse_range::<usize>(s, 1, 100_000)) {
            self.sse.max_connections = v;
        }
        if let Some(v) = parsed(&read, "TOOL_TIMEOUT_SECS", |s| parse_range::<u64>(s, 1, 3600)) {
            self.tools.timeout_secs = v;
        }
        if let Some(v) = read("WEBHOOK_INSTANCE_URL") {
            self.webhook.instance_url = v;
        }
    }

    pub fn apply_cli(&mut self, cli: CliOverrides) {
        if let Some(host) = cli.host {
            self.server.host = host;
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(url) = cli.upstream_url {
            self.upstream.base_url = url;
        }
        if let Some(level) = cli.log_level {
            self.server.log_level = level;
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.sse.heartbeat_interval_secs.max(1))
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.timeout_secs.max(1))
    }

    pub fn http_config(&self) -> HttpConfig {
        let up = &self.upstream;
        HttpConfig {
            api_key: Some(up.api_key.clone()).filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(up.timeout_secs.max(1)),
            pool: PoolConfig {
                max_connections: up.pool_max_connections,
                max_per_host: up.pool_max_per_host,
                idle_ttl: Duration::from_secs(up.pool_idle_ttl_secs),
            },
            ..HttpConfig::new(up.base_url.clone())
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.upstream.max_attempts.max(1),
            min_backoff: Duration::from_millis(self.upstream.backoff_min_ms),
            max_backoff: Duration::from_millis(self.upstream.backoff_max_ms),
            ..RetryConfig::default()
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        let mut config = TelemetryConfig::default();
        if let Some(level) = parse_level(&self.server.log_level) {
            config.log_level = level;
        }
        if let Ok(format) = self.server.log_format.parse() {
            config.format = format;
        }
        config
    }

    /// Settings as shown by diagnostics, with the API key redacted.
    pub fn summary(&self) -> Value {
        json!({
            "host": self.server.host,
            "port": self.server.port,
            "log_level": self.server.log_level,
            "upstream_base_url": self.upstream.base_url,
            "upstream_api_key_set": !self.upstream.api_key.is_empty(),
            "upstream_timeout_secs": self.upstream.timeout_secs,
            "upstream_max_attempts": self.upstream.max_attempts,
            "sse_heartbeat_interval_secs": self.sse.heartbeat_interval_secs,
            "sse_max_connections": self.sse.max_connections,
            "tool_timeout_secs": self.tools.timeout_secs,
            "webhook_instance_url": self.webhook.instance_url,
        })
    }
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, and nulls in
/// `source` keep the target value.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Parse an integer within `[min, max]`.
pub fn parse_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn parsed<T>(
    read: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = read(name)?;
    let value = parse(&raw);
    if value.is_none() {
        warn!(key = name, value = %raw, "invalid env var, ignoring");
    }
    value
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.server.port, 3001);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.upstream.base_url, "http://127.0.0.1:8000");
        assert_eq!(s.upstream.max_attempts, 3);
        assert_eq!(s.sse.heartbeat_interval_secs, 30);
        assert_eq!(s.sse.max_connections, 100);
        assert_eq!(s.upstream.pool_max_per_host, 30);
    }

    #[test]
    fn env_overrides_apply() {
        let mut s = Settings::default();
        s.apply_env(env_from(&[
            ("BEACON_PORT", "4000"),
            ("UPSTREAM_BASE_URL", "http://abc:9000"),
            ("UPSTREAM_API_KEY", "k"),
            ("SSE_HEARTBEAT_INTERVAL_SECS", "5"),
            ("SSE_MAX_CONNECTIONS", "2"),
            ("LOG_LEVEL", "DEBUG"),
        ]));
        assert_eq!(s.server.port, 4000);
        assert_eq!(s.upstream.base_url, "http://abc:9000");
        assert_eq!(s.upstream.api_key, "k");
        assert_eq!(s.sse.heartbeat_interval_secs, 5);
        assert_eq!(s.sse.max_connections, 2);
        assert_eq!(s.server.log_level, "debug");
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut s = Settings::default();
        s.apply_env(env_from(&[
            ("BEACON_PORT", "not-a-port"),
            ("UPSTREAM_MAX_ATTEMPTS", "0"),
            ("SSE_MAX_CONNECTIONS", "-1"),
            ("LOG_LEVEL", "loud"),
            ("BEACON_HOST", "   "),
        ]));
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn file_is_deep_merged() {
        let dir = std::env::temp_dir().join(format!("beacon-settings-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, r#"{"upstream": {"timeout_secs": 5}, "sse": {"max_connections": 7}}"#).unwrap();

        let s = Settings::load_with_env(Some(&path), |_| None).unwrap();
        assert_eq!(s.upstream.timeout_secs, 5);
        assert_eq!(s.upstream.max_attempts, 3);
        assert_eq!(s.sse.max_connections, 7);
        assert_eq!(s.sse.heartbeat_interval_secs, 30);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn env_wins_over_file() {
        let dir = std::env::temp_dir().join(format!("beacon-settings-env-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 5000}}"#).unwrap();

        let s = Settings::load_with_env(Some(&path), env_from(&[("BEACON_PORT", "6000")])).unwrap();
        assert_eq!(s.server.port, 6000);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_uses_defaults() {
        let s = Settings::load_with_env(Some(Path::new("/nonexistent/beacon.json")), |_| None).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn cli_wins_over_everything() {
        let mut s = Settings::default();
        s.apply_env(env_from(&[("BEACON_PORT", "4000")]));
        s.apply_cli(CliOverrides {
            port: Some(4100),
            upstream_url: Some("http://mock:1".into()),
            ..Default::default()
        });
        assert_eq!(s.server.port, 4100);
        assert_eq!(s.upstream.base_url, "http://mock:1");
    }

    #[test]
    fn deep_merge_rules() {
        let merged = deep_merge(
            json!({"a": {"b": 1, "c": [1, 2]}, "d": "x"}),
            json!({"a": {"c": [3], "e": true}, "d": null}),
        );
        assert_eq!(merged, json!({"a": {"b": 1, "c": [3], "e": true}, "d": "x"}));
    }

    #[test]
    fn derived_configs() {
        let mut s = Settings::default();
        s.upstream.api_key = "secret".into();
        let http = s.http_config();
        assert_eq!(http.api_key.as_deref(), Some("secret"));
        assert_eq!(http.timeout, Duration::from_secs(30));
        assert_eq!(http.pool.max_connections, 100);

        let retry = s.retry_config();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.min_backoff, Duration::from_secs(1));
        assert_eq!(retry.max_backoff, Duration::from_secs(10));

        assert_eq!(Settings::default().http_config().api_key, None);
    }

    #[test]
    fn summary_redacts_api_key() {
        let mut s = Settings::default();
        s.upstream.api_key = "secret".into();
        let summary = s.summary().to_string();
        assert!(!summary.contains("secret"));
        assert!(summary.contains("\"upstream_api_key_set\":true"));
    }
}
