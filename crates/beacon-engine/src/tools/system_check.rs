use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

use beacon_core::models::{ServiceState, UserState};
use beacon_core::tools::{Tool, ToolError};
use beacon_core::{AggregationResult, LogLevel};
use beacon_upstream::{ResilientClient, UpstreamTransport};

use crate::intent::{IntentExtractor, ParsedIntent};

pub const TOOL_NAME: &str = "check_system";

/// Log entries included in the formatted output. The level breakdown still
/// counts every returned entry.
const MAX_FORMATTED_LOGS: usize = 50;

#[derive(Debug, Default, Deserialize)]
struct CheckArgs {
    #[serde(default)]
    query: String,
    #[serde(default)]
    filters: Option<CheckFilters>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckFilters {
    log_timeframe: Option<String>,
    log_level: Option<String>,
    log_service: Option<String>,
}

/// Natural-language system check backed by the upstream fan-out.
pub struct CheckSystemTool<T: UpstreamTransport> {
    client: Arc<ResilientClient<T>>,
    extractor: IntentExtractor,
}

impl<T: UpstreamTransport> CheckSystemTool<T> {
    pub fn new(client: Arc<ResilientClient<T>>, extractor: IntentExtractor) -> Self {
        Self { client, extractor }
    }

    fn plan(&self, args: &CheckArgs) -> Result<ParsedIntent, ToolError> {
        let mut intent = self.extractor.parse(&args.query);
        let Some(filters) = &args.filters else {
            return Ok(intent);
        };

        let query = &mut intent.plan.log_query;
        if let Some(timeframe) = &filters.log_timeframe {
            query.timeframe = timeframe.clone();
        }
        if let Some(level) = &filters.log_level {
            query.level = Some(level.parse::<LogLevel>().map_err(ToolError::InvalidArguments)?);
        }
        if let Some(service) = &filters.log_service {
            query.service = Some(service.clone());
        }
        Ok(intent)
    }
}

#[async_trait]
impl<T: UpstreamTransport + 'static> Tool for CheckSystemTool<T> {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Check the upstream system with up to five parallel API calls. Accepts natural \
         language in English or Vietnamese and covers health, users, services, logs \
         and metrics."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Natural-language request, e.g. 'Check all systems', \
                                    'show error logs from the last 24 hours', 'Kiểm tra toàn bộ hệ thống'"
                },
                "filters": {
                    "type": "object",
                    "description": "Explicit overrides for the log query",
                    "properties": {
                        "log_timeframe": {
                            "type": "string",
                            "description": "Timeframe for logs (e.g. '1h', '24h', '7d')"
                        },
                        "log_level": {
                            "type": "string",
                            "enum": ["debug", "info", "warning", "error", "critical"],
                            "description": "Log level filter"
                        },
                        "log_service": {
                            "type": "string",
                            "description": "Filter logs by service name"
                        }
                    }
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: CheckArgs = if args.is_null() {
            CheckArgs::default()
        } else {
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?
        };

        let intent = self.plan(&args)?;
        let result = self.client.aggregate(&intent.plan).await;
        info!(
            query = %intent.original_query,
            errors = result.errors.len(),
            elapsed_ms = result.execution_time_ms,
            "system check completed"
        );
        Ok(format_result(&result, &intent))
    }
}

/// Shape an aggregation result into the tool's JSON output.
pub fn format_result(result: &AggregationResult, intent: &ParsedIntent) -> Value {
    let mut out = Map::new();
    out.insert("success".into(), json!(result.errors.is_empty()));
    out.insert("timestamp".into(), json!(result.timestamp));
    out.insert("execution_time_ms".into(), json!(result.execution_time_ms));
    out.insert("query".into(), json!(intent.original_query));
    out.insert("confidence".into(), json!(intent.confidence));

    if let Some(health) = &result.health {
        out.insert(
            "health".into(),
            json!({
                "status": health.status,
                "uptime_seconds": health.uptime_seconds,
                "services": health.services,
            }),
        );
    }

    if let Some(users) = &result.users {
        let entries: Vec<Value> = users
            .iter()
            .map(|u| {
                json!({
                    "username": u.username,
                    "status": u.status,
                    "session_count": u.session_count,
                    "last_login": u.last_login,
                })
            })
            .collect();
        out.insert(
            "users".into(),
            json!({
                "total": users.len(),
                "active": users.iter().filter(|u| u.status == UserState::Active).count(),
                "users": entries,
            }),
        );
    }

    if let Some(services) = &result.services {
        let entries: Vec<Value> = services
            .iter()
            .map(|s| {
                json!({
                    "name": s.name,
                    "status": s.status,
                    "version": s.version,
                    "endpoints": s.endpoints,
                })
            })
            .collect();
        out.insert(
            "services".into(),
            json!({
                "total": services.len(),
                "running": services.iter().filter(|s| s.status == ServiceState::Running).count(),
                "services": entries,
            }),
        );
    }

    if let Some(logs) = &result.logs {
        let mut breakdown: BTreeMap<&str, usize> = BTreeMap::new();
        for entry in logs {
            *breakdown.entry(entry.level.as_str()).or_default() += 1;
        }
        let entries: Vec<Value> = logs
            .iter()
            .take(MAX_FORMATTED_LOGS)
            .map(|l| {
                json!({
                    "timestamp": l.timestamp,
                    "level": l.level,
                    "service": l.service,
                    "message": l.message,
                    "metadata": l.metadata,
                })
            })
            .collect();
        out.insert(
            "logs".into(),
            json!({
                "total": logs.len(),
                "timeframe": intent.plan.log_query.timeframe,
                "entries": entries,
                "level_breakdown": breakdown,
            }),
        );
    }

    if let Some(metrics) = &result.metrics {
        out.insert("metrics".into(), json!(metrics));
    }

    if !result.errors.is_empty() {
        out.insert("errors".into(), json!(result.errors));
    }

    let checks: Vec<&str> = result.succeeded().iter().map(|c| c.as_str()).collect();
    out.insert(
        "summary".into(),
        json!({
            "checks_performed": checks,
            "total_checks": checks.len(),
            "errors_count": result.errors.len(),
        }),
    );

    Value::Object(out)
}
