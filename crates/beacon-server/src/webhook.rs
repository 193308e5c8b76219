//! Workflow webhook adapter: turns inbound trigger calls into tool runs.

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use beacon_core::tools::ToolError;

use crate::context::AppContext;
use crate::server::error_response;

const DEFAULT_TOOL: &str = "check_system";
const MIN_WEBHOOK_ID_LEN: usize = 3;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookRequest {
    tool: Option<String>,
    #[serde(default)]
    params: Value,
    execution_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub tool: String,
    pub timestamp: DateTime<Utc>,
    pub execution_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn webhook_handler(
    State(ctx): State<AppContext>,
    Path(webhook_id): Path<String>,
    body: Bytes,
) -> Response {
    if webhook_id.chars().count() < MIN_WEBHOOK_ID_LEN {
        return error_response(StatusCode::BAD_REQUEST, "Invalid webhook ID");
    }
    let request: WebhookRequest = if body.iter().all(u8::is_ascii_whitespace) {
        WebhookRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {e}")),
        }
    };

    let tool_name = request.tool.unwrap_or_else(|| DEFAULT_TOOL.to_string());
    info!(
        webhook_id = %webhook_id,
        tool = %tool_name,
        execution_id = request.execution_id.as_deref().unwrap_or("-"),
        "processing webhook"
    );

    let start = Instant::now();
    let outcome = match ctx.registry.get(&tool_name) {
        Some(tool) => {
            let args = if request.params.is_null() { json!({}) } else { request.params };
            beacon_engine::invoke(tool.as_ref(), args, ctx.settings.tool_timeout(), Some(&ctx.metrics)).await
        }
        None => Err(ToolError::ExecutionFailed(format!("Tool not found: {tool_name}"))),
    };
    let execution_time_ms = start.elapsed().as_secs_f64() * 1000.0;

    let response = match outcome {
        Ok(data) => {
            info!(webhook_id = %webhook_id, elapsed_ms = execution_time_ms, "webhook completed");
            WebhookResponse {
                success: true,
                data: Some(data),
                tool: tool_name,
                timestamp: Utc::now(),
                execution_time_ms,
                error: None,
            }
        }
        Err(e) => {
            warn!(webhook_id = %webhook_id, elapsed_ms = execution_time_ms, error = %e, "webhook failed");
            WebhookResponse {
                success: false,
                data: None,
                tool: tool_name,
                timestamp: Utc::now(),
                execution_time_ms,
                error: Some(match e {
                    ToolError::ExecutionFailed(msg) => msg,
                    other => other.to_string(),
                }),
            }
        }
    };
    Json(response).into_response()
}

pub async fn tools_handler(State(ctx): State<AppContext>) -> impl IntoResponse {
    let tools: Vec<Value> = ctx
        .registry
        .definitions()
        .into_iter()
        .map(|d| {
            json!({
                "name": d.name,
                "description": d.description,
                "input_schema": d.input_schema,
            })
        })
        .collect();
    Json(json!({ "tools": tools }))
}
