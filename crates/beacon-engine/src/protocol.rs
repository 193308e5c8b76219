//! JSON-RPC control-protocol engine.
//!
//! One engine serves one streaming session. It starts uninitialized and moves
//! to initialized on the first successful `initialize`; there is no way back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use beacon_core::EngineId;
use beacon_telemetry::MetricsRecorder;

use crate::error::EngineError;
use crate::registry::ToolRegistry;
use crate::rpc::{self, Incoming, RpcError, RpcNotification, RpcResponse};
use crate::tools::{self, DEFAULT_TOOL_TIMEOUT};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Name and version advertised in `initialize` and diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServerIdentity {
    pub name: String,
    pub version: String,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            name: "beacon".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// Diagnostic snapshot of an engine.
#[derive(Clone, Debug, Serialize)]
pub struct EngineInfo {
    pub name: String,
    pub version: String,
    pub session_id: String,
    pub initialized: bool,
    pub tools_count: usize,
    pub client_info: Option<Value>,
}

pub struct ProtocolEngine {
    id: EngineId,
    registry: Arc<ToolRegistry>,
    identity: ServerIdentity,
    initialized: AtomicBool,
    client_info: RwLock<Option<Value>>,
    cancelled: Mutex<Vec<Value>>,
    tool_timeout: Duration,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ProtocolEngine {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        let id = EngineId::new();
        debug!(engine_id = %id, tools = registry.count(), "protocol engine created");
        Self {
            id,
            registry,
            identity: ServerIdentity::default(),
            initialized: AtomicBool::new(false),
            client_info: RwLock::new(None),
            cancelled: Mutex::new(Vec::new()),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            metrics: None,
        }
    }

    pub fn with_identity(mut self, identity: ServerIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn id(&self) -> &EngineId {
        &self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Request ids named by `notifications/cancelled`, in arrival order.
    pub fn cancelled_requests(&self) -> Vec<Value> {
        self.cancelled.lock().clone()
    }

    /// Process one raw frame. Requests always produce exactly one serialized
    /// response; notifications produce an empty string.
    pub async fn handle_message(&self, raw: &str) -> String {
        let message: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(engine_id = %self.id, error = %e, "unparseable frame");
                return RpcResponse::failure(Value::Null, RpcError::parse_error()).to_json();
            }
        };

        match rpc::classify(message) {
            Err(response) => response.to_json(),
            Ok(Incoming::Notification { method, params }) => {
                self.handle_notification(&method, &params);
                String::new()
            }
            Ok(Incoming::Request { id, method, params }) => {
                let response = match self.dispatch(&method, params).await {
                    Ok(result) => RpcResponse::success(id, result),
                    Err(e) => {
                        warn!(engine_id = %self.id, method = %method, error = %e, "request failed");
                        RpcResponse::failure(id, e.to_rpc_error())
                    }
                };
                response.to_json()
            }
        }
    }

    #[instrument(skip(self, params), fields(engine_id = %self.id))]
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        match method {
            "initialize" => Ok(self.initialize(params)),
            "initialized" => Ok(json!({})),
            "ping" => Ok(json!({"status": "pong", "timestamp": Utc::now()})),
            "tools/list" => {
                self.require_initialized()?;
                Ok(json!({"tools": self.registry.definitions()}))
            }
            "tools/call" => {
                self.require_initialized()?;
                self.call_tool(&params).await
            }
            other => Err(EngineError::MethodNotFound(other.to_string())),
        }
    }

    fn require_initialized(&self) -> Result<(), EngineError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(EngineError::NotInitialized)
        }
    }

    fn initialize(&self, params: Value) -> Value {
        info!(
            engine_id = %self.id,
            client = %params.get("clientInfo").unwrap_or(&serde_json::Value::Null),
            "client initialized"
        );
        *self.client_info.write() = Some(params);
        self.initialized.store(true, Ordering::Release);

        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {"list": true, "call": true},
                "resources": {},
                "prompts": {},
                "logging": {},
            },
            "serverInfo": self.identity,
        })
    }

    async fn call_tool(&self, params: &Value) -> Result<Value, EngineError> {
        let name = rpc::require_str(params, "name")?;
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let Some(tool) = self.registry.get(name) else {
            warn!(engine_id = %self.id, tool = %name, "unknown tool requested");
            return Ok(tool_content(format!("Tool not found: {name}"), true));
        };

        info!(engine_id = %self.id, tool = %name, "calling tool");
        let outcome = tools::invoke(
            tool.as_ref(),
            arguments,
            self.tool_timeout,
            self.metrics.as_deref(),
        )
        .await;

        Ok(match outcome {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result)
                    .map_err(|e| EngineError::Internal(e.to_string()))?;
                tool_content(text, false)
            }
            Err(e) => tool_content(format!("Error executing tool: {e}"), true),
        })
    }

    fn handle_notification(&self, method: &str, params: &Value) {
        match method {
            "notifications/cancelled" => {
                let request_id = params
                    .get("requestId")
                    .or_else(|| params.get("id"))
                    .cloned()
                    .unwrap_or(Value::Null);
                info!(engine_id = %self.id, request_id = %request_id, "operation cancelled");
                self.cancelled.lock().push(request_id);
            }
            "notifications/progress" => {
                debug!(engine_id = %self.id, progress = %params, "progress update");
            }
            "notifications/initialized" => {
                debug!(engine_id = %self.id, "client confirmed initialization");
            }
            other => {
                debug!(engine_id = %self.id, method = %other, "ignoring unknown notification");
            }
        }
    }

    /// Serialize a server-to-client notification.
    pub fn create_notification(&self, method: &str, params: Value) -> String {
        serde_json::to_string(&RpcNotification::new(method, params)).unwrap_or_default()
    }

    pub fn server_info(&self) -> EngineInfo {
        EngineInfo {
            name: self.identity.name.clone(),
            version: self.identity.version.clone(),
            session_id: self.id.to_string(),
            initialized: self.is_initialized(),
            tools_count: self.registry.count(),
            client_info: self.client_info.read().clone(),
        }
    }
}

fn tool_content(text: String, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": text}],
        "isError": is_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beacon_core::tools::{Tool, ToolError};

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Return the arguments"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, args: Value) -> Result<Value, ToolError> {
            Ok(args)
        }
    }

    struct Failing;

    #[async_trait]
    impl Tool for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
            Err(ToolError::ExecutionFailed("upstream exploded".into()))
        }
    }

    fn engine() -> ProtocolEngine {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        registry.register(Arc::new(Failing));
        ProtocolEngine::new(Arc::new(registry))
    }

    async fn call(engine: &ProtocolEngine, msg: Value) -> Value {
        let raw = engine.handle_message(&msg.to_string()).await;
        serde_json::from_str(&raw).unwrap()
    }

    async fn initialized() -> ProtocolEngine {
        let e = engine();
        call(
            &e,
            json!({"jsonrpc": "2.0", "id": 0, "method": "initialize",
                   "params": {"clientInfo": {"name": "test", "version": "1"}}}),
        )
        .await;
        e
    }

    #[tokio::test]
    async fn malformed_json_is_parse_error() {
        let e = engine();
        for raw in ["{not json", "", "[1,", "\"unterminated"] {
            let v: Value = serde_json::from_str(&e.handle_message(raw).await).unwrap();
            assert_eq!(v["error"]["code"], rpc::PARSE_ERROR, "{raw}");
            assert!(v["id"].is_null());
        }
        assert!(!e.is_initialized());
    }

    #[tokio::test]
    async fn wrong_version_is_invalid_request() {
        let v = call(&engine(), json!({"jsonrpc": "1.0", "id": 3, "method": "ping"})).await;
        assert_eq!(v["error"]["code"], rpc::INVALID_REQUEST);
        assert_eq!(v["id"], 3);
    }

    #[tokio::test]
    async fn initialize_returns_capabilities() {
        let e = engine();
        let v = call(&e, json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}})).await;
        assert_eq!(v["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(v["result"]["capabilities"]["tools"]["call"], true);
        assert_eq!(v["result"]["serverInfo"]["name"], "beacon");
        assert!(e.is_initialized());
    }

    #[tokio::test]
    async fn methods_require_initialize() {
        let e = engine();
        for method in ["tools/list", "tools/call"] {
            let v = call(&e, json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": {"name": "echo"}})).await;
            assert_eq!(v["error"]["code"], rpc::INTERNAL_ERROR, "{method}");
            assert_eq!(v["error"]["message"], "Internal error: Server not initialized");
        }

        call(&e, json!({"jsonrpc": "2.0", "id": 2, "method": "initialize"})).await;
        let v = call(&e, json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"})).await;
        assert_eq!(v["result"]["tools"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ping_works_before_initialize() {
        let v = call(&engine(), json!({"jsonrpc": "2.0", "id": "p", "method": "ping"})).await;
        assert_eq!(v["result"]["status"], "pong");
        assert!(v["result"]["timestamp"].is_string());
        assert_eq!(v["id"], "p");
    }

    #[tokio::test]
    async fn tools_list_uses_camel_case_schema() {
        let e = initialized().await;
        let v = call(&e, json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"})).await;
        let tools = v["result"]["tools"].as_array().unwrap();
        assert_eq!(tools[0]["name"], "echo");
        assert!(tools[0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn tool_call_wraps_result_as_text() {
        let e = initialized().await;
        let v = call(
            &e,
            json!({"jsonrpc": "2.0", "id": 9, "method": "tools/call",
                   "params": {"name": "echo", "arguments": {"text": "hi"}}}),
        )
        .await;
        assert_eq!(v["result"]["isError"], false);
        let text = v["result"]["content"][0]["text"].as_str().unwrap();
        let payload: Value = serde_json::from_str(text).unwrap();
        assert_eq!(payload["text"], "hi");
    }

    #[tokio::test]
    async fn tool_failure_is_business_level() {
        let e = initialized().await;
        let v = call(
            &e,
            json!({"jsonrpc": "2.0", "id": 9, "method": "tools/call", "params": {"name": "failing"}}),
        )
        .await;
        assert!(v.get("error").is_none());
        assert_eq!(v["result"]["isError"], true);
        assert_eq!(
            v["result"]["content"][0]["text"],
            "Error executing tool: execution failed: upstream exploded"
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_not_thrown() {
        let e = initialized().await;
        let v = call(
            &e,
            json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": {"name": "nope"}}),
        )
        .await;
        assert_eq!(v["result"]["isError"], true);
        assert_eq!(v["result"]["content"][0]["text"], "Tool not found: nope");
    }

    #[tokio::test]
    async fn missing_tool_name_is_invalid_params() {
        let e = initialized().await;
        let v = call(&e, json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": {}})).await;
        assert_eq!(v["error"]["code"], rpc::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let e = initialized().await;
        let v = call(&e, json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"})).await;
        assert_eq!(v["error"]["code"], rpc::METHOD_NOT_FOUND);
        assert_eq!(v["id"], 5);
    }

    #[tokio::test]
    async fn initialized_request_gets_empty_result() {
        let v = call(&engine(), json!({"jsonrpc": "2.0", "id": 6, "method": "initialized"})).await;
        assert_eq!(v["result"], json!({}));
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let e = engine();
        let out = e
            .handle_message(&json!({"jsonrpc": "2.0", "method": "notifications/cancelled",
                                    "params": {"requestId": 12}}).to_string())
            .await;
        assert!(out.is_empty());
        let out = e
            .handle_message(&json!({"jsonrpc": "2.0", "method": "notifications/progress",
                                    "params": {"progress": 5, "total": 10}}).to_string())
            .await;
        assert!(out.is_empty());
        let out = e
            .handle_message(&json!({"jsonrpc": "2.0", "method": "notifications/whatever"}).to_string())
            .await;
        assert!(out.is_empty());
        assert_eq!(e.cancelled_requests(), vec![json!(12)]);
    }

    #[tokio::test]
    async fn server_info_reflects_state() {
        let e = engine();
        assert!(!e.server_info().initialized);
        assert!(e.server_info().session_id.starts_with("eng"));

        call(&e, json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
                        "params": {"clientInfo": {"name": "cli"}}})).await;
        let info = e.server_info();
        assert!(info.initialized);
        assert_eq!(info.tools_count, 2);
        assert_eq!(info.client_info.unwrap()["clientInfo"]["name"], "cli");
    }

    #[test]
    fn notification_is_serialized_without_id() {
        let raw = engine().create_notification("notifications/message", json!({"level": "info"}));
        let v: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["method"], "notifications/message");
        assert!(v.get("id").is_none());
    }

    #[tokio::test]
    async fn tool_metrics_are_recorded() {
        let metrics = Arc::new(MetricsRecorder::new());
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let e = ProtocolEngine::new(Arc::new(registry)).with_metrics(Arc::clone(&metrics));
        call(&e, json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"})).await;
        call(&e, json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "echo"}})).await;

        assert_eq!(
            metrics.counter_get("tool_executions_total", &[("tool", "echo"), ("status", "success")]),
            1
        );
    }
}
