pub mod system_check;

use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tracing::{error, info, warn};

use beacon_core::tools::{Tool, ToolError};
use beacon_telemetry::MetricsRecorder;

pub use system_check::CheckSystemTool;

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Run one tool invocation under a deadline. Panics and timeouts are folded
/// into `ToolError` so callers only ever see a result.
pub async fn invoke(
    tool: &dyn Tool,
    args: Value,
    timeout: Duration,
    metrics: Option<&MetricsRecorder>,
) -> Result<Value, ToolError> {
    let name = tool.name().to_string();
    let start = Instant::now();
    let outcome = tokio::time::timeout(
        timeout,
        std::panic::AssertUnwindSafe(tool.execute(args)).catch_unwind(),
    )
    .await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => {
            let msg = panic_message(&panic);
            error!(tool = %name, panic = %msg, "tool panicked during execution");
            Err(ToolError::ExecutionFailed("tool crashed".into()))
        }
        Err(_) => {
            warn!(tool = %name, timeout_secs = timeout.as_secs(), "tool timed out");
            Err(ToolError::Timeout(timeout))
        }
    };

    let status = if result.is_ok() { "success" } else { "error" };
    match &result {
        Ok(_) => info!(tool = %name, elapsed_ms, "tool completed"),
        Err(e) => warn!(tool = %name, elapsed_ms, error = %e, "tool failed"),
    }
    if let Some(metrics) = metrics {
        metrics.counter_inc("tool_executions_total", &[("tool", &name), ("status", status)], 1);
        metrics.histogram_observe("tool_execution_duration_ms", &[("tool", &name)], elapsed_ms);
    }
    result
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
