pub mod errors;
pub mod ids;
pub mod models;
pub mod plan;
pub mod tools;

pub use errors::UpstreamError;
pub use ids::{EngineId, SessionId};
pub use models::{
    AggregationResult, HealthState, HealthStatus, LogEntry, LogPage, ServiceInfo, ServiceRoster,
    ServiceState, SystemMetrics, UserRoster, UserState, UserStatus,
};
pub use plan::{AggregationPlan, Category, LogLevel, LogQuery};
pub use tools::{Tool, ToolDefinition, ToolError};
