pub mod error;
pub mod intent;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod tools;

pub use error::EngineError;
pub use intent::{IntentExtractor, ParsedIntent};
pub use protocol::{EngineInfo, ProtocolEngine, ServerIdentity, PROTOCOL_VERSION};
pub use registry::ToolRegistry;
pub use rpc::{RpcError, RpcNotification, RpcResponse};
pub use tools::{invoke, CheckSystemTool, DEFAULT_TOOL_TIMEOUT};
