use beacon_core::tools::ToolError;

use crate::rpc::RpcError;

/// Protocol-level failures of a request. Tool failures never surface here;
/// they are reported to the client as tool output.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Server not initialized")]
    NotInitialized,

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Self::MethodNotFound(method) => RpcError::method_not_found(method),
            Self::InvalidParams(msg) => RpcError::invalid_params(msg.clone()),
            Self::NotInitialized | Self::Tool(_) | Self::Internal(_) => RpcError::internal(self),
        }
    }
}

impl From<RpcError> for EngineError {
    fn from(err: RpcError) -> Self {
        match err.code {
            crate::rpc::INVALID_PARAMS => Self::InvalidParams(err.message),
            _ => Self::Internal(err.message),
        }
    }
}
