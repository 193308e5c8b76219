use std::time::Duration;

/// Typed error hierarchy for calls against the upstream data service.
/// Only transport-level failures are worth another attempt; an HTTP status
/// from the service is an answer, not a transient condition.
#[derive(Clone, Debug, thiserror::Error)]
pub enum UpstreamError {
    // Final: the service answered
    #[error("API error {status}: {message}")]
    Api {
        status: u16,
        message: String,
        body: Option<serde_json::Value>,
    },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Transient
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // Operational
    #[error("cancelled")]
    Cancelled,
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    /// HTTP status carried by an application-level failure.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Api { status, .. } if *status < 500 => "client_error",
            Self::Api { .. } => "server_error",
            Self::Decode(_) => "decode",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Build an API error from a non-2xx status and the raw response body.
    /// The body is kept as structured JSON when it parses.
    pub fn from_status(status: u16, reason: &str, raw_body: &str) -> Self {
        let body = serde_json::from_str::<serde_json::Value>(raw_body).ok();
        Self::Api {
            status,
            message: format!("Request failed: {reason}"),
            body,
        }
    }
}
