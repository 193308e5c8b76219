use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use beacon_core::UpstreamError;
use beacon_engine::{CheckSystemTool, IntentExtractor, ServerIdentity, ToolRegistry};
use beacon_telemetry::MetricsRecorder;
use beacon_upstream::{HttpTransport, ResilientClient};

use crate::sessions::SessionManager;
use crate::settings::Settings;
use crate::transport::{StreamTransport, TransportConfig};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("failed to build upstream client: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("failed to compile intent patterns: {0}")]
    Intent(#[from] regex::Error),
}

/// Everything a request handler needs, built once at startup and cloned
/// into the router.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub sessions: Arc<SessionManager>,
    pub registry: Arc<ToolRegistry>,
    pub client: Arc<ResilientClient<HttpTransport>>,
    pub metrics: Arc<MetricsRecorder>,
    pub identity: ServerIdentity,
    pub shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(settings: Settings) -> Result<Self, ContextError> {
        let transport = HttpTransport::new(settings.http_config())?;
        let client = Arc::new(ResilientClient::new(transport, settings.retry_config()));

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CheckSystemTool::new(
            Arc::clone(&client),
            IntentExtractor::new()?,
        )));

        tracing::info!(
            upstream = %settings.upstream.base_url,
            max_sessions = settings.sse.max_connections,
            tools = registry.count(),
            "application context ready"
        );

        Ok(Self {
            sessions: Arc::new(SessionManager::new(settings.sse.max_connections)),
            settings: Arc::new(settings),
            registry: Arc::new(registry),
            client,
            metrics: Arc::new(MetricsRecorder::new()),
            identity: ServerIdentity::default(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn transport(&self) -> StreamTransport {
        StreamTransport::new(
            Arc::clone(&self.sessions),
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            TransportConfig {
                heartbeat_interval: self.settings.heartbeat_interval(),
                queue_capacity: self.settings.sse.queue_capacity,
                tool_timeout: self.settings.tool_timeout(),
            },
            self.shutdown.clone(),
        )
        .with_identity(self.identity.clone())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
