use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{MatchedPath, Query, Request, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use beacon_core::SessionId;

use crate::context::AppContext;
use crate::sessions::SessionError;
use crate::webhook;

#[derive(Debug, Default, Deserialize)]
struct ConnectionQuery {
    connection_id: Option<String>,
}

impl ConnectionQuery {
    fn session_id(self) -> Option<SessionId> {
        self.connection_id
            .filter(|id| !id.trim().is_empty())
            .map(SessionId::from_raw)
    }
}

/// Build the Axum router with all routes.
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/sse", get(sse_handler))
        .route("/messages", post(messages_handler))
        .route("/health", get(health_handler))
        .route("/health/live", get(live_handler))
        .route("/health/ready", get(ready_handler))
        .route("/info", get(info_handler))
        .route("/connections", get(connections_handler))
        .route("/tools", get(tools_handler))
        .route("/metrics", get(metrics_handler))
        .route("/n8n/webhook/{webhook_id}", post(webhook::webhook_handler))
        .route("/n8n/tools", get(webhook::tools_handler))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), track_requests))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve on an already-bound listener until the context's shutdown token
/// fires. Open streams end through their own cleanup.
pub async fn serve(listener: tokio::net::TcpListener, ctx: AppContext) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    let shutdown = ctx.shutdown.clone();
    tracing::info!(%addr, "beacon server listening");
    axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

/// Bind the configured address and serve in the background.
pub async fn start(ctx: AppContext) -> Result<ServerHandle, std::io::Error> {
    start_on(&ctx.settings.bind_addr(), ctx).await
}

pub async fn start_on(addr: &str, ctx: AppContext) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let shutdown = ctx.shutdown.clone();
    let server = tokio::spawn(serve(listener, ctx));
    Ok(ServerHandle {
        addr: local_addr,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Cancel the shutdown token and wait for the listener to drain.
    pub async fn shutdown(self) -> Result<(), std::io::Error> {
        self.shutdown.cancel();
        match self.server.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    tracing::warn!(status = status.as_u16(), error = %message, "request rejected");
    (status, Json(json!({ "error": message }))).into_response()
}

async fn track_requests(State(ctx): State<AppContext>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    ctx.metrics.counter_inc(
        "http_requests_total",
        &[("method", &method), ("path", &path), ("status", &status)],
        1,
    );
    ctx.metrics.histogram_observe(
        "http_request_duration_ms",
        &[("method", &method), ("path", &path)],
        start.elapsed().as_secs_f64() * 1000.0,
    );
    response
}

async fn sse_handler(State(ctx): State<AppContext>, Query(query): Query<ConnectionQuery>) -> impl IntoResponse {
    let events = ctx
        .transport()
        .serve(query.session_id())
        .map(|event| Ok::<_, Infallible>(Event::default().event(event.name()).data(event.data())));

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
}

async fn messages_handler(
    State(ctx): State<AppContext>,
    Query(query): Query<ConnectionQuery>,
    body: String,
) -> Response {
    let Some(id) = query.session_id() else {
        return error_response(StatusCode::BAD_REQUEST, "connection_id is required");
    };
    match ctx.sessions.deliver(&id, body) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response(),
        Err(e @ SessionError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ (SessionError::Closed(_) | SessionError::QueueFull(_))) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn index_handler(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(json!({
        "name": ctx.identity.name,
        "version": ctx.identity.version,
        "description": "Control-protocol server over server-sent events",
        "endpoints": {
            "sse": "/sse",
            "messages": "/messages",
            "n8n_webhook": "/n8n/webhook/{webhook_id}",
            "n8n_tools": "/n8n/tools",
            "health": "/health",
            "metrics": "/metrics",
            "info": "/info",
        }
    }))
}

async fn health_handler(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "server": ctx.identity.name,
        "version": ctx.identity.version,
        "active_connections": ctx.sessions.count(),
        "registered_tools": ctx.registry.count(),
    }))
}

async fn live_handler() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

async fn ready_handler(State(ctx): State<AppContext>) -> Response {
    if ctx.is_shutting_down() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Not ready");
    }
    Json(json!({ "status": "ready" })).into_response()
}

async fn info_handler(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(json!({
        "server": ctx.identity,
        "connections": {
            "active": ctx.sessions.count(),
            "max": ctx.sessions.max_sessions(),
            "details": ctx.sessions.snapshot(),
        },
        "tools": ctx.registry.definitions(),
        "config": ctx.settings.summary(),
    }))
}

async fn connections_handler(State(ctx): State<AppContext>) -> impl IntoResponse {
    let connections = ctx.sessions.snapshot();
    Json(json!({
        "total": connections.len(),
        "connections": connections,
    }))
}

async fn tools_handler(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(json!({ "tools": ctx.registry.definitions() }))
}

async fn metrics_handler(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(json!({
        "report": ctx.metrics.report(),
        "upstream_retries_total": ctx.client.total_retries(),
    }))
}
