//! Stand-in for the upstream data service: five read endpoints with fixed
//! rosters and randomised logs and metrics.

pub mod data;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use beacon_core::models::paths;
use beacon_core::LogQuery;

#[derive(Clone, Debug, Default)]
pub struct MockConfig {
    /// Report every service as running so health is always `healthy`.
    pub healthy_only: bool,
}

#[derive(Clone)]
struct MockState {
    config: Arc<MockConfig>,
}

pub fn build_router(config: MockConfig) -> Router {
    let state = MockState {
        config: Arc::new(config),
    };
    Router::new()
        .route("/", get(index))
        .route("/health", get(liveness))
        .route(paths::HEALTH, get(system_health))
        .route(paths::USERS, get(users))
        .route(paths::SERVICES, get(services))
        .route(paths::LOGS, post(query_logs))
        .route(paths::METRICS, get(metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    config: MockConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, healthy_only = config.healthy_only, "mock upstream listening");
    axum::serve(listener, build_router(config))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Bind `addr` and serve in the background. Returns a handle to find the port.
pub async fn start(addr: &str, config: MockConfig) -> Result<MockHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        if let Err(e) = serve(listener, config, std::future::pending()).await {
            tracing::error!(error = %e, "mock upstream stopped");
        }
    });
    Ok(MockHandle {
        addr: local_addr,
        server,
    })
}

/// Running mock upstream. Dropping the handle aborts the server task.
pub struct MockHandle {
    pub addr: SocketAddr,
    server: tokio::task::JoinHandle<()>,
}

impl MockHandle {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn index() -> impl IntoResponse {
    Json(json!({
        "name": "beacon mock upstream",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": paths::HEALTH,
            "users": paths::USERS,
            "services": paths::SERVICES,
            "logs": paths::LOGS,
            "metrics": paths::METRICS,
        }
    }))
}

async fn liveness() -> impl IntoResponse {
    Json(json!({"status": "healthy", "service": "mock-upstream"}))
}

async fn system_health(State(state): State<MockState>) -> impl IntoResponse {
    Json(data::health(state.config.healthy_only))
}

async fn users() -> impl IntoResponse {
    Json(data::user_roster())
}

async fn services(State(state): State<MockState>) -> impl IntoResponse {
    Json(data::service_roster(state.config.healthy_only))
}

async fn query_logs(Json(query): Json<LogQuery>) -> impl IntoResponse {
    Json(data::query_logs(&query))
}

async fn metrics() -> impl IntoResponse {
    Json(data::metrics())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    async fn running(healthy_only: bool) -> MockHandle {
        start("127.0.0.1:0", MockConfig { healthy_only }).await.unwrap()
    }

    async fn get_json(url: String) -> Value {
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200, "{url}");
        resp.json().await.unwrap()
    }

    #[tokio::test]
    async fn serves_every_endpoint() {
        let mock = running(false).await;
        let base = mock.base_url();

        let index = get_json(format!("{base}/")).await;
        assert_eq!(index["endpoints"]["logs"], paths::LOGS);

        let live = get_json(format!("{base}/health")).await;
        assert_eq!(live["status"], "healthy");

        let health = get_json(format!("{base}{}", paths::HEALTH)).await;
        assert_eq!(health["status"], "degraded");

        let users = get_json(format!("{base}{}", paths::USERS)).await;
        assert_eq!(users["total"], 5);

        let services = get_json(format!("{base}{}", paths::SERVICES)).await;
        assert_eq!(services["running"], 4);

        let metrics = get_json(format!("{base}{}", paths::METRICS)).await;
        assert!(metrics["cpu_usage"].is_number());
    }

    #[tokio::test]
    async fn healthy_only_reports_healthy() {
        let mock = running(true).await;
        let health = get_json(format!("{}{}", mock.base_url(), paths::HEALTH)).await;
        assert_eq!(health["status"], "healthy");
    }

    #[tokio::test]
    async fn log_query_honours_limit_and_defaults() {
        let mock = running(false).await;
        let client = reqwest::Client::new();
        let url = format!("{}{}", mock.base_url(), paths::LOGS);

        let page: Value = client
            .post(&url)
            .json(&json!({"timeframe": "24h", "limit": 30}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(page["total"], 30);
        assert_eq!(page["timeframe"], "24h");

        let page: Value = client
            .post(&url)
            .json(&json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(page["total"], 20);
        assert_eq!(page["timeframe"], "1h");
    }

    #[tokio::test]
    async fn invalid_log_level_is_rejected() {
        let mock = running(false).await;
        let resp = reqwest::Client::new()
            .post(format!("{}{}", mock.base_url(), paths::LOGS))
            .json(&json!({"level": "loud"}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }
}
