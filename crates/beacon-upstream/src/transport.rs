use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, Url};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use beacon_core::UpstreamError;

const USER_AGENT: &str = concat!("beacon/", env!("CARGO_PKG_VERSION"));

/// One call against the upstream service, relative to its base URL.
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl UpstreamRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
        }
    }
}

/// A single attempt at an upstream call. Implementations never retry.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    fn base_url(&self) -> &str;

    async fn send(&self, request: &UpstreamRequest) -> Result<Value, UpstreamError>;
}

#[async_trait]
impl<T: UpstreamTransport + ?Sized> UpstreamTransport for Arc<T> {
    fn base_url(&self) -> &str {
        (**self).base_url()
    }

    async fn send(&self, request: &UpstreamRequest) -> Result<Value, UpstreamError> {
        (**self).send(request).await
    }
}

/// Connection caps shared by every concurrent caller.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_per_host: usize,
    /// How long an idle pooled connection (and its resolved address) is reused.
    pub idle_ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_per_host: 30,
            idle_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub base_url: String,
    /// Sent as a bearer token when non-empty.
    pub api_key: Option<String>,
    /// Total time budget for one attempt.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub pool: PoolConfig,
}

impl HttpConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool: PoolConfig::default(),
        }
    }
}

/// reqwest-backed transport with bounded total and per-host concurrency.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    timeout: Duration,
    total_permits: Semaphore,
    per_host: DashMap<String, Arc<Semaphore>>,
    max_per_host: usize,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Result<Self, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| UpstreamError::InvalidRequest(format!("invalid api key: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool.max_per_host)
            .pool_idle_timeout(config.pool.idle_ttl)
            .build()
            .map_err(|e| UpstreamError::InvalidRequest(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
            total_permits: Semaphore::new(config.pool.max_connections.max(1)),
            per_host: DashMap::new(),
            max_per_host: config.pool.max_per_host.max(1),
        })
    }

    fn host_permits(&self, url: &Url) -> Arc<Semaphore> {
        let host = format!(
            "{}:{}",
            url.host_str().unwrap_or_default(),
            url.port_or_known_default().unwrap_or_default()
        );
        self.per_host
            .entry(host)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host)))
            .clone()
    }

    fn map_send_error(&self, err: reqwest::Error) -> UpstreamError {
        if err.is_timeout() {
            UpstreamError::Timeout(self.timeout)
        } else if err.is_builder() {
            UpstreamError::InvalidRequest(err.to_string())
        } else {
            UpstreamError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn send(&self, request: &UpstreamRequest) -> Result<Value, UpstreamError> {
        let url = Url::parse(&format!("{}{}", self.base_url, request.path))
            .map_err(|e| UpstreamError::InvalidRequest(format!("bad url: {e}")))?;

        let _total = self
            .total_permits
            .acquire()
            .await
            .map_err(|_| UpstreamError::Cancelled)?;
        let host = self.host_permits(&url);
        let _host = host.acquire().await.map_err(|_| UpstreamError::Cancelled)?;

        let mut builder = self.client.request(request.method.clone(), url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| self.map_send_error(e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.map_send_error(e))?;

        if !status.is_success() {
            return Err(UpstreamError::from_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown"),
                &text,
            ));
        }

        debug!(status = status.as_u16(), bytes = text.len(), "upstream response");

        if text.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&text).map_err(|e| UpstreamError::Decode(e.to_string()))
    }
}
