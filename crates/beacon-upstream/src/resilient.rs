use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, warn};

use beacon_core::models::paths;
use beacon_core::{
    HealthStatus, LogEntry, LogPage, LogQuery, ServiceInfo, ServiceRoster, SystemMetrics,
    UpstreamError, UserRoster, UserStatus,
};

use crate::transport::{UpstreamRequest, UpstreamTransport};

/// Retry policy for transient upstream failures.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Fraction of the computed delay added or removed at random.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Delay after the `failures`-th failed attempt (1-based).
    /// Doubles from `min_backoff` and never leaves `[min_backoff, max_backoff]`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let min_ms = self.min_backoff.as_millis() as f64;
        let max_ms = (self.max_backoff.as_millis() as f64).max(min_ms);
        let exp = min_ms * 2f64.powi(failures.saturating_sub(1).min(30) as i32);
        let base = exp.clamp(min_ms, max_ms);

        let spread = base * self.jitter_factor.clamp(0.0, 1.0);
        let jittered = if spread > 0.0 {
            base + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            base
        };
        Duration::from_millis(jittered.clamp(min_ms, max_ms) as u64)
    }
}

/// Upstream client that retries transient failures with exponential backoff.
///
/// HTTP status errors are final and returned after exactly one attempt.
/// The transport is shared by every concurrent caller; no external locking.
pub struct ResilientClient<T: UpstreamTransport> {
    transport: T,
    retry: RetryConfig,
    total_retries: AtomicU64,
}

impl<T: UpstreamTransport> ResilientClient<T> {
    pub fn new(transport: T, retry: RetryConfig) -> Self {
        Self {
            transport,
            retry,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(transport: T) -> Self {
        Self::new(transport, RetryConfig::default())
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub async fn request(&self, request: &UpstreamRequest) -> Result<Value, UpstreamError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transport.send(request).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(path = %request.path, attempt, "upstream call recovered");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        path = %request.path,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying upstream call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        method = %request.method,
                        path = %request.path,
                        attempt,
                        kind = err.error_kind(),
                        error = %err,
                        "upstream call failed"
                    );
                    return Err(err);
                }
            }
        }
    }

    pub async fn request_as<D: DeserializeOwned>(
        &self,
        request: &UpstreamRequest,
    ) -> Result<D, UpstreamError> {
        let value = self.request(request).await?;
        serde_json::from_value(value).map_err(|e| UpstreamError::Decode(e.to_string()))
    }

    pub async fn check_health(&self) -> Result<HealthStatus, UpstreamError> {
        self.request_as(&UpstreamRequest::get(paths::HEALTH)).await
    }

    pub async fn user_status(&self) -> Result<Vec<UserStatus>, UpstreamError> {
        let roster: UserRoster = self.request_as(&UpstreamRequest::get(paths::USERS)).await?;
        Ok(roster.users)
    }

    pub async fn services(&self) -> Result<Vec<ServiceInfo>, UpstreamError> {
        let roster: ServiceRoster = self
            .request_as(&UpstreamRequest::get(paths::SERVICES))
            .await?;
        Ok(roster.services)
    }

    pub async fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, UpstreamError> {
        let body = serde_json::to_value(query)
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;
        let page: LogPage = self
            .request_as(&UpstreamRequest::post(paths::LOGS, body))
            .await?;
        Ok(page.logs)
    }

    pub async fn metrics(&self) -> Result<SystemMetrics, UpstreamError> {
        self.request_as(&UpstreamRequest::get(paths::METRICS)).await
    }
}
