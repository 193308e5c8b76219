use std::future::Future;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use beacon_core::{AggregationPlan, AggregationResult, Category, UpstreamError};

use crate::resilient::ResilientClient;
use crate::transport::UpstreamTransport;

/// Await `fut` only when its category was requested. Unrequested futures are
/// dropped unpolled, so no call is issued for them.
async fn when<V>(
    requested: bool,
    fut: impl Future<Output = Result<V, UpstreamError>>,
) -> Option<Result<V, UpstreamError>> {
    if requested {
        Some(fut.await)
    } else {
        None
    }
}

fn settle<V>(
    errors: &mut Vec<String>,
    category: Category,
    outcome: Option<Result<V, UpstreamError>>,
) -> Option<V> {
    match outcome? {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(category = %category, kind = err.error_kind(), error = %err, "category failed");
            errors.push(format!("{category}: {err}"));
            None
        }
    }
}

impl<T: UpstreamTransport> ResilientClient<T> {
    /// Issue every requested category concurrently and wait for all of them.
    ///
    /// A failing category never cancels the others: it is recorded in
    /// `errors` and its field stays `None`. Logs come back newest first,
    /// capped at the query limit.
    pub async fn aggregate(&self, plan: &AggregationPlan) -> AggregationResult {
        let started = Instant::now();
        let query = plan.log_query.clone().clamped();
        let categories = plan.categories();
        info!(?categories, "upstream fan-out started");

        let (health, users, services, logs, metrics) = tokio::join!(
            when(plan.health, self.check_health()),
            when(plan.users, self.user_status()),
            when(plan.services, self.services()),
            when(plan.logs, self.query_logs(&query)),
            when(plan.metrics, self.metrics()),
        );

        let mut errors = Vec::new();
        let health = settle(&mut errors, Category::Health, health);
        let users = settle(&mut errors, Category::Users, users);
        let services = settle(&mut errors, Category::Services, services);
        let mut logs = settle(&mut errors, Category::Logs, logs);
        let metrics = settle(&mut errors, Category::Metrics, metrics);

        if let Some(entries) = logs.as_mut() {
            entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            entries.truncate(query.limit as usize);
        }

        let execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            requested = categories.len(),
            failed = errors.len(),
            elapsed_ms = execution_time_ms,
            "upstream fan-out finished"
        );

        AggregationResult {
            health,
            users,
            services,
            logs,
            metrics,
            errors,
            execution_time_ms,
            timestamp: Utc::now(),
        }
    }
}
