use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Observations kept per histogram series; older samples are evicted first.
const HISTOGRAM_WINDOW: usize = 4096;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Default)]
struct Counter(AtomicU64);

impl Counter {
    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// f64 stored as raw bits so it can live in an atomic.
#[derive(Default)]
struct Gauge(AtomicU64);

impl Gauge {
    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
    fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Default)]
struct Histogram {
    window: Mutex<VecDeque<f64>>,
    total_count: AtomicU64,
}

impl Histogram {
    fn observe(&self, value: f64) {
        let mut window = self.window.lock();
        if window.len() == HISTOGRAM_WINDOW {
            window.pop_front();
        }
        window.push_back(value);
        self.total_count.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.window.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let rank = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
        HistogramSummary {
            count: self.total_count.load(Ordering::Relaxed),
            sum: sorted.iter().sum(),
            min: sorted[0],
            max: sorted[n - 1],
            p50: rank(0.50),
            p95: rank(0.95),
            p99: rank(0.99),
        }
    }
}

/// Percentiles over the retained observation window. `count` is lifetime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Name plus label set, labels sorted so their order at the call site is irrelevant.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        labels.sort();
        Self {
            name: name.to_owned(),
            labels,
        }
    }

    fn label_map(&self) -> HashMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

/// Series table for one metric kind. Reads take the shared lock; the
/// exclusive lock is only taken the first time a series is seen.
struct Family<T> {
    series: RwLock<HashMap<SeriesKey, T>>,
}

impl<T: Default> Family<T> {
    fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }

    fn with<R>(&self, key: SeriesKey, f: impl FnOnce(&T) -> R) -> R {
        if let Some(existing) = self.series.read().get(&key) {
            return f(existing);
        }
        let mut series = self.series.write();
        f(series.entry(key).or_default())
    }

    fn peek<R>(&self, key: &SeriesKey, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.series.read().get(key).map(f)
    }
}

/// One series in a [`MetricsReport`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub labels: HashMap<String, String>,
    pub metric_type: MetricType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub summary: Option<HistogramSummary>,
}

/// Point-in-time copy of every series, served by the diagnostics endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsReport {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub metrics: Vec<MetricSample>,
}

/// Thread-safe in-memory metrics recorder.
pub struct MetricsRecorder {
    counters: Family<Counter>,
    gauges: Family<Gauge>,
    histograms: Family<Histogram>,
    started_at: DateTime<Utc>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            counters: Family::new(),
            gauges: Family::new(),
            histograms: Family::new(),
            started_at: Utc::now(),
        }
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.counters.with(SeriesKey::new(name, labels), |c| c.add(n));
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges.with(SeriesKey::new(name, labels), |g| g.set(value));
    }

    /// Move a gauge by `delta` (negative to decrement).
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        self.gauges.with(SeriesKey::new(name, labels), |g| g.add(delta));
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms
            .with(SeriesKey::new(name, labels), |h| h.observe(value));
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .peek(&SeriesKey::new(name, labels), Counter::get)
            .unwrap_or(0)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .peek(&SeriesKey::new(name, labels), Gauge::get)
            .unwrap_or(0.0)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .peek(&SeriesKey::new(name, labels), Histogram::summary)
            .unwrap_or_default()
    }

    /// Copy every series, sorted by name then labels.
    pub fn report(&self) -> MetricsReport {
        let mut metrics = Vec::new();

        for (key, c) in self.counters.series.read().iter() {
            metrics.push(sample(key, MetricType::Counter, Some(c.get() as f64), None));
        }
        for (key, g) in self.gauges.series.read().iter() {
            metrics.push(sample(key, MetricType::Gauge, Some(g.get()), None));
        }
        for (key, h) in self.histograms.series.read().iter() {
            metrics.push(sample(key, MetricType::Histogram, None, Some(h.summary())));
        }

        metrics.sort_by(|a, b| {
            a.name.cmp(&b.name).then_with(|| {
                let mut la: Vec<_> = a.labels.iter().collect();
                let mut lb: Vec<_> = b.labels.iter().collect();
                la.sort();
                lb.sort();
                la.cmp(&lb)
            })
        });

        let now = Utc::now();
        MetricsReport {
            timestamp: now,
            uptime_seconds: (now - self.started_at).num_seconds().max(0) as u64,
            metrics,
        }
    }
}

fn sample(
    key: &SeriesKey,
    metric_type: MetricType,
    value: Option<f64>,
    summary: Option<HistogramSummary>,
) -> MetricSample {
    MetricSample {
        name: key.name.clone(),
        labels: key.label_map(),
        metric_type,
        value,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_are_per_label_set() {
        let m = MetricsRecorder::new();
        m.counter_inc("http_requests_total", &[("method", "GET")], 1);
        m.counter_inc("http_requests_total", &[("method", "GET")], 1);
        m.counter_inc("http_requests_total", &[("method", "POST")], 1);

        assert_eq!(m.counter_get("http_requests_total", &[("method", "GET")]), 2);
        assert_eq!(m.counter_get("http_requests_total", &[("method", "POST")]), 1);
        assert_eq!(m.counter_get("http_requests_total", &[("method", "PUT")]), 0);
    }

    #[test]
    fn gauge_moves_both_ways() {
        let m = MetricsRecorder::new();
        m.gauge_set("sse_connections_active", &[], 10.0);
        m.gauge_inc("sse_connections_active", &[], 5.0);
        m.gauge_inc("sse_connections_active", &[], -3.0);
        assert_eq!(m.gauge_get("sse_connections_active", &[]), 12.0);
    }

    #[test]
    fn gauge_can_go_negative() {
        let m = MetricsRecorder::new();
        m.gauge_inc("drift", &[], -2.5);
        assert_eq!(m.gauge_get("drift", &[]), -2.5);
    }

    #[test]
    fn histogram_percentiles() {
        let m = MetricsRecorder::new();
        let labels = &[("tool", "check_system")];
        for v in 1..=10 {
            m.histogram_observe("tool_duration_ms", labels, f64::from(v) * 10.0);
        }
        let s = m.histogram_summary("tool_duration_ms", labels);
        assert_eq!(s.count, 10);
        assert_eq!(s.sum, 550.0);
        assert_eq!(s.min, 10.0);
        assert_eq!(s.max, 100.0);
        assert!(s.p50 >= 50.0 && s.p50 <= 60.0);
        assert!(s.p95 >= 90.0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let m = MetricsRecorder::new();
        for _ in 0..(HISTOGRAM_WINDOW + 10) {
            m.histogram_observe("h", &[], 1.0);
        }
        let s = m.histogram_summary("h", &[]);
        assert_eq!(s.count, (HISTOGRAM_WINDOW + 10) as u64);
        assert_eq!(s.sum, HISTOGRAM_WINDOW as f64);
    }

    #[test]
    fn missing_histogram_is_empty() {
        let s = MetricsRecorder::new().histogram_summary("nope", &[]);
        assert_eq!(s, HistogramSummary::default());
    }

    #[test]
    fn label_order_does_not_matter() {
        let m = MetricsRecorder::new();
        m.counter_inc("t", &[("a", "1"), ("b", "2")], 1);
        m.counter_inc("t", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(m.counter_get("t", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn report_contains_every_series_sorted() {
        let m = MetricsRecorder::new();
        m.counter_inc("b_total", &[], 3);
        m.gauge_set("a_active", &[], 1.0);
        m.histogram_observe("c_ms", &[("path", "/sse")], 12.0);

        let report = m.report();
        let names: Vec<_> = report.metrics.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a_active", "b_total", "c_ms"]);
        assert_eq!(report.metrics[1].value, Some(3.0));
        assert_eq!(report.metrics[2].summary.as_ref().unwrap().count, 1);
        assert_eq!(report.metrics[2].labels["path"], "/sse");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["metrics"][0]["metric_type"], "gauge");
        assert!(json["metrics"][0].get("labels").is_none());
    }

    #[test]
    fn concurrent_counter_increments() {
        let m = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.counter_inc("concurrent", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.counter_get("concurrent", &[]), 10_000);
    }
}
