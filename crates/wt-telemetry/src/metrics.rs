use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::RwLock;

// ---------------------------------------------------------------------------
// Metric names
// ---------------------------------------------------------------------------

/// Terminal executions, labelled by `status`.
pub const EXECUTIONS_TOTAL: &str = "executions_total";
/// Scheduled runs skipped because the concurrency budget was exhausted.
pub const SCHEDULER_DEFERRED_TOTAL: &str = "scheduler_deferred_total";
/// Data-source fetch failures, labelled by `source`.
pub const SOURCE_FAILURES_TOTAL: &str = "source_failures_total";
/// Agents moved to `error` by the health loop.
pub const AGENTS_DEMOTED_TOTAL: &str = "agents_demoted_total";
pub const RETENTION_REMOVED_TOTAL: &str = "retention_removed_total";
pub const EXECUTIONS_RUNNING: &str = "executions_running";
pub const EXECUTION_DURATION_SECONDS: &str = "execution_duration_seconds";
pub const API_REQUESTS_TOTAL: &str = "api_requests_total";
pub const API_REQUEST_DURATION_SECONDS: &str = "api_request_duration_seconds";

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// A histogram that tracks the distribution of observed values across buckets.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// f64 stored as bits.
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// HTTP request buckets (seconds).
fn request_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
}

/// Execution buckets (seconds); runs last from sub-second to the timeout.
fn execution_buckets() -> Vec<f64> {
    vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// A sorted list of key=value pairs distinguishing members of a family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    /// Format labels as `{key="value",key2="value2"}` for Prometheus output.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Counters, gauges and histograms, shared behind an `Arc` by every
/// component that records.
#[derive(Debug)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(AHashMap::new()),
            gauges: RwLock::new(AHashMap::new()),
            histograms: RwLock::new(AHashMap::new()),
        }
    }

    /// A collector with the watchtower histograms and gauges pre-registered
    /// so they show up in the first scrape.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        {
            let mut h = collector.histograms.write();
            h.insert(
                EXECUTION_DURATION_SECONDS.to_string(),
                Histogram::new(execution_buckets()),
            );
            h.insert(
                API_REQUEST_DURATION_SECONDS.to_string(),
                Histogram::new(request_buckets()),
            );
        }
        collector.set_gauge(EXECUTIONS_RUNNING, 0);
        collector
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.counters.read();
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write();
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        self.counters
            .read()
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, value: i64) {
        self.with_gauge(name, |g| g.store(value, Ordering::Relaxed));
    }

    /// Add `delta` (possibly negative) to a gauge.
    pub fn add_gauge(&self, name: &str, delta: i64) {
        self.with_gauge(name, |g| {
            g.fetch_add(delta, Ordering::Relaxed);
        });
    }

    fn with_gauge(&self, name: &str, f: impl FnOnce(&AtomicI64)) {
        {
            let map = self.gauges.read();
            if let Some(g) = map.get(name) {
                f(g);
                return;
            }
        }
        let mut map = self.gauges.write();
        f(map
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0)));
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record a value into a histogram, creating it with request buckets if
    /// it was not pre-registered.
    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = self.histograms.read();
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        let mut map = self.histograms.write();
        map.entry(name.to_string())
            .or_insert_with(|| Histogram::new(request_buckets()))
            .observe(value);
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        self.histograms
            .read()
            .get(name)
            .map(Histogram::count)
            .unwrap_or(0)
    }

    // -- Export --------------------------------------------------------------

    /// Export all metrics in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = self.counters.read();
            let mut grouped: AHashMap<&str, Vec<(&Labels, u64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                grouped
                    .entry(name.as_str())
                    .or_default()
                    .push((labels, val.load(Ordering::Relaxed)));
            }
            let mut names: Vec<&str> = grouped.keys().copied().collect();
            names.sort_unstable();
            for name in names {
                let _ = writeln!(out, "# TYPE {name} counter");
                let mut entries = grouped[name].clone();
                entries.sort_by(|a, b| a.0.prometheus_str().cmp(&b.0.prometheus_str()));
                for (labels, value) in entries {
                    let _ = writeln!(out, "{name}{} {value}", labels.prometheus_str());
                }
            }
        }

        {
            let map = self.gauges.read();
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let val = map[name].load(Ordering::Relaxed);
                let _ = writeln!(out, "# TYPE {name} gauge");
                let _ = writeln!(out, "{name} {val}");
            }
        }

        {
            let map = self.histograms.read();
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                let _ = writeln!(out, "# TYPE {name} histogram");
                for (i, boundary) in h.buckets.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "{name}_bucket{{le=\"{boundary}\"}} {}",
                        h.counts[i].load(Ordering::Relaxed)
                    );
                }
                let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", h.count());
                let _ = writeln!(out, "{name}_sum {}", h.sum());
                let _ = writeln!(out, "{name}_count {}", h.count());
            }
        }

        out
    }

    /// Export all metrics as a JSON value.
    pub fn export_json(&self) -> serde_json::Value {
        let mut counters_json = serde_json::Map::new();
        for ((name, labels), val) in self.counters.read().iter() {
            counters_json.insert(
                format!("{}{}", name, labels.prometheus_str()),
                serde_json::json!(val.load(Ordering::Relaxed)),
            );
        }

        let mut gauges_json = serde_json::Map::new();
        for (name, val) in self.gauges.read().iter() {
            gauges_json.insert(name.clone(), serde_json::json!(val.load(Ordering::Relaxed)));
        }

        let mut histograms_json = serde_json::Map::new();
        for (name, h) in self.histograms.read().iter() {
            histograms_json.insert(
                name.clone(),
                serde_json::json!({ "sum": h.sum(), "count": h.count() }),
            );
        }

        serde_json::json!({
            "counters": counters_json,
            "gauges": gauges_json,
            "histograms": histograms_json,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
