//! Prometheus-compatible metrics
//!
//! Counters for elections, resignations, volume transitions and liveness
//! probes, plus per-endpoint request latency histograms. Rendered as text
//! at `GET /metrics`.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 10] = [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

/// Fixed-bucket latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: &'static [f64],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: (0..=LATENCY_BUCKETS.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: &LATENCY_BUCKETS,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value (milliseconds)
    pub fn observe(&self, value_ms: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value_ms <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value_ms * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, last entry is +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            let le = self.boundaries.get(i).copied().unwrap_or(f64::INFINITY);
            result.push((le, cumulative));
        }
        result
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests_total: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    endpoints: Mutex<BTreeMap<String, Arc<EndpointMetrics>>>,

    // Election
    pub elections_won: Counter,
    pub elections_without_quorum: Counter,
    pub resignations: Counter,
    pub stale_resignations: Counter,
    pub current_term: Gauge,
    pub reachable_members: Gauge,

    // Volumes
    pub volumes_provisioned: Counter,
    pub volume_transitions: Counter,
    pub volume_destroy_busy: Counter,

    // Liveness
    pub liveness_probes: Counter,
    pub liveness_probe_failures: Counter,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(BTreeMap::new()),
            elections_won: Counter::new(),
            elections_without_quorum: Counter::new(),
            resignations: Counter::new(),
            stale_resignations: Counter::new(),
            current_term: Gauge::new(),
            reachable_members: Gauge::new(),
            volumes_provisioned: Counter::new(),
            volume_transitions: Counter::new(),
            volume_destroy_busy: Counter::new(),
            liveness_probes: Counter::new(),
            liveness_probe_failures: Counter::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for an endpoint
    pub fn endpoint(&self, path: &str) -> Arc<EndpointMetrics> {
        self.endpoints
            .lock()
            .entry(path.to_string())
            .or_default()
            .clone()
    }

    pub fn record_request(&self, path: &str, duration: Duration, success: bool) {
        let endpoint = self.endpoint(path);
        endpoint.requests_total.inc();
        endpoint.latency.observe(duration.as_secs_f64() * 1000.0);
        if !success {
            endpoint.requests_error.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 9] = [
            ("helmsman_elections_won_total", "Elections that produced a leader", &self.elections_won),
            ("helmsman_elections_without_quorum_total", "Election rounds skipped for lack of quorum", &self.elections_without_quorum),
            ("helmsman_resignations_total", "Accepted leader resignations", &self.resignations),
            ("helmsman_stale_resignations_total", "Rejected resignations naming a stale leader", &self.stale_resignations),
            ("helmsman_volumes_provisioned_total", "Physical volumes provisioned", &self.volumes_provisioned),
            ("helmsman_volume_transitions_total", "Volume state transitions", &self.volume_transitions),
            ("helmsman_volume_destroy_busy_total", "Destroy attempts refused by the storage backend", &self.volume_destroy_busy),
            ("helmsman_liveness_probes_total", "Liveness probe attempts", &self.liveness_probes),
            ("helmsman_liveness_probe_failures_total", "Failed liveness probe attempts", &self.liveness_probe_failures),
        ];
        for (name, help, counter) in counters {
            write_metric(&mut out, name, help, "counter", counter.get());
        }

        write_metric(&mut out, "helmsman_current_term", "Current election term", "gauge", self.current_term.get());
        write_metric(&mut out, "helmsman_reachable_members", "Reachable cluster members", "gauge", self.reachable_members.get());
        write_metric(&mut out, "helmsman_uptime_seconds", "Server uptime in seconds", "gauge", self.uptime_seconds());

        let endpoints = self.endpoints.lock();

        out.push_str("# HELP helmsman_endpoint_requests_total Requests per endpoint\n");
        out.push_str("# TYPE helmsman_endpoint_requests_total counter\n");
        for (path, metrics) in endpoints.iter() {
            let _ = writeln!(
                out,
                "helmsman_endpoint_requests_total{{path=\"{}\"}} {}",
                path,
                metrics.requests_total.get()
            );
        }

        out.push_str("# HELP helmsman_endpoint_errors_total Errors per endpoint\n");
        out.push_str("# TYPE helmsman_endpoint_errors_total counter\n");
        for (path, metrics) in endpoints.iter() {
            let _ = writeln!(
                out,
                "helmsman_endpoint_errors_total{{path=\"{}\"}} {}",
                path,
                metrics.requests_error.get()
            );
        }

        out.push_str("# HELP helmsman_request_duration_ms Request duration in milliseconds\n");
        out.push_str("# TYPE helmsman_request_duration_ms histogram\n");
        for (path, metrics) in endpoints.iter() {
            for (le, count) in metrics.latency.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "helmsman_request_duration_ms_bucket{{path=\"{}\",le=\"{}\"}} {}",
                    path, le, count
                );
            }
            let _ = writeln!(
                out,
                "helmsman_request_duration_ms_sum{{path=\"{}\"}} {}",
                path,
                metrics.latency.sum()
            );
            let _ = writeln!(
                out,
                "helmsman_request_duration_ms_count{{path=\"{}\"}} {}",
                path,
                metrics.latency.count()
            );
        }

        out
    }
}

fn write_metric(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
    let _ = writeln!(out, "{} {}", name, value);
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(50_000.0);

        assert_eq!(hist.count(), 3);
        let buckets = hist.get_buckets();
        assert_eq!(buckets.len(), LATENCY_BUCKETS.len() + 1);
        assert_eq!(buckets[1], (5.0, 1));
        assert_eq!(buckets.last().unwrap().1, 3);
    }

    #[test]
    fn test_metrics_registry() {
        let registry = MetricsRegistry::new();

        registry.record_request("/v2/leader", Duration::from_millis(3), true);
        registry.record_request("/v2/leader", Duration::from_millis(7), false);
        registry.elections_won.inc();
        registry.current_term.set(4);

        let endpoint = registry.endpoint("/v2/leader");
        assert_eq!(endpoint.requests_total.get(), 2);
        assert_eq!(endpoint.requests_error.get(), 1);

        let text = registry.to_prometheus();
        assert!(text.contains("helmsman_elections_won_total 1"));
        assert!(text.contains("helmsman_current_term 4"));
        assert!(text.contains("helmsman_endpoint_requests_total{path=\"/v2/leader\"} 2"));
    }
}
