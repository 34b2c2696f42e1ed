//! Prometheus metrics for peili
//!
//! Metric names follow the proxy's external contract: `requests` and
//! `failures` count the ingress side, the `endpoint_*` family counts each
//! endpoint group's upstream dispatches, and `endpoint_latency_us` tracks
//! dispatch latency in microseconds with exponential buckets that cover
//! sub-millisecond through multi-second calls.

use crate::error::{PeiliError, Result};
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramVec, TextEncoder, exponential_buckets,
    register_counter, register_counter_vec, register_gauge_vec, register_histogram_vec,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All peili metrics
pub struct Metrics {
    /// Incoming ingress requests (incremented on entry, any outcome)
    pub requests: Counter,

    /// Ingress requests rejected before fan-out
    pub failures: Counter,

    /// Upstream dispatch attempts per endpoint group
    pub endpoint_requests: CounterVec,

    /// Upstream transport failures per endpoint group
    pub endpoint_failures: CounterVec,

    /// Upstream dispatch latency in microseconds
    pub endpoint_latency_us: HistogramVec,

    /// Records pending in each durable queue (memory + disk tiers)
    pub queue_depth: GaugeVec,

    /// Records spilled from the memory tier to disk
    pub queue_spilled_records: CounterVec,

    /// Segments abandoned because of a malformed length header
    pub queue_corrupt_segments: CounterVec,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    #[allow(clippy::result_large_err)]
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            requests: register_counter!("requests", "Number of incoming requests")
                .map_err(|e| PeiliError::Metrics(format!("requests: {e}")))?,

            failures: register_counter!("failures", "Number of incoming failed requests")
                .map_err(|e| PeiliError::Metrics(format!("failures: {e}")))?,

            endpoint_requests: register_counter_vec!(
                "endpoint_requests",
                "Number of upstream requests",
                &["endpoint"]
            )
            .map_err(|e| PeiliError::Metrics(format!("endpoint_requests: {e}")))?,

            endpoint_failures: register_counter_vec!(
                "endpoint_failures",
                "Number of failed upstream requests",
                &["endpoint"]
            )
            .map_err(|e| PeiliError::Metrics(format!("endpoint_failures: {e}")))?,

            endpoint_latency_us: register_histogram_vec!(
                "endpoint_latency_us",
                "Endpoint latency distributions in microseconds",
                &["endpoint"],
                exponential_buckets(0.5, 1.3, 50)
                    .map_err(|e| PeiliError::Metrics(format!("latency buckets: {e}")))?
            )
            .map_err(|e| PeiliError::Metrics(format!("endpoint_latency_us: {e}")))?,

            queue_depth: register_gauge_vec!(
                "queue_depth",
                "Records pending in the durable queue",
                &["endpoint"]
            )
            .map_err(|e| PeiliError::Metrics(format!("queue_depth: {e}")))?,

            queue_spilled_records: register_counter_vec!(
                "queue_spilled_records_total",
                "Records spilled from memory to the on-disk log",
                &["endpoint"]
            )
            .map_err(|e| PeiliError::Metrics(format!("queue_spilled_records: {e}")))?,

            queue_corrupt_segments: register_counter_vec!(
                "queue_corrupt_segments_total",
                "Segments skipped due to structural corruption",
                &["endpoint"]
            )
            .map_err(|e| PeiliError::Metrics(format!("queue_corrupt_segments: {e}")))?,
        };

        // Set the metrics (only succeeds once)
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| PeiliError::Metrics("Failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    /// Record an upstream dispatch attempt and its latency
    pub fn record_dispatch(&self, endpoint: &str, elapsed_us: f64, ok: bool) {
        self.endpoint_requests.with_label_values(&[endpoint]).inc();
        self.endpoint_latency_us
            .with_label_values(&[endpoint])
            .observe(elapsed_us);
        if !ok {
            self.endpoint_failures.with_label_values(&[endpoint]).inc();
        }
    }

    /// Update queue depth for an endpoint group
    pub fn set_queue_depth(&self, endpoint: &str, depth: u64) {
        self.queue_depth
            .with_label_values(&[endpoint])
            .set(depth as f64);
    }

    /// Record records spilled to disk
    pub fn record_spill(&self, endpoint: &str, count: u64) {
        self.queue_spilled_records
            .with_label_values(&[endpoint])
            .inc_by(count as f64);
    }

    /// Record a segment skipped for corruption
    pub fn record_corrupt_segment(&self, endpoint: &str) {
        self.queue_corrupt_segments
            .with_label_values(&[endpoint])
            .inc();
    }
}

/// Gather all metrics and encode as Prometheus text format
///
/// Returns the metrics as a String, ready to be served via HTTP.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init_idempotent() {
        let first = Metrics::init().expect("init");
        let second = Metrics::init().expect("re-init");
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_gather_contains_contract_names() {
        let _ = Metrics::init();
        if let Some(metrics) = Metrics::get() {
            metrics.requests.inc();
            metrics.record_dispatch("a", 125.0, true);
            metrics.record_dispatch("a", 3000.0, false);
        }

        let text = gather();
        assert!(text.contains("requests"));
        assert!(text.contains("endpoint_requests"));
        assert!(text.contains("endpoint_failures"));
        assert!(text.contains("endpoint_latency_us"));
    }

    #[test]
    fn test_dispatch_failure_counts_both() {
        let metrics = Metrics::init().expect("init");

        let before_req = metrics
            .endpoint_requests
            .with_label_values(&["dispatch-test"])
            .get();
        let before_fail = metrics
            .endpoint_failures
            .with_label_values(&["dispatch-test"])
            .get();

        metrics.record_dispatch("dispatch-test", 10.0, false);

        let after_req = metrics
            .endpoint_requests
            .with_label_values(&["dispatch-test"])
            .get();
        let after_fail = metrics
            .endpoint_failures
            .with_label_values(&["dispatch-test"])
            .get();

        assert_eq!(after_req - before_req, 1.0);
        assert_eq!(after_fail - before_fail, 1.0);
    }
}
