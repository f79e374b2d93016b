use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};
use std::sync::LazyLock;

// --- Request Metrics ---

/// Total number of requests forwarded per domain.
///
/// Counts only requests that reached an upstream and completed successfully.
/// Example Prometheus query: `rate(lb_requests_total{domain="..."}[5m])`.
pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "lb_requests_total",
        "Total number of successfully forwarded requests per domain",
        &["domain"]
    )
    .unwrap()
});

/// Total number of failed forwarding attempts per domain.
///
/// Covers upstream timeouts and connection/IO errors; routing failures
/// (missing Host, unknown domain, no healthy upstream) are counted separately.
pub static REQUESTS_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "lb_requests_failed_total",
        "Total number of failed forwarding attempts per domain",
        &["domain"]
    )
    .unwrap()
});

/// Total number of requests rejected before reaching any upstream, by reason.
pub static REQUESTS_REJECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "lb_requests_rejected_total",
        "Total number of requests rejected before forwarding, per reason",
        &["reason"]
    )
    .unwrap()
});

// --- Upstream State Metrics ---

/// Number of currently healthy upstream servers across all groups.
pub static HEALTHY_SERVERS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("lb_healthy_servers", "Number of currently healthy upstream servers")
        .unwrap()
});

/// Total number of configured upstream servers. Set once at startup.
pub static TOTAL_SERVERS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("lb_total_servers", "Total number of configured upstream servers").unwrap()
});

/// Total number of failed health probes per server.
///
/// Example query: `rate(lb_probe_failed_total{server="..."}[5m])`.
pub static PROBE_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "lb_probe_failed_total",
        "Total number of failed health probes per server",
        &["server"]
    )
    .unwrap()
});

// --- Latency Metrics ---

/// Histogram of forwarded request durations in seconds per domain.
///
/// Measured from upstream connect-start until the response is fully read.
/// Example query:
/// `histogram_quantile(0.95, sum(rate(lb_forward_duration_seconds_bucket[5m])) by (le))`.
pub static FORWARD_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "lb_forward_duration_seconds",
        "Histogram of forwarded request duration in seconds per domain",
        &["domain"],
        vec![0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0]
    )
    .unwrap()
});
