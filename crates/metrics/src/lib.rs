//! Metrics and tracing setup for repstore.
//!
//! Provides a global [`CoordinatorMetrics`] singleton backed by the
//! `prometheus` crate; the read coordinator increments these counters at
//! operation boundaries.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<CoordinatorMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static CoordinatorMetrics {
    METRICS.get_or_init(CoordinatorMetrics::new)
}

/// All Prometheus metrics for the repstore read coordinator.
pub struct CoordinatorMetrics {
    pub registry: Registry,

    // ── Read operations ──
    pub reads: IntCounterVec,
    pub read_failures: IntCounterVec,

    // ── Read latency ──
    pub read_latency_secs: HistogramVec,

    // ── Read repair ──
    pub read_repairs: IntCounter,
    pub repair_failures: IntCounter,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for CoordinatorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for read latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

impl CoordinatorMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let reads = IntCounterVec::new(
            Opts::new("repstore_reads_total", "Replicated reads, by operation"),
            &["op"],
        )
        .expect("reads counter vec");

        let read_failures = IntCounterVec::new(
            Opts::new(
                "repstore_read_failures_total",
                "Failed replicated reads, by error kind",
            ),
            &["kind"],
        )
        .expect("read_failures counter vec");

        let read_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "repstore_read_latency_seconds",
                "Replicated read latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["op"],
        )
        .expect("read_latency_secs histogram");

        let read_repairs = IntCounter::with_opts(Opts::new(
            "repstore_read_repairs_total",
            "Read repair operations triggered",
        ))
        .expect("read_repairs counter");
        let repair_failures = IntCounter::with_opts(Opts::new(
            "repstore_repair_failures_total",
            "Read repair operations that failed",
        ))
        .expect("repair_failures counter");

        // Register all metrics
        registry
            .register(Box::new(reads.clone()))
            .expect("register reads");
        registry
            .register(Box::new(read_failures.clone()))
            .expect("register read_failures");
        registry
            .register(Box::new(read_latency_secs.clone()))
            .expect("register read_latency_secs");
        registry
            .register(Box::new(read_repairs.clone()))
            .expect("register read_repairs");
        registry
            .register(Box::new(repair_failures.clone()))
            .expect("register repair_failures");

        Self {
            registry,
            reads,
            read_failures,
            read_latency_secs,
            read_repairs,
            repair_failures,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: start a read latency timer. Returns a guard that records
/// elapsed time on drop.
pub fn start_read_timer(op: &str) -> prometheus::HistogramTimer {
    metrics()
        .read_latency_secs
        .with_label_values(&[op])
        .start_timer()
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Histogram;

    #[test]
    fn test_metrics_init_and_increment() {
        let m = metrics();

        let before = m.read_repairs.get();
        m.read_repairs.inc();
        m.read_repairs.inc();
        assert_eq!(m.read_repairs.get(), before + 2);

        m.reads.with_label_values(&["get_one"]).inc();
        m.reads.with_label_values(&["get_all"]).inc();
        m.reads.with_label_values(&["exists"]).inc();
        m.read_failures.with_label_values(&["read"]).inc();
    }

    #[test]
    fn test_encode_metrics_format() {
        // Ensure at least one counter is incremented
        metrics().repair_failures.inc();

        let output = encode_metrics();
        assert!(output.contains("repstore_reads_total"));
        assert!(output.contains("repstore_repair_failures_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_histogram_records() {
        let m = metrics();

        m.read_latency_secs
            .with_label_values(&["test_op"])
            .observe(0.005);
        m.read_latency_secs
            .with_label_values(&["test_op"])
            .observe(0.010);

        let h: Histogram = m.read_latency_secs.with_label_values(&["test_op"]);
        assert_eq!(h.get_sample_count(), 2);
        assert!((h.get_sample_sum() - 0.015).abs() < 1e-9);
    }
}
