//! Prometheus metrics for the telemetry operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `telemetry_reconcile_duration_seconds` (histogram): pass duration labeled by worker.
//! - `telemetry_reconcile_errors_total` (counter): failed passes labeled by worker and error kind.
//! - `telemetry_pipelines` (gauge): pipelines per signal, labeled by usable/unusable.
//! - `telemetry_generated_config_bytes` (gauge): size of the rendered gateway and agent documents.
//! - `telemetry_flow_health_evaluations_total` (counter): self-monitor results by signal and reason.
//! - `telemetry_scrape_failures_total` (counter): failed scrapes of collector metrics.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Worker name, e.g. "log" or "telemetry"
    pub worker: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub worker: String,
    /// Error kind/category, e.g. "kube", "synthesis"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PipelineLabels {
    pub signal: String,
    /// "usable" or "unusable"
    pub state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DocumentLabels {
    pub signal: String,
    /// "gateway" or "agent"
    pub component: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FlowLabels {
    pub signal: String,
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SignalLabels {
    pub signal: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking pipelines per signal and usability
pub static PIPELINES: Lazy<Family<PipelineLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Gauge tracking the size of each rendered collector document
pub static GENERATED_CONFIG_BYTES: Lazy<Family<DocumentLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Counter tracking self-monitor evaluations per outcome
pub static FLOW_HEALTH_EVALUATIONS_TOTAL: Lazy<Family<FlowLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking failed scrapes of collector metrics
pub static SCRAPE_FAILURES_TOTAL: Lazy<Family<SignalLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "telemetry_reconcile_duration_seconds",
        "Duration of reconcile passes in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "telemetry_reconcile_errors_total",
        "Total number of failed reconcile passes",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "telemetry_pipelines",
        "Number of pipelines per signal by usability",
        PIPELINES.clone(),
    );
    registry.register(
        "telemetry_generated_config_bytes",
        "Size of the rendered collector configuration",
        GENERATED_CONFIG_BYTES.clone(),
    );
    registry.register(
        "telemetry_flow_health_evaluations_total",
        "Self-monitor evaluations by signal and resulting reason",
        FLOW_HEALTH_EVALUATIONS_TOTAL.clone(),
    );
    registry.register(
        "telemetry_scrape_failures_total",
        "Failed scrapes of collector self-metrics",
        SCRAPE_FAILURES_TOTAL.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(worker: &str, seconds: f64) {
    let labels = ReconcileLabels {
        worker: worker.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(worker: &str, kind: &str) {
    let labels = ErrorLabels {
        worker: worker.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

/// Record the outcome of a classification pass
pub fn set_pipeline_counts(signal: &str, usable: usize, unusable: usize) {
    for (state, count) in [("usable", usable), ("unusable", unusable)] {
        let labels = PipelineLabels {
            signal: signal.to_string(),
            state: state.to_string(),
        };
        PIPELINES.get_or_create(&labels).set(count as i64);
    }
}

pub fn set_generated_config_bytes(signal: &str, component: &str, bytes: usize) {
    let labels = DocumentLabels {
        signal: signal.to_string(),
        component: component.to_string(),
    };
    GENERATED_CONFIG_BYTES
        .get_or_create(&labels)
        .set(bytes as i64);
}

pub fn inc_flow_health_evaluation(signal: &str, reason: &str) {
    let labels = FlowLabels {
        signal: signal.to_string(),
        reason: reason.to_string(),
    };
    FLOW_HEALTH_EVALUATIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_scrape_failure(signal: &str) {
    let labels = SignalLabels {
        signal: signal.to_string(),
    };
    SCRAPE_FAILURES_TOTAL.get_or_create(&labels).inc();
}
