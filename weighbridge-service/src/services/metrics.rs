//! Prometheus metrics for weighbridge-service.
//!
//! Domain counters live in the default `prometheus` registry. HTTP request metrics are
//! recorded by `service_core`'s middleware through the `metrics` facade and rendered by
//! the installed exporter handle; [`get_metrics`] concatenates both.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Transactions created, by outcome (`created`, `replayed`).
pub static TRANSACTIONS_CREATED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "weighbridge_transactions_created_total",
        "Create-transaction calls by outcome",
        &["outcome"]
    )
    .expect("Failed to register transactions_created_total")
});

/// Completion calls by outcome (`completed`, `replayed`, `conflict`).
pub static TRANSACTIONS_COMPLETED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "weighbridge_transactions_completed_total",
        "Complete-transaction calls by outcome",
        &["outcome"]
    )
    .expect("Failed to register transactions_completed_total")
});

/// Invoices inserted, or joined from a concurrent writer.
pub static INVOICES_ISSUED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "weighbridge_invoices_issued_total",
        "Invoices issued by outcome",
        &["outcome"]
    )
    .expect("Failed to register invoices_issued_total")
});

/// Payment webhook deliveries by outcome (`applied`, `replayed`, `ignored`).
pub static PAYMENTS_APPLIED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "weighbridge_payments_total",
        "Payment webhook deliveries by outcome",
        &["outcome"]
    )
    .expect("Failed to register payments_total")
});

/// Requests answered from an earlier result instead of mutating state.
pub static IDEMPOTENT_REPLAYS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "weighbridge_idempotent_replays_total",
        "Idempotent replays by endpoint",
        &["endpoint"]
    )
    .expect("Failed to register idempotent_replays_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "weighbridge_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

static HTTP_METRICS: OnceCell<Option<PrometheusHandle>> = OnceCell::new();

/// Initialize all metrics (forces lazy initialization) and install the HTTP recorder.
pub fn init_metrics() {
    Lazy::force(&TRANSACTIONS_CREATED);
    Lazy::force(&TRANSACTIONS_COMPLETED);
    Lazy::force(&INVOICES_ISSUED);
    Lazy::force(&PAYMENTS_APPLIED);
    Lazy::force(&IDEMPOTENT_REPLAYS);
    Lazy::force(&DB_QUERY_DURATION);

    HTTP_METRICS.get_or_init(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "HTTP metrics recorder not installed");
            None
        }
    });
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut out = encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default();

    if let Some(Some(handle)) = HTTP_METRICS.get() {
        out.push_str(&handle.render());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_output_contains_domain_counters() {
        init_metrics();
        TRANSACTIONS_CREATED.with_label_values(&["created"]).inc();
        let text = get_metrics();
        assert!(text.contains("weighbridge_transactions_created_total"));
    }
}
