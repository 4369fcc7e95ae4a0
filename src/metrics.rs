use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus exporter and register all relay metrics.
/// Returns a `PrometheusHandle` whose `render()` method produces the
/// text/plain Prometheus scrape payload.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;

    register_metrics();
    Ok(handle)
}

/// Build a recorder without installing it globally, for tests.
pub fn test_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

fn register_metrics() {
    // Pre-register counters so they appear even before the first increment.
    counter!("signals_observed_total").absolute(0);
    counter!("signals_duplicate_total").absolute(0);
    counter!("signals_malformed_total").absolute(0);
    counter!("orders_mirrored_total").absolute(0);
    counter!("orders_failed_total").absolute(0);
    counter!("mirrors_skipped_total").absolute(0);
    counter!("position_closes_mirrored_total").absolute(0);
    counter!("connector_reconnects_total").absolute(0);
    counter!("auth_failures_total").absolute(0);

    gauge!("execution_queue_depth").set(0.0);

    // Histogram is lazily created on first record; force creation.
    histogram!("order_placement_seconds").record(0.0);
}
