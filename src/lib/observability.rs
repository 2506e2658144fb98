use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::error::{ReadHistoryError, Result};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Installs the global Prometheus recorder. Safe to call more than once.
pub fn init() -> Result<()> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("readdbx_store_operation_duration_seconds".into()),
            &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0],
        )
        .map_err(|err| {
            ReadHistoryError::Config(format!("failed to configure prometheus exporter: {err}"))
        })?;
    let handle = builder.install_recorder().map_err(|err| {
        ReadHistoryError::Config(format!("failed to initialise prometheus recorder: {err}"))
    })?;

    describe_counter!(
        "readdbx_store_operations_total",
        "Total number of operations executed by the record store."
    );
    describe_histogram!(
        "readdbx_store_operation_duration_seconds",
        "Duration of operations executed by the record store."
    );
    describe_counter!(
        "readdbx_events_applied_total",
        "Read-history events applied to primary records, by kind and outcome."
    );
    describe_counter!(
        "readdbx_index_mutations_total",
        "Index entries written or removed by the projection engine."
    );
    describe_counter!(
        "readdbx_counter_updates_total",
        "Aggregate counter rows updated, by strategy."
    );
    describe_counter!(
        "readdbx_query_events_total",
        "Added, updated and removed events emitted by live range queries."
    );
    describe_counter!(
        "readdbx_notifications_total",
        "Reminder checks processed, by channel and outcome."
    );
    describe_counter!(
        "readdbx_pipeline_deliveries_total",
        "Store changes handled by the maintenance pipeline."
    );
    describe_counter!(
        "readdbx_notification_checks_dropped_total",
        "Reminder checks that fired after their runner stopped."
    );

    let _ = PROMETHEUS_HANDLE.set(handle);
    Ok(())
}

/// Renders the current metrics in Prometheus text format, if a recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}
