use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    pub status: OperationStatus,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum OperationStatus {
    Success,
    Failure,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TableLabels {
    pub table: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Counters and gauges for the table cache. Cheap to clone; every handle
/// points at the same registered series.
#[derive(Clone)]
pub struct Metrics {
    /// Sync passes by outcome.
    pub tables_sync_operation_total: Family<StatusLabels, Counter>,
    /// Wall time of the most recent sync pass.
    pub tables_download_operation_duration_seconds: Gauge<f64, AtomicU64>,
    /// Cumulative time queries spent waiting for a table download.
    pub query_time_table_download_duration_seconds: Family<TableLabels, Counter<f64, AtomicU64>>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let tables_sync_operation_total = Family::<StatusLabels, Counter>::default();
        registry.register(
            "indexcache_tables_sync_operation_total",
            "Total table sync operations by status",
            tables_sync_operation_total.clone(),
        );

        let tables_download_operation_duration_seconds: Gauge<f64, AtomicU64> = Gauge::default();
        registry.register(
            "indexcache_tables_download_operation_duration_seconds",
            "Duration of the last tables sync pass in seconds",
            tables_download_operation_duration_seconds.clone(),
        );

        let query_time_table_download_duration_seconds =
            Family::<TableLabels, Counter<f64, AtomicU64>>::default();
        registry.register(
            "indexcache_query_time_table_download_duration_seconds",
            "Time spent downloading index files at query time, per table",
            query_time_table_download_duration_seconds.clone(),
        );

        Self {
            tables_sync_operation_total,
            tables_download_operation_duration_seconds,
            query_time_table_download_duration_seconds,
        }
    }
}
