//! Prometheus metrics for replication throughput, batching and lag

use crate::error::{CdcError, Result};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Events delivered to (or dropped by) the sink stack, labelled by
    /// delivery status and sink
    pub static ref EVENTS_PROCESSED: IntCounterVec = register_int_counter_vec!(
        "replicator_events_processed_total",
        "Total number of events processed",
        &["status", "sink"]
    )
    .expect("metric can be created");

    /// Distribution of flushed batch sizes
    pub static ref BATCH_SIZE: HistogramVec = register_histogram_vec!(
        "replicator_batch_size",
        "Distribution of batch sizes",
        &["sink"],
        vec![10.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0]
    )
    .expect("metric can be created");

    /// Latency of sink write operations
    pub static ref SINK_LATENCY: HistogramVec = register_histogram_vec!(
        "replicator_sink_latency_seconds",
        "Latency of sink operations",
        &["sink"]
    )
    .expect("metric can be created");

    /// Estimated lag behind the source in bytes of log
    pub static ref LAG_BYTES: IntGauge = register_int_gauge!(
        "replicator_lag_bytes",
        "Estimated lag in bytes behind the source"
    )
    .expect("metric can be created");
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&families, &mut buffer)
        .map_err(|e| CdcError::generic(format!("failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| CdcError::generic(format!("metrics are not valid UTF-8: {}", e)))
}
