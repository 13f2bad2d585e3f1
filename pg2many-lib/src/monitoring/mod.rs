//! Telemetry: prometheus metrics and the HTTP exposition server

pub mod metrics;
pub mod server;

pub use metrics::{gather_metrics, EVENTS_PROCESSED, LAG_BYTES, BATCH_SIZE, SINK_LATENCY};
pub use server::{parse_metrics_addr, MetricsServer};
