//! Downstream sinks and the decorators composing them
//!
//! Every store adapter implements [`Sink`]; the retry and broadcast
//! decorators wrap the same trait, so the worker only ever sees one write
//! surface.

use crate::error::Result;
use crate::types::Batch;
use async_trait::async_trait;

pub mod broadcast;
pub mod clickhouse;
pub mod postgres;
pub mod redis;
pub mod retry;

pub use broadcast::BroadcastSink;
pub use clickhouse::ClickHouseSink;
pub use postgres::PostgresSink;
pub use redis::RedisSink;
pub use retry::RetrySink;

/// Uniform write/close contract over heterogeneous stores
#[async_trait]
pub trait Sink: Send + Sync {
    /// Apply a batch. Success means every event was durably applied;
    /// failures may be retried with the same batch. Must be safe to call
    /// concurrently with distinct batches.
    async fn write(&self, batch: &Batch) -> Result<()>;

    /// Release resources; idempotent.
    async fn close(&self) -> Result<()>;

    /// Name used in logs and failure reports
    fn name(&self) -> &str;
}
