//! # pg2many
//!
//! A change-data-capture replicator for PostgreSQL. Consumes a logical
//! replication stream (pgoutput, protocol version 1) and fans row changes
//! out to heterogeneous downstream stores: PostgreSQL, ClickHouse and
//! Redis, with at-least-once delivery and ordered, monotone
//! acknowledgement of the safe log position back to the source.
//!
//! ## Architecture
//!
//! ```text
//! replication client -> event channel -> dispatcher -> workers
//!                                                        |
//!                                     broadcast( retry(sink) ... )
//! ```
//!
//! The client is the single producer: it tracks every emitted log position
//! in the checkpoint tracker before handing the event downstream. Workers
//! batch events per partition and mark positions done after a successful
//! sink write; the tracker's advancing safe position is sent upstream as
//! the standby status, which is what lets the source reclaim its WAL.
//! Events for one table always flow through one worker, so sinks observe
//! per-table source order.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = pg2many_lib::config::load(Some(Path::new("config.yaml")))?;
//!     pg2many_lib::app::run(config).await?;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod app;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod types;

// Source-side replication protocol
pub mod buffer;
pub mod client;
pub mod connection;
pub mod decode;
pub mod protocol;

// Event pipeline
pub mod dispatcher;
pub mod worker;

// Downstream sinks
pub mod sinks;

// Monitoring and metrics
pub mod monitoring;

// Public API exports
pub use checkpoint::CheckpointTracker;
pub use client::ReplicationClient;
pub use config::Config;
pub use error::CdcError;
pub use types::{Batch, ChangeEvent, ColumnValue, EventType, Lsn};

/// Result type for CDC operations
pub type CdcResult<T> = Result<T, CdcError>;
