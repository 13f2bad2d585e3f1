//! Replication client
//!
//! The single producer of the pipeline. Connects to the source in
//! replication mode, identifies the system, starts the logical stream and
//! turns wire messages into [`ChangeEvent`]s, tracking every emitted log
//! position in stream order before handing the event to the dispatcher.
//! Periodically (and whenever the server asks) it reports the tracker's
//! safe position upstream as the standby write/flush/apply position, which
//! is what lets the source reclaim its log.
//!
//! Connection loss, malformed known messages and unknown relation ids are
//! terminal: the process exits and an external supervisor restarts it.
//! Resume is safe because the source retains the log past the last
//! acknowledged safe position.

use crate::checkpoint::CheckpointTracker;
use crate::config::SourceConfig;
use crate::connection::{WalConnection, WalStream};
use crate::decode::decode_tuple;
use crate::error::{CdcError, Result};
use crate::monitoring::LAG_BYTES;
use crate::protocol::{
    self, encode_standby_status, parse_keepalive, parse_logical_message, parse_xlog_data,
    pg_timestamp_to_chrono, LogicalMessage, Relation, XLogData,
};
use crate::types::{ChangeEvent, EventType, Lsn, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long one receive may block before periodic work gets a turn
const RECEIVE_DEADLINE: Duration = Duration::from_secs(5);

/// Cadence of unsolicited standby status updates
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

pub struct ReplicationClient {
    config: SourceConfig,
    tracker: Arc<CheckpointTracker>,
    events: mpsc::Sender<ChangeEvent>,
    /// Relation descriptors keyed by the source-assigned relation id.
    /// Owned by this single task; the source resends relation messages at
    /// stream start, so the cache needs no persistence across restarts.
    relations: HashMap<u32, Relation>,
}

impl ReplicationClient {
    pub fn new(
        config: SourceConfig,
        tracker: Arc<CheckpointTracker>,
        events: mpsc::Sender<ChangeEvent>,
    ) -> Self {
        Self {
            config,
            tracker,
            events,
            relations: HashMap::with_capacity(64),
        }
    }

    /// Run until cancelled or a terminal failure
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut conn = WalConnection::connect(&self.config.connection_string).await?;

        let identity = conn.identify_system().await?;
        info!(
            system_id = %identity.system_id,
            timeline = identity.timeline,
            xlogpos = %identity.xlog_pos,
            "System identified"
        );

        // Resume from the last acknowledged position when one exists,
        // otherwise start from the source's current head
        let safe = self.tracker.safe_lsn();
        let start = if safe.is_zero() { identity.xlog_pos } else { safe };

        info!(slot = %self.config.slot_name, start_lsn = %start, "Starting replication");
        let mut stream = conn
            .start_replication(&self.config.slot_name, start, &self.config.publication)
            .await?;

        let mut last_status = Instant::now();

        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, sending final status update");
                let status = encode_standby_status(self.tracker.safe_lsn(), false);
                if let Err(e) = stream.send_status(status).await {
                    warn!("Failed to send final status update: {}", e);
                }
                return Ok(());
            }

            if last_status.elapsed() >= STATUS_INTERVAL {
                self.send_status(&mut stream, false).await?;
                last_status = Instant::now();
            }

            let Some(frame) = stream.next_frame(RECEIVE_DEADLINE).await? else {
                continue;
            };

            match frame.first().copied() {
                Some(protocol::KEEPALIVE_TAG) => {
                    let keepalive = parse_keepalive(&frame)?;
                    self.update_lag(keepalive.wal_end);
                    if keepalive.reply_requested {
                        self.send_status(&mut stream, false).await?;
                        last_status = Instant::now();
                    }
                }
                Some(protocol::XLOG_DATA_TAG) => {
                    let xlog_data = parse_xlog_data(frame)?;
                    self.update_lag(xlog_data.wal_end);
                    if !self.handle_xlog_data(xlog_data).await? {
                        // Event channel closed: the pipeline is shutting down
                        info!("Event channel closed, stopping replication");
                        return Ok(());
                    }
                }
                other => {
                    debug!("Skipping unknown copy payload tag {:?}", other);
                }
            }
        }
    }

    async fn send_status(&self, stream: &mut WalStream, reply_requested: bool) -> Result<()> {
        let safe = self.tracker.safe_lsn();
        debug!(safe_lsn = %safe, "Sending standby status update");
        stream
            .send_status(encode_standby_status(safe, reply_requested))
            .await
    }

    fn update_lag(&self, wal_end: Lsn) {
        let safe = self.tracker.safe_lsn();
        LAG_BYTES.set(wal_end.0.saturating_sub(safe.0) as i64);
    }

    /// Handle one logical message. Returns `false` when the downstream
    /// channel has closed and streaming should stop.
    async fn handle_xlog_data(&mut self, xlog_data: XLogData) -> Result<bool> {
        let lsn = xlog_data.wal_start;
        let server_time = pg_timestamp_to_chrono(xlog_data.server_time);

        match parse_logical_message(&xlog_data.data)? {
            LogicalMessage::Relation(relation) => {
                debug!(
                    relation_id = relation.relation_id,
                    table = %relation.full_name(),
                    columns = relation.columns.len(),
                    "Relation descriptor cached"
                );
                self.relations.insert(relation.relation_id, relation);
            }
            LogicalMessage::Insert {
                relation_id,
                new_tuple,
            } => {
                let relation = self.relation(relation_id)?;
                let columns = decode_tuple(&new_tuple, relation)?;
                let event = ChangeEvent {
                    kind: EventType::Insert,
                    schema: relation.namespace.clone(),
                    table: relation.name.clone(),
                    columns,
                    identity: Row::new(),
                    lsn,
                    server_time,
                };
                return self.track_and_emit(event).await;
            }
            LogicalMessage::Update {
                relation_id,
                old_tuple,
                new_tuple,
                ..
            } => {
                let relation = self.relation(relation_id)?;
                let columns = decode_tuple(&new_tuple, relation)?;
                // Identity comes from the old tuple when the source
                // transmitted one (replica identity FULL or USING INDEX)
                let identity = match &old_tuple {
                    Some(old) => decode_tuple(old, relation)?,
                    None => Row::new(),
                };
                let event = ChangeEvent {
                    kind: EventType::Update,
                    schema: relation.namespace.clone(),
                    table: relation.name.clone(),
                    columns,
                    identity,
                    lsn,
                    server_time,
                };
                return self.track_and_emit(event).await;
            }
            LogicalMessage::Delete {
                relation_id,
                old_tuple,
                ..
            } => {
                let relation = self.relation(relation_id)?;
                let identity = decode_tuple(&old_tuple, relation)?;
                let event = ChangeEvent {
                    kind: EventType::Delete,
                    schema: relation.namespace.clone(),
                    table: relation.name.clone(),
                    columns: Row::new(),
                    identity,
                    lsn,
                    server_time,
                };
                return self.track_and_emit(event).await;
            }
            // Transaction boundaries are acknowledged implicitly through
            // the tracker; no boundary is surfaced to sinks
            LogicalMessage::Begin { xid, .. } => {
                debug!(xid = xid, "BEGIN");
            }
            LogicalMessage::Commit { end_lsn, .. } => {
                debug!(end_lsn = %Lsn(end_lsn), "COMMIT");
            }
            LogicalMessage::Truncate { relation_ids, .. } => {
                debug!(relations = relation_ids.len(), "Skipping TRUNCATE");
            }
            LogicalMessage::Origin { origin_name, .. } => {
                debug!(origin = %origin_name, "Skipping ORIGIN");
            }
            LogicalMessage::Type { type_name, .. } => {
                debug!(type_name = %type_name, "Skipping TYPE");
            }
            LogicalMessage::Message { prefix, .. } => {
                debug!(prefix = %prefix, "Skipping MESSAGE");
            }
            LogicalMessage::Unknown { tag } => {
                debug!("Skipping unknown message kind '{}'", tag as char);
            }
        }

        Ok(true)
    }

    fn relation(&self, relation_id: u32) -> Result<&Relation> {
        self.relations.get(&relation_id).ok_or_else(|| {
            CdcError::protocol(format!("unknown relation id {}", relation_id))
        })
    }

    /// Track the position, then hand the event to the dispatcher. Tracking
    /// happens first and on this single task, so the tracker observes
    /// positions in strictly increasing order.
    async fn track_and_emit(&self, event: ChangeEvent) -> Result<bool> {
        self.tracker.track(event.lsn);
        Ok(self.events.send(event).await.is_ok())
    }
}
