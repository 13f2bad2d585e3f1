//! pgoutput logical replication protocol, version 1
//!
//! Message model and parser for the logical messages carried inside
//! `XLogData` frames, plus the copy-stream envelope messages exchanged with
//! the walsender (keepalive in, standby status update out).

use crate::buffer::{BufferReader, BufferWriter};
use crate::error::{CdcError, Result};
use crate::types::Lsn;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Message type tags for protocol version 1
pub mod message_types {
    pub const BEGIN: u8 = b'B';
    pub const COMMIT: u8 = b'C';
    pub const ORIGIN: u8 = b'O';
    pub const RELATION: u8 = b'R';
    pub const TYPE: u8 = b'Y';
    pub const INSERT: u8 = b'I';
    pub const UPDATE: u8 = b'U';
    pub const DELETE: u8 = b'D';
    pub const TRUNCATE: u8 = b'T';
    pub const MESSAGE: u8 = b'M';
}

/// Copy-stream payload tags
pub const XLOG_DATA_TAG: u8 = b'w';
pub const KEEPALIVE_TAG: u8 = b'k';
const STANDBY_STATUS_TAG: u8 = b'r';

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01)
const PG_EPOCH_UNIX_SECS: u64 = 946_684_800;

/// A decoded logical replication message
#[derive(Debug, Clone)]
pub enum LogicalMessage {
    Begin {
        final_lsn: u64,
        timestamp: i64,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: u64,
        end_lsn: u64,
        timestamp: i64,
    },
    Relation(Relation),
    Insert {
        relation_id: u32,
        new_tuple: TupleData,
    },
    Update {
        relation_id: u32,
        /// Old tuple, transmitted only for replica identity FULL or when
        /// key columns changed (tagged 'O' or 'K' respectively)
        old_tuple: Option<TupleData>,
        key_type: Option<char>,
        new_tuple: TupleData,
    },
    Delete {
        relation_id: u32,
        key_type: char,
        old_tuple: TupleData,
    },
    Truncate {
        relation_ids: Vec<u32>,
        flags: u8,
    },
    Origin {
        origin_lsn: u64,
        origin_name: String,
    },
    Type {
        type_id: u32,
        namespace: String,
        type_name: String,
    },
    /// Logical decoding message emitted via pg_logical_emit_message
    Message {
        flags: u8,
        lsn: u64,
        prefix: String,
        content: Vec<u8>,
    },
    /// Message tag this client does not understand; skipped by the caller
    Unknown { tag: u8 },
}

/// Cached schema of a source table, keyed by the source-assigned relation id
#[derive(Debug, Clone)]
pub struct Relation {
    pub relation_id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

impl Relation {
    /// Qualified table name
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

/// One column of a relation descriptor
#[derive(Debug, Clone)]
pub struct RelationColumn {
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

impl RelationColumn {
    /// Whether the column is part of the replica identity key
    #[inline]
    pub fn is_key(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// Raw tuple (row) data as transmitted on the wire
#[derive(Debug, Clone)]
pub struct TupleData {
    pub columns: Vec<TupleColumn>,
}

/// One column of a tuple
#[derive(Debug, Clone, PartialEq)]
pub enum TupleColumn {
    Null,
    /// Large value unchanged since the last write; the actual data is not
    /// on the wire and the column must be omitted, never nulled
    UnchangedToast,
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

/// An `XLogData` frame: a logical message plus its position in the log
#[derive(Debug)]
pub struct XLogData {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    /// Source wall clock in PostgreSQL epoch microseconds
    pub server_time: i64,
    pub data: Bytes,
}

/// A primary keepalive frame
#[derive(Debug, Clone)]
pub struct Keepalive {
    pub wal_end: Lsn,
    pub timestamp: i64,
    pub reply_requested: bool,
}

/// Parse one logical replication message out of an XLogData payload.
///
/// Protocol version 1 messages carry no cross-message state, so parsing is
/// a pure function of the payload.
pub fn parse_logical_message(data: &[u8]) -> Result<LogicalMessage> {
    if data.is_empty() {
        return Err(CdcError::protocol("empty logical message"));
    }

    let mut reader = BufferReader::new(data);
    let tag = reader.read_u8()?;

    match tag {
        message_types::BEGIN => {
            let final_lsn = reader.read_u64()?;
            let timestamp = reader.read_i64()?;
            let xid = reader.read_u32()?;
            Ok(LogicalMessage::Begin {
                final_lsn,
                timestamp,
                xid,
            })
        }
        message_types::COMMIT => {
            let flags = reader.read_u8()?;
            let commit_lsn = reader.read_u64()?;
            let end_lsn = reader.read_u64()?;
            let timestamp = reader.read_i64()?;
            Ok(LogicalMessage::Commit {
                flags,
                commit_lsn,
                end_lsn,
                timestamp,
            })
        }
        message_types::RELATION => parse_relation(&mut reader),
        message_types::INSERT => {
            let relation_id = reader.read_u32()?;
            let tuple_type = reader.read_u8()?;
            if tuple_type != b'N' {
                return Err(CdcError::protocol(format!(
                    "unexpected tuple type in INSERT: '{}' (expected 'N')",
                    tuple_type as char
                )));
            }
            let new_tuple = parse_tuple_data(&mut reader)?;
            Ok(LogicalMessage::Insert {
                relation_id,
                new_tuple,
            })
        }
        message_types::UPDATE => {
            let relation_id = reader.read_u32()?;

            let mut old_tuple = None;
            let mut key_type = None;
            if reader.remaining() > 0 {
                let tuple_type = reader.peek_u8()?;
                if tuple_type == b'K' || tuple_type == b'O' {
                    reader.read_u8()?;
                    key_type = Some(tuple_type as char);
                    old_tuple = Some(parse_tuple_data(&mut reader)?);
                }
            }

            let new_tuple_type = reader.read_u8()?;
            if new_tuple_type != b'N' {
                return Err(CdcError::protocol(format!(
                    "unexpected new tuple type in UPDATE: '{}' (expected 'N')",
                    new_tuple_type as char
                )));
            }
            let new_tuple = parse_tuple_data(&mut reader)?;

            Ok(LogicalMessage::Update {
                relation_id,
                old_tuple,
                key_type,
                new_tuple,
            })
        }
        message_types::DELETE => {
            let relation_id = reader.read_u32()?;
            let key_type = reader.read_u8()? as char;
            let old_tuple = parse_tuple_data(&mut reader)?;
            Ok(LogicalMessage::Delete {
                relation_id,
                key_type,
                old_tuple,
            })
        }
        message_types::TRUNCATE => {
            let relation_count = reader.read_u32()?;
            let flags = reader.read_u8()?;
            let mut relation_ids = Vec::with_capacity(relation_count as usize);
            for _ in 0..relation_count {
                relation_ids.push(reader.read_u32()?);
            }
            Ok(LogicalMessage::Truncate {
                relation_ids,
                flags,
            })
        }
        message_types::ORIGIN => {
            let origin_lsn = reader.read_u64()?;
            let origin_name = reader.read_cstring()?;
            Ok(LogicalMessage::Origin {
                origin_lsn,
                origin_name,
            })
        }
        message_types::TYPE => {
            let type_id = reader.read_u32()?;
            let namespace = reader.read_cstring()?;
            let type_name = reader.read_cstring()?;
            Ok(LogicalMessage::Type {
                type_id,
                namespace,
                type_name,
            })
        }
        message_types::MESSAGE => {
            let flags = reader.read_u8()?;
            let lsn = reader.read_u64()?;
            let prefix = reader.read_cstring()?;
            let content_length = reader.read_u32()?;
            let content = reader.read_bytes(content_length as usize)?;
            Ok(LogicalMessage::Message {
                flags,
                lsn,
                prefix,
                content,
            })
        }
        other => Ok(LogicalMessage::Unknown { tag: other }),
    }
}

fn parse_relation(reader: &mut BufferReader) -> Result<LogicalMessage> {
    let relation_id = reader.read_u32()?;
    let namespace = reader.read_cstring()?;
    let name = reader.read_cstring()?;
    let replica_identity = reader.read_u8()?;
    let column_count = reader.read_u16()?;

    let mut columns = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let flags = reader.read_u8()?;
        let name = reader.read_cstring()?;
        let type_oid = reader.read_u32()?;
        let type_modifier = reader.read_i32()?;
        columns.push(RelationColumn {
            flags,
            name,
            type_oid,
            type_modifier,
        });
    }

    Ok(LogicalMessage::Relation(Relation {
        relation_id,
        namespace,
        name,
        replica_identity,
        columns,
    }))
}

fn parse_tuple_data(reader: &mut BufferReader) -> Result<TupleData> {
    let column_count = reader.read_u16()?;
    let mut columns = Vec::with_capacity(column_count as usize);

    for _ in 0..column_count {
        let column_type = reader.read_u8()? as char;
        let column = match column_type {
            'n' => TupleColumn::Null,
            'u' => TupleColumn::UnchangedToast,
            't' => {
                let length = reader.read_u32()?;
                TupleColumn::Text(reader.read_bytes(length as usize)?)
            }
            'b' => {
                let length = reader.read_u32()?;
                TupleColumn::Binary(reader.read_bytes(length as usize)?)
            }
            other => {
                return Err(CdcError::protocol(format!(
                    "unknown tuple column type: '{}'",
                    other
                )));
            }
        };
        columns.push(column);
    }

    Ok(TupleData { columns })
}

/// Parse an XLogData frame (payload after the copy-data wrapper).
/// The leading 'w' tag byte is included in `data`.
pub fn parse_xlog_data(data: Bytes) -> Result<XLogData> {
    let mut reader = BufferReader::from_bytes(data.clone());
    let tag = reader.read_u8()?;
    if tag != XLOG_DATA_TAG {
        return Err(CdcError::protocol(format!(
            "expected XLogData tag 'w', got '{}'",
            tag as char
        )));
    }
    let wal_start = Lsn(reader.read_u64()?);
    let wal_end = Lsn(reader.read_u64()?);
    let server_time = reader.read_i64()?;
    // Remaining bytes are the logical message
    let payload = data.slice(data.len() - reader.remaining()..);

    Ok(XLogData {
        wal_start,
        wal_end,
        server_time,
        data: payload,
    })
}

/// Parse a primary keepalive frame. The leading 'k' tag is included.
pub fn parse_keepalive(data: &[u8]) -> Result<Keepalive> {
    let mut reader = BufferReader::new(data);
    let tag = reader.read_u8()?;
    if tag != KEEPALIVE_TAG {
        return Err(CdcError::protocol(format!(
            "expected keepalive tag 'k', got '{}'",
            tag as char
        )));
    }
    let wal_end = Lsn(reader.read_u64()?);
    let timestamp = reader.read_i64()?;
    let reply_requested = reader.read_u8()? != 0;

    Ok(Keepalive {
        wal_end,
        timestamp,
        reply_requested,
    })
}

/// Encode a standby status update carrying `safe` as the write, flush and
/// apply positions.
pub fn encode_standby_status(safe: Lsn, reply_requested: bool) -> Bytes {
    let mut writer = BufferWriter::with_capacity(34);
    writer.write_u8(STANDBY_STATUS_TAG);
    writer.write_u64(safe.0);
    writer.write_u64(safe.0);
    writer.write_u64(safe.0);
    writer.write_i64(current_pg_timestamp());
    writer.write_u8(reply_requested as u8);
    writer.freeze()
}

/// Current wall clock in PostgreSQL epoch microseconds
pub fn current_pg_timestamp() -> i64 {
    let pg_epoch = UNIX_EPOCH + Duration::from_secs(PG_EPOCH_UNIX_SECS);
    SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Convert a PostgreSQL epoch microsecond timestamp to wall-clock time
pub fn pg_timestamp_to_chrono(micros: i64) -> DateTime<Utc> {
    let unix_micros = micros + (PG_EPOCH_UNIX_SECS as i64) * 1_000_000;
    DateTime::<Utc>::from_timestamp_micros(unix_micros).unwrap_or_default()
}
