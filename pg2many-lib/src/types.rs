//! Core data model: log positions, typed column values, change events and
//! the batch container handed to sinks.

use crate::error::{CdcError, Result};
use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A log sequence number from the source write-ahead log.
///
/// Opaque and monotone; only ordering and equality are meaningful.
/// Rendered for humans as the two hex halves joined by `/`, the same
/// form PostgreSQL prints in `pg_lsn` columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", (self.0 >> 32) as u32, self.0 as u32)
    }
}

impl FromStr for Lsn {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| CdcError::protocol(format!("invalid LSN '{}'", s)))?;
        let hi = u32::from_str_radix(hi, 16)
            .map_err(|e| CdcError::protocol(format!("invalid LSN '{}': {}", s, e)))?;
        let lo = u32::from_str_radix(lo, 16)
            .map_err(|e| CdcError::protocol(format!("invalid LSN '{}': {}", s, e)))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

/// Kind of row change carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Insert => write!(f, "INSERT"),
            EventType::Update => write!(f, "UPDATE"),
            EventType::Delete => write!(f, "DELETE"),
        }
    }
}

/// A decoded column value.
///
/// The decoder emits one of these concrete shapes per column so that sinks
/// never have to re-interpret raw bytes or type-switch on opaque boxes.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl ColumnValue {
    /// Render the value for key-template substitution.
    ///
    /// Nulls render empty, bytes lossily; everything else in its natural
    /// textual form.
    pub fn to_key_string(&self) -> String {
        match self {
            ColumnValue::Null => String::new(),
            ColumnValue::Bool(b) => b.to_string(),
            ColumnValue::Int32(i) => i.to_string(),
            ColumnValue::Int64(i) => i.to_string(),
            ColumnValue::Text(s) => s.clone(),
            ColumnValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            ColumnValue::Timestamp(ts) => ts.to_rfc3339(),
        }
    }
}

impl Serialize for ColumnValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ColumnValue::Null => serializer.serialize_none(),
            ColumnValue::Bool(b) => serializer.serialize_bool(*b),
            ColumnValue::Int32(i) => serializer.serialize_i32(*i),
            ColumnValue::Int64(i) => serializer.serialize_i64(*i),
            ColumnValue::Text(s) => serializer.serialize_str(s),
            ColumnValue::Bytes(b) => serializer.serialize_str(&String::from_utf8_lossy(b)),
            ColumnValue::Timestamp(ts) => serializer.serialize_str(&ts.to_rfc3339()),
        }
    }
}

/// Ordered column-name → value mapping.
///
/// A BTreeMap keeps SQL generation deterministic for a given event shape.
pub type Row = BTreeMap<String, ColumnValue>;

/// A single row change read from the replication stream
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: EventType,
    pub schema: String,
    pub table: String,
    /// New column values; present for inserts and updates
    pub columns: Row,
    /// Replica identity values; present for updates (when the source
    /// transmitted the old tuple) and deletes
    pub identity: Row,
    pub lsn: Lsn,
    /// Source-supplied wall clock, advisory only
    pub server_time: DateTime<Utc>,
}

impl ChangeEvent {
    /// Qualified table name, the partition key for dispatching
    #[inline]
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Serialize the columns of an event as a flat JSON object
pub(crate) struct RowJson<'a>(pub &'a Row);

impl Serialize for RowJson<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// An ordered run of events bound for a single worker's sink stack
#[derive(Debug, Default)]
pub struct Batch {
    pub events: Vec<ChangeEvent>,
    /// Greatest log position contained in the batch
    pub max_lsn: Lsn,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            max_lsn: Lsn::default(),
        }
    }

    pub fn push(&mut self, event: ChangeEvent) {
        if event.lsn > self.max_lsn {
            self.max_lsn = event.lsn;
        }
        self.events.push(event);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Reset for reuse; capacity is retained
    pub fn clear(&mut self) {
        self.events.clear();
        self.max_lsn = Lsn::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_display_hex_halves() {
        let lsn = Lsn(0x0000_0001_6B37_2D28);
        assert_eq!(lsn.to_string(), "1/6B372D28");
        assert_eq!(Lsn(0).to_string(), "0/0");
    }

    #[test]
    fn test_lsn_round_trip() {
        let lsn: Lsn = "1/6B372D28".parse().unwrap();
        assert_eq!(lsn, Lsn(0x0000_0001_6B37_2D28));
        assert_eq!(lsn.to_string().parse::<Lsn>().unwrap(), lsn);
    }

    #[test]
    fn test_lsn_parse_rejects_garbage() {
        assert!("nope".parse::<Lsn>().is_err());
        assert!("1-2".parse::<Lsn>().is_err());
        assert!("zz/00".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_lsn_ordering() {
        assert!(Lsn(100) < Lsn(101));
        assert!(!Lsn(5).is_zero());
        assert!(Lsn(0).is_zero());
    }

    #[test]
    fn test_batch_tracks_max_lsn() {
        let mut batch = Batch::with_capacity(4);
        assert!(batch.is_empty());

        for lsn in [103u64, 101, 102] {
            batch.push(ChangeEvent {
                kind: EventType::Insert,
                schema: "public".to_string(),
                table: "users".to_string(),
                columns: Row::new(),
                identity: Row::new(),
                lsn: Lsn(lsn),
                server_time: Utc::now(),
            });
        }

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.max_lsn, Lsn(103));

        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.max_lsn, Lsn(0));
    }

    #[test]
    fn test_column_value_json() {
        let mut row = Row::new();
        row.insert("id".to_string(), ColumnValue::Int64(7));
        row.insert("name".to_string(), ColumnValue::Text("bob".to_string()));
        row.insert("active".to_string(), ColumnValue::Bool(true));
        row.insert("note".to_string(), ColumnValue::Null);

        let json = serde_json::to_string(&RowJson(&row)).unwrap();
        assert_eq!(
            json,
            r#"{"active":true,"id":7,"name":"bob","note":null}"#
        );
    }
}
