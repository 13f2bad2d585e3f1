//! Typed decoding of wire tuples against the cached relation schema
//!
//! Text-format column data is parsed into concrete [`ColumnValue`] variants
//! according to the column's type OID. Parse failures are decode errors;
//! the sinks never see raw bytes they would have to re-interpret.

use crate::error::{CdcError, Result};
use crate::protocol::{Relation, TupleColumn, TupleData};
use crate::types::{ColumnValue, Row};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Timestamp layouts PostgreSQL emits in text format, tried in order
const TIMESTAMP_LAYOUTS_TZ: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%#z"];
const TIMESTAMP_LAYOUTS_NAIVE: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

/// Decode a wire tuple into a column-name → value map.
///
/// Null columns map to [`ColumnValue::Null`]; unchanged-toast columns are
/// omitted entirely.
pub fn decode_tuple(tuple: &TupleData, relation: &Relation) -> Result<Row> {
    let mut row = Row::new();

    for (index, tuple_column) in tuple.columns.iter().enumerate() {
        let column = relation.columns.get(index).ok_or_else(|| {
            CdcError::decode(format!(
                "tuple column index {} out of range for relation {}",
                index,
                relation.full_name()
            ))
        })?;

        let value = match tuple_column {
            TupleColumn::Null => ColumnValue::Null,
            TupleColumn::UnchangedToast => continue,
            TupleColumn::Text(data) => {
                let text = std::str::from_utf8(data).map_err(|e| {
                    CdcError::decode(format!(
                        "invalid UTF-8 in column {} of {}: {}",
                        column.name,
                        relation.full_name(),
                        e
                    ))
                })?;
                decode_text_value(column.type_oid, text)?
            }
            TupleColumn::Binary(data) => ColumnValue::Bytes(data.clone()),
        };

        row.insert(column.name.clone(), value);
    }

    Ok(row)
}

/// Decode a text-format value against its type OID
fn decode_text_value(type_oid: u32, text: &str) -> Result<ColumnValue> {
    match type_oid {
        // boolean
        16 => Ok(ColumnValue::Bool(text == "t")),
        // int2
        21 => text
            .parse::<i32>()
            .map(ColumnValue::Int32)
            .map_err(|e| CdcError::decode(format!("invalid integer '{}': {}", text, e))),
        // int8, int4
        20 | 23 => text
            .parse::<i64>()
            .map(ColumnValue::Int64)
            .map_err(|e| CdcError::decode(format!("invalid integer '{}': {}", text, e))),
        // text, varchar
        25 | 1043 => Ok(ColumnValue::Text(text.to_string())),
        // timestamp, timestamptz
        1114 | 1184 => parse_timestamp(text)
            .map(ColumnValue::Timestamp)
            .ok_or_else(|| CdcError::decode(format!("invalid timestamp '{}'", text))),
        // Everything else passes through as its textual form
        _ => Ok(ColumnValue::Text(text.to_string())),
    }
}

/// Parse a timestamp against the four documented layouts in order
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    for layout in TIMESTAMP_LAYOUTS_TZ {
        if let Ok(ts) = DateTime::parse_from_str(text, layout) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for layout in TIMESTAMP_LAYOUTS_NAIVE {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, layout) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RelationColumn;

    fn relation_fixture() -> Relation {
        Relation {
            relation_id: 1,
            namespace: "public".to_string(),
            name: "orders".to_string(),
            replica_identity: b'd',
            columns: vec![
                column("id", 20, true),
                column("qty", 21, false),
                column("ref", 23, false),
                column("paid", 16, false),
                column("note", 25, false),
                column("created_at", 1184, false),
                column("payload", 999_999, false),
            ],
        }
    }

    fn column(name: &str, type_oid: u32, key: bool) -> RelationColumn {
        RelationColumn {
            flags: key as u8,
            name: name.to_string(),
            type_oid,
            type_modifier: -1,
        }
    }

    #[test]
    fn test_decode_typed_values() {
        let tuple = TupleData {
            columns: vec![
                TupleColumn::Text(b"9001".to_vec()),
                TupleColumn::Text(b"3".to_vec()),
                TupleColumn::Text(b"-17".to_vec()),
                TupleColumn::Text(b"t".to_vec()),
                TupleColumn::Text(b"hello".to_vec()),
                TupleColumn::Text(b"2024-03-01 12:30:45.123456+00".to_vec()),
                TupleColumn::Text(b"anything".to_vec()),
            ],
        };

        let row = decode_tuple(&tuple, &relation_fixture()).unwrap();
        assert_eq!(row["id"], ColumnValue::Int64(9001));
        assert_eq!(row["qty"], ColumnValue::Int32(3));
        assert_eq!(row["ref"], ColumnValue::Int64(-17));
        assert_eq!(row["paid"], ColumnValue::Bool(true));
        assert_eq!(row["note"], ColumnValue::Text("hello".to_string()));
        assert_eq!(row["payload"], ColumnValue::Text("anything".to_string()));
        match &row["created_at"] {
            ColumnValue::Timestamp(ts) => {
                assert_eq!(ts.to_rfc3339(), "2024-03-01T12:30:45.123456+00:00")
            }
            other => panic!("expected timestamp, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_bool_false() {
        let row = decode_tuple(
            &TupleData {
                columns: vec![
                    TupleColumn::Text(b"1".to_vec()),
                    TupleColumn::Text(b"2".to_vec()),
                    TupleColumn::Text(b"3".to_vec()),
                    TupleColumn::Text(b"f".to_vec()),
                ],
            },
            &relation_fixture(),
        )
        .unwrap();
        assert_eq!(row["paid"], ColumnValue::Bool(false));
    }

    #[test]
    fn test_null_is_stored_toast_is_omitted() {
        let tuple = TupleData {
            columns: vec![
                TupleColumn::Text(b"1".to_vec()),
                TupleColumn::Null,
                TupleColumn::UnchangedToast,
            ],
        };

        let row = decode_tuple(&tuple, &relation_fixture()).unwrap();
        assert_eq!(row["qty"], ColumnValue::Null);
        assert!(!row.contains_key("ref"), "toast column must be omitted");
    }

    #[test]
    fn test_binary_column_passes_through() {
        let tuple = TupleData {
            columns: vec![TupleColumn::Binary(vec![0x01, 0xFF])],
        };
        let row = decode_tuple(&tuple, &relation_fixture()).unwrap();
        assert_eq!(row["id"], ColumnValue::Bytes(vec![0x01, 0xFF]));
    }

    #[test]
    fn test_invalid_integer_is_decode_error() {
        let tuple = TupleData {
            columns: vec![TupleColumn::Text(b"not-a-number".to_vec())],
        };
        assert!(decode_tuple(&tuple, &relation_fixture()).is_err());
    }

    #[test]
    fn test_extra_tuple_column_is_decode_error() {
        let mut relation = relation_fixture();
        relation.columns.truncate(1);
        let tuple = TupleData {
            columns: vec![
                TupleColumn::Text(b"1".to_vec()),
                TupleColumn::Text(b"2".to_vec()),
            ],
        };
        assert!(decode_tuple(&tuple, &relation).is_err());
    }

    #[test]
    fn test_timestamp_layouts() {
        for (input, expected) in [
            (
                "2024-03-01 12:30:45.123456+00",
                "2024-03-01T12:30:45.123456+00:00",
            ),
            ("2024-03-01 12:30:45.5", "2024-03-01T12:30:45.500+00:00"),
            ("2024-03-01 12:30:45+02", "2024-03-01T10:30:45+00:00"),
            ("2024-03-01 12:30:45", "2024-03-01T12:30:45+00:00"),
        ] {
            let ts = parse_timestamp(input)
                .unwrap_or_else(|| panic!("failed to parse '{}'", input));
            assert_eq!(ts.to_rfc3339(), expected, "input '{}'", input);
        }
    }

    #[test]
    fn test_timestamp_garbage_rejected() {
        assert!(parse_timestamp("yesterday").is_none());
    }
}
