//! Transactional SQL sink
//!
//! Each batch is rendered into one multi-statement script and executed as a
//! single batched round trip; the simple query protocol runs it inside one
//! implicit transaction.

use crate::config::PostgresTarget;
use crate::error::Result;
use crate::sinks::Sink;
use crate::types::{Batch, ChangeEvent, ColumnValue, EventType};
use async_trait::async_trait;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

pub struct PostgresSink {
    name: String,
    client: tokio_postgres::Client,
}

impl PostgresSink {
    /// Connect to the target database; the connection task is driven in
    /// the background for the lifetime of the process.
    pub async fn connect(target: &PostgresTarget) -> Result<Self> {
        let (client, connection) =
            tokio_postgres::connect(&target.connection_string, NoTls).await?;

        let name = target.base.name.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(sink = %name, "PostgreSQL connection error: {}", e);
            }
        });

        Ok(Self {
            name: target.base.name.clone(),
            client,
        })
    }
}

#[async_trait]
impl Sink for PostgresSink {
    async fn write(&self, batch: &Batch) -> Result<()> {
        let Some(script) = batch_script(batch) else {
            return Ok(());
        };
        debug!(sink = %self.name, statements = batch.len(), "Executing batch script");
        self.client.batch_execute(&script).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // The connection task ends when the client is dropped
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Render a batch into a multi-statement SQL script. Returns `None` when
/// nothing in the batch produces a statement.
fn batch_script(batch: &Batch) -> Option<String> {
    let mut script = String::new();
    for event in &batch.events {
        let statement = match event.kind {
            EventType::Insert => Some(insert_sql(event)),
            EventType::Update => update_sql(event),
            EventType::Delete => delete_sql(event),
        };
        if let Some(statement) = statement {
            script.push_str(&statement);
            script.push('\n');
        }
    }

    if script.is_empty() {
        None
    } else {
        Some(script)
    }
}

fn insert_sql(event: &ChangeEvent) -> String {
    let columns: Vec<String> = event.columns.keys().map(|c| quote_ident(c)).collect();
    let values: Vec<String> = event.columns.values().map(literal).collect();

    format!(
        "INSERT INTO {}.{} ({}) VALUES ({}) ON CONFLICT DO NOTHING;",
        quote_ident(&event.schema),
        quote_ident(&event.table),
        columns.join(", "),
        values.join(", ")
    )
}

/// Updates without a replica identity cannot address the row; skip them
fn update_sql(event: &ChangeEvent) -> Option<String> {
    if event.identity.is_empty() {
        return None;
    }

    let assignments: Vec<String> = event
        .columns
        .iter()
        .map(|(column, value)| format!("{} = {}", quote_ident(column), literal(value)))
        .collect();
    if assignments.is_empty() {
        return None;
    }

    Some(format!(
        "UPDATE {}.{} SET {} WHERE {};",
        quote_ident(&event.schema),
        quote_ident(&event.table),
        assignments.join(", "),
        where_clause(event)
    ))
}

fn delete_sql(event: &ChangeEvent) -> Option<String> {
    if event.identity.is_empty() {
        return None;
    }

    Some(format!(
        "DELETE FROM {}.{} WHERE {};",
        quote_ident(&event.schema),
        quote_ident(&event.table),
        where_clause(event)
    ))
}

fn where_clause(event: &ChangeEvent) -> String {
    event
        .identity
        .iter()
        .map(|(column, value)| match value {
            ColumnValue::Null => format!("{} IS NULL", quote_ident(column)),
            other => format!("{} = {}", quote_ident(column), literal(other)),
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Render a value as a SQL literal; the server coerces the text form to
/// the column type
fn literal(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Null => "NULL".to_string(),
        ColumnValue::Bool(b) => b.to_string(),
        ColumnValue::Int32(i) => i.to_string(),
        ColumnValue::Int64(i) => i.to_string(),
        ColumnValue::Text(s) => quote_text(s),
        ColumnValue::Bytes(b) => format!("'\\x{}'", hex::encode(b)),
        ColumnValue::Timestamp(ts) => quote_text(&ts.to_rfc3339()),
    }
}

fn quote_text(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Lsn, Row};
    use chrono::Utc;

    fn event(kind: EventType, columns: Row, identity: Row) -> ChangeEvent {
        ChangeEvent {
            kind,
            schema: "public".to_string(),
            table: "users".to_string(),
            columns,
            identity,
            lsn: Lsn(1),
            server_time: Utc::now(),
        }
    }

    fn row(pairs: &[(&str, ColumnValue)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_insert_sql() {
        let e = event(
            EventType::Insert,
            row(&[
                ("id", ColumnValue::Int64(7)),
                ("name", ColumnValue::Text("bob".to_string())),
            ]),
            Row::new(),
        );
        assert_eq!(
            insert_sql(&e),
            r#"INSERT INTO "public"."users" ("id", "name") VALUES (7, 'bob') ON CONFLICT DO NOTHING;"#
        );
    }

    #[test]
    fn test_update_sql_uses_identity() {
        let e = event(
            EventType::Update,
            row(&[("name", ColumnValue::Text("alice".to_string()))]),
            row(&[("id", ColumnValue::Int64(7))]),
        );
        assert_eq!(
            update_sql(&e).unwrap(),
            r#"UPDATE "public"."users" SET "name" = 'alice' WHERE "id" = 7;"#
        );
    }

    #[test]
    fn test_update_without_identity_is_skipped() {
        let e = event(
            EventType::Update,
            row(&[("name", ColumnValue::Text("alice".to_string()))]),
            Row::new(),
        );
        assert!(update_sql(&e).is_none());
    }

    #[test]
    fn test_delete_sql() {
        let e = event(
            EventType::Delete,
            Row::new(),
            row(&[
                ("id", ColumnValue::Int64(7)),
                ("region", ColumnValue::Null),
            ]),
        );
        assert_eq!(
            delete_sql(&e).unwrap(),
            r#"DELETE FROM "public"."users" WHERE "id" = 7 AND "region" IS NULL;"#
        );
    }

    #[test]
    fn test_delete_without_identity_is_skipped() {
        let e = event(EventType::Delete, Row::new(), Row::new());
        assert!(delete_sql(&e).is_none());
    }

    #[test]
    fn test_literal_escaping() {
        assert_eq!(
            literal(&ColumnValue::Text("it's".to_string())),
            "'it''s'"
        );
        assert_eq!(literal(&ColumnValue::Bytes(vec![0xDE, 0xAD])), "'\\xdead'");
        assert_eq!(literal(&ColumnValue::Null), "NULL");
        assert_eq!(literal(&ColumnValue::Bool(false)), "false");
    }

    #[test]
    fn test_ident_escaping() {
        assert_eq!(quote_ident(r#"weird"name"#), r#""weird""name""#);
    }

    #[test]
    fn test_batch_script_combines_statements() {
        let mut batch = Batch::with_capacity(2);
        batch.push(event(
            EventType::Insert,
            row(&[("id", ColumnValue::Int64(1))]),
            Row::new(),
        ));
        batch.push(event(
            EventType::Delete,
            Row::new(),
            row(&[("id", ColumnValue::Int64(2))]),
        ));

        let script = batch_script(&batch).unwrap();
        assert_eq!(script.lines().count(), 2);
        assert!(script.contains("INSERT INTO"));
        assert!(script.contains("DELETE FROM"));
    }

    #[test]
    fn test_batch_script_empty_when_nothing_addressable() {
        let mut batch = Batch::with_capacity(1);
        batch.push(event(EventType::Delete, Row::new(), Row::new()));
        assert!(batch_script(&batch).is_none());
    }
}
