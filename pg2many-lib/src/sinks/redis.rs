//! Key/value sink
//!
//! Keys are produced from a user-supplied template with `{name}`
//! placeholders filled from the event's columns (identity for deletes)
//! plus `{table}` and `{schema}`. Inserts and updates store the row as a
//! JSON object; deletes remove the key. One batch is one pipelined round
//! trip.

use crate::config::RedisTarget;
use crate::error::{CdcError, Result};
use crate::sinks::Sink;
use crate::types::{Batch, EventType, Row, RowJson};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::debug;

pub struct RedisSink {
    name: String,
    connection: MultiplexedConnection,
    key_template: KeyTemplate,
}

impl RedisSink {
    pub async fn connect(target: &RedisTarget) -> Result<Self> {
        let key_template = KeyTemplate::parse(&target.key_pattern).map_err(|e| {
            CdcError::config(format!(
                "invalid key_pattern for target {}: {}",
                target.base.name, e
            ))
        })?;

        let client = redis::Client::open(target.connection_string.as_str())?;
        let connection = client.get_multiplexed_async_connection().await?;

        Ok(Self {
            name: target.base.name.clone(),
            connection,
            key_template,
        })
    }
}

#[async_trait]
impl Sink for RedisSink {
    async fn write(&self, batch: &Batch) -> Result<()> {
        let mut pipe = redis::pipe();

        for event in &batch.events {
            match event.kind {
                EventType::Delete => {
                    let key =
                        self.key_template
                            .render(&event.identity, &event.schema, &event.table)?;
                    pipe.del(key).ignore();
                }
                EventType::Insert | EventType::Update => {
                    let key =
                        self.key_template
                            .render(&event.columns, &event.schema, &event.table)?;
                    let payload = serde_json::to_string(&RowJson(&event.columns))?;
                    pipe.set(key, payload).ignore();
                }
            }
        }

        debug!(sink = %self.name, commands = batch.len(), "Executing pipeline");
        let mut connection = self.connection.clone();
        let _: () = pipe.query_async(&mut connection).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Multiplexed connections close with their last clone
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A parsed key template: literal runs interleaved with `{field}`
/// placeholders
#[derive(Debug, Clone)]
pub struct KeyTemplate {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(String),
}

impl KeyTemplate {
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(CdcError::config("key pattern must not be empty"));
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars();

        while let Some(c) = chars.next() {
            if c != '{' {
                if c == '}' {
                    return Err(CdcError::config(format!(
                        "unmatched '}}' in key pattern '{}'",
                        pattern
                    )));
                }
                literal.push(c);
                continue;
            }

            let mut field = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(c) => field.push(c),
                    None => {
                        return Err(CdcError::config(format!(
                            "unterminated placeholder in key pattern '{}'",
                            pattern
                        )));
                    }
                }
            }
            if field.is_empty() {
                return Err(CdcError::config(format!(
                    "empty placeholder in key pattern '{}'",
                    pattern
                )));
            }

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Field(field));
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    /// Substitute placeholders from the row plus the builtin `table` and
    /// `schema` fields. A placeholder with no matching field is an error:
    /// silently producing a partial key would route data astray.
    pub fn render(&self, row: &Row, schema: &str, table: &str) -> Result<String> {
        let mut key = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => key.push_str(text),
                Segment::Field(field) => match field.as_str() {
                    "table" => key.push_str(table),
                    "schema" => key.push_str(schema),
                    name => {
                        let value = row.get(name).ok_or_else(|| {
                            CdcError::sink(format!(
                                "key template field '{}' missing from {}.{} event",
                                name, schema, table
                            ))
                        })?;
                        key.push_str(&value.to_key_string());
                    }
                },
            }
        }
        Ok(key)
    }
}
