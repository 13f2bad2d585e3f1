//! Parallel fan-out to multiple sinks
//!
//! Every inner sink sees every batch; a slow or broken sink never starves
//! the others of traffic. A write succeeds only when every inner write
//! succeeded, otherwise the failures are reported together.

use crate::error::{CdcError, Result};
use crate::sinks::Sink;
use crate::types::Batch;
use async_trait::async_trait;
use futures::future::join_all;

/// Decorator writing to an ordered list of sinks in parallel
pub struct BroadcastSink {
    sinks: Vec<Box<dyn Sink>>,
}

impl BroadcastSink {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

#[async_trait]
impl Sink for BroadcastSink {
    async fn write(&self, batch: &Batch) -> Result<()> {
        let results = join_all(self.sinks.iter().map(|sink| sink.write(batch))).await;

        let failures: Vec<CdcError> = results.into_iter().filter_map(|r| r.err()).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CdcError::Broadcast(failures))
        }
    }

    async fn close(&self) -> Result<()> {
        let results = join_all(self.sinks.iter().map(|sink| sink.close())).await;

        let failures: Vec<CdcError> = results.into_iter().filter_map(|r| r.err()).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CdcError::Broadcast(failures))
        }
    }

    fn name(&self) -> &str {
        "broadcast"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeEvent, EventType, Lsn, Row};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    struct RecordingSink {
        name: String,
        tables_seen: Arc<Mutex<Vec<String>>>,
        closes: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn write(&self, batch: &Batch) -> Result<()> {
            if self.fail {
                return Err(CdcError::sink(format!("{} is down", self.name)));
            }
            let mut seen = self.tables_seen.lock().unwrap();
            for event in &batch.events {
                seen.push(event.qualified_table());
            }
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CdcError::sink(format!("{} close failed", self.name)))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn recording(name: &str, fail: bool) -> (RecordingSink, Arc<Mutex<Vec<String>>>, Arc<AtomicU32>) {
        let tables = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(AtomicU32::new(0));
        (
            RecordingSink {
                name: name.to_string(),
                tables_seen: tables.clone(),
                closes: closes.clone(),
                fail,
            },
            tables,
            closes,
        )
    }

    fn users_batch() -> Batch {
        let mut batch = Batch::with_capacity(1);
        batch.push(ChangeEvent {
            kind: EventType::Insert,
            schema: "public".to_string(),
            table: "users".to_string(),
            columns: Row::new(),
            identity: Row::new(),
            lsn: Lsn(1),
            server_time: Utc::now(),
        });
        batch
    }

    #[tokio::test]
    async fn test_broadcast_success_reaches_every_sink() {
        let (a, tables_a, _) = recording("sink-a", false);
        let (b, tables_b, _) = recording("sink-b", false);
        let broadcast = BroadcastSink::new(vec![Box::new(a), Box::new(b)]);

        broadcast.write(&users_batch()).await.unwrap();

        assert_eq!(*tables_a.lock().unwrap(), vec!["public.users"]);
        assert_eq!(*tables_b.lock().unwrap(), vec!["public.users"]);
    }

    #[tokio::test]
    async fn test_broadcast_partial_failure_names_the_failing_sink() {
        let (a, tables_a, _) = recording("sink-a", false);
        let (b, _, _) = recording("sink-b", true);
        let broadcast = BroadcastSink::new(vec![Box::new(a), Box::new(b)]);

        let err = broadcast.write(&users_batch()).await.unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("sink-b"), "error was: {}", rendered);

        // The healthy sink still saw the batch
        assert_eq!(*tables_a.lock().unwrap(), vec!["public.users"]);
    }

    #[tokio::test]
    async fn test_close_reaches_every_sink_despite_failures() {
        let (a, _, closes_a) = recording("sink-a", true);
        let (b, _, closes_b) = recording("sink-b", false);
        let broadcast = BroadcastSink::new(vec![Box::new(a), Box::new(b)]);

        let err = broadcast.close().await.unwrap_err();
        assert!(err.to_string().contains("sink-a"));
        assert_eq!(closes_a.load(Ordering::SeqCst), 1);
        assert_eq!(closes_b.load(Ordering::SeqCst), 1);
    }
}
