//! Per-partition batching worker
//!
//! A worker owns one bounded input queue and a reusable batch buffer. It
//! flushes when the batch reaches the size threshold, when the batch timer
//! fires, and once more on shutdown under a short non-cancellable grace
//! window. Successful flushes mark every contained position done in the
//! checkpoint tracker; failed flushes drop the events but leave their
//! positions in flight, so the safe position reported upstream never moves
//! past data that was not applied.

use crate::checkpoint::CheckpointTracker;
use crate::monitoring::{BATCH_SIZE, EVENTS_PROCESSED, SINK_LATENCY};
use crate::sinks::Sink;
use crate::types::{Batch, ChangeEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Grace window for the final flush during shutdown
const SHUTDOWN_FLUSH_GRACE: Duration = Duration::from_secs(5);

/// Metric label for the shared sink stack the workers write to
const SINK_LABEL: &str = "broadcast";

pub struct Worker {
    id: usize,
    batch_size: usize,
    batch_interval: Duration,
    input: mpsc::Receiver<ChangeEvent>,
    sink: Arc<dyn Sink>,
    tracker: Arc<CheckpointTracker>,
    shutdown: CancellationToken,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        batch_size: usize,
        batch_interval: Duration,
        input: mpsc::Receiver<ChangeEvent>,
        sink: Arc<dyn Sink>,
        tracker: Arc<CheckpointTracker>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            batch_size,
            batch_interval,
            input,
            sink,
            tracker,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut batch = Batch::with_capacity(self.batch_size);
        let mut timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.batch_interval,
            self.batch_interval,
        );
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!(worker = self.id, "Worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.flush_with_grace(&mut batch).await;
                    break;
                }
                received = self.input.recv() => {
                    match received {
                        Some(event) => {
                            batch.push(event);
                            if batch.len() >= self.batch_size {
                                self.flush(&mut batch).await;
                                timer.reset();
                            }
                        }
                        None => {
                            self.flush_with_grace(&mut batch).await;
                            break;
                        }
                    }
                }
                _ = timer.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }

        debug!(worker = self.id, "Worker stopped");
    }

    async fn flush(&self, batch: &mut Batch) {
        if batch.is_empty() {
            return;
        }

        let started = Instant::now();
        let result = self.sink.write(batch).await;
        let elapsed = started.elapsed();

        SINK_LATENCY
            .with_label_values(&[SINK_LABEL])
            .observe(elapsed.as_secs_f64());
        BATCH_SIZE
            .with_label_values(&[SINK_LABEL])
            .observe(batch.len() as f64);

        match result {
            Ok(()) => {
                for event in &batch.events {
                    self.tracker.mark_done(event.lsn);
                }
                EVENTS_PROCESSED
                    .with_label_values(&["success", SINK_LABEL])
                    .inc_by(batch.len() as u64);
                debug!(
                    worker = self.id,
                    events = batch.len(),
                    lsn = %batch.max_lsn,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Batch flushed"
                );
            }
            Err(err) => {
                // Positions stay in flight: the safe position freezes here
                // and a restart replays from it
                error!(
                    worker = self.id,
                    error = %err,
                    dropped = batch.len(),
                    lsn = %batch.max_lsn,
                    "Sink write failed, dropping batch"
                );
                EVENTS_PROCESSED
                    .with_label_values(&["failed", SINK_LABEL])
                    .inc_by(batch.len() as u64);
            }
        }

        batch.clear();
    }

    /// Final flush on shutdown, bounded so a dead sink cannot hold the
    /// process open
    async fn flush_with_grace(&self, batch: &mut Batch) {
        if batch.is_empty() {
            return;
        }
        if tokio::time::timeout(SHUTDOWN_FLUSH_GRACE, self.flush(batch))
            .await
            .is_err()
        {
            error!(
                worker = self.id,
                "Residual batch flush timed out during shutdown"
            );
        }
    }
}
