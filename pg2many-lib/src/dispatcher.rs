//! Event routing across per-partition workers
//!
//! Events are pinned to a worker by a stable 32-bit FNV-1a hash of the
//! qualified table name, so every change to one table flows through one
//! worker and reaches the sinks in source order. Ordering across tables is
//! not preserved.

use crate::checkpoint::CheckpointTracker;
use crate::config::PipelineConfig;
use crate::sinks::Sink;
use crate::types::ChangeEvent;
use crate::worker::Worker;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Dispatcher {
    inputs: Vec<mpsc::Sender<ChangeEvent>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Construct and launch the worker pool
    pub fn spawn(
        config: &PipelineConfig,
        sink: Arc<dyn Sink>,
        tracker: Arc<CheckpointTracker>,
        shutdown: CancellationToken,
    ) -> Self {
        let worker_count = config.worker_count.max(1);
        let mut inputs = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
            let worker = Worker::new(
                id,
                config.batch_size.max(1),
                config.batch_interval,
                rx,
                sink.clone(),
                tracker.clone(),
                shutdown.clone(),
            );
            inputs.push(tx);
            workers.push(tokio::spawn(worker.run()));
        }

        info!(workers = worker_count, "Dispatcher started");
        Self { inputs, workers }
    }

    /// Forward events from the inbound channel to workers until the channel
    /// closes, then close the worker inputs and wait for them to drain.
    pub async fn run(self, mut input: mpsc::Receiver<ChangeEvent>) {
        let worker_count = self.inputs.len();

        while let Some(event) = input.recv().await {
            let index = (fnv1a_32(&event.qualified_table()) as usize) % worker_count;
            if self.inputs[index].send(event).await.is_err() {
                // Worker gone; shutdown is already in progress
                break;
            }
        }

        debug!("Event channel closed, draining workers");
        drop(self.inputs);
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("Dispatcher stopped");
    }
}

/// Stable 32-bit FNV-1a hash used as the partitioning function
pub fn fnv1a_32(key: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET_BASIS;
    for byte in key.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_reference_vectors() {
        // Reference values of the 32-bit FNV-1a function
        assert_eq!(fnv1a_32(""), 0x811c_9dc5);
        assert_eq!(fnv1a_32("a"), 0xe40c_292c);
        assert_eq!(fnv1a_32("foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_hash_is_stable_per_table() {
        let first = fnv1a_32("public.users");
        let second = fnv1a_32("public.users");
        assert_eq!(first, second);
        assert_ne!(fnv1a_32("public.users"), fnv1a_32("public.orders"));
    }
}
