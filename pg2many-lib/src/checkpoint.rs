//! Ordered checkpoint tracking for replication feedback
//!
//! The replication client tracks every emitted log position in stream order;
//! workers mark positions done as batches land, in whatever order the sinks
//! happen to finish. The tracker folds those out-of-order completions into a
//! single monotone *safe position*: the greatest position P such that every
//! tracked position <= P has completed. That value is what gets reported
//! upstream as the standby write/flush/apply position, so the source never
//! reclaims WAL the sinks have not durably applied.

use crate::types::Lsn;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;

/// Thread-safe tracker converting out-of-order completions into a monotone
/// safe log position.
#[derive(Debug)]
pub struct CheckpointTracker {
    inner: Mutex<TrackerState>,
}

#[derive(Debug)]
struct TrackerState {
    /// Min-heap of every tracked, not-yet-retired position
    inflight: BinaryHeap<Reverse<Lsn>>,
    /// Completed positions that are not yet the contiguous prefix
    done: HashSet<Lsn>,
    safe: Lsn,
}

impl CheckpointTracker {
    /// Create a tracker whose safe position starts at `start`
    pub fn new(start: Lsn) -> Self {
        Self {
            inner: Mutex::new(TrackerState {
                inflight: BinaryHeap::new(),
                done: HashSet::new(),
                safe: start,
            }),
        }
    }

    /// Record that `lsn` is in flight. The producer calls this in strictly
    /// increasing order before handing the event downstream.
    pub fn track(&self, lsn: Lsn) {
        let mut state = self.inner.lock().unwrap();
        state.inflight.push(Reverse(lsn));
    }

    /// Record completion of `lsn` and advance the safe position across the
    /// contiguous done prefix. Completions may arrive in any order; marking
    /// the same position twice is a no-op.
    pub fn mark_done(&self, lsn: Lsn) {
        let mut state = self.inner.lock().unwrap();
        state.done.insert(lsn);

        while let Some(Reverse(min)) = state.inflight.peek().copied() {
            if !state.done.remove(&min) {
                break;
            }
            state.inflight.pop();
            state.safe = min;
        }
    }

    /// Current safe position; monotone non-decreasing across calls
    pub fn safe_lsn(&self) -> Lsn {
        self.inner.lock().unwrap().safe
    }
}
