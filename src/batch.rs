//! Producer-side batch queues.
//!
//! A `BatchQueue` is an ordered list of batches, each bound to one
//! partition. Pushes extend the newest batch while it targets the same
//! partition and is below its threshold; otherwise a new batch is opened.
//!
//! Batches leave the queue strictly front to back, one at a time: a single
//! drainer holds the queue between `begin_drain` and the `finish` call that
//! returns `None`. A batch is ready when any of these holds:
//! - it reached its threshold,
//! - a newer batch was opened behind it,
//! - it was sealed by a flush,
//! - it has been open longer than the idle timeout.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use eventflux_core::{future::Promise, metadata::Data};

use crate::{EventId, adaptive::FlushTrigger, partition::Partition};

/// An admitted event waiting for its batch to be appended.
pub(crate) struct PendingEvent {
    pub(crate) metadata: Vec<u8>,
    pub(crate) data: Data,
    pub(crate) promise: Promise<EventId>,
}

pub(crate) struct Batch {
    pub(crate) seq: u64,
    pub(crate) partition: Arc<Partition>,
    pub(crate) events: Vec<PendingEvent>,
    pub(crate) threshold: usize,
    pub(crate) created: Instant,
    pub(crate) sealed: Option<(Instant, FlushTrigger)>,
}

impl Batch {
    fn accepts(&self, partition: &Arc<Partition>) -> bool {
        self.sealed.is_none()
            && self.events.len() < self.threshold
            && Arc::ptr_eq(&self.partition, partition)
    }

    fn seal(&mut self, now: Instant, trigger: FlushTrigger) {
        if self.sealed.is_none() {
            self.sealed = Some((now, trigger));
        }
    }

    /// Time spent filling, up to sealing.
    pub(crate) fn fill_time(&self) -> Duration {
        self.sealed
            .map(|(at, _)| at.saturating_duration_since(self.created))
            .unwrap_or_default()
    }

    pub(crate) fn trigger(&self) -> FlushTrigger {
        self.sealed.map_or(FlushTrigger::Flush, |(_, t)| t)
    }
}

#[derive(Default)]
struct QueueState {
    batches: VecDeque<Batch>,
    next_seq: u64,
    /// Batches with `seq < completed` have been dispatched.
    completed: u64,
    draining: bool,
}

impl QueueState {
    /// Seals and pops the front batch if it may be dispatched.
    fn pop_ready(&mut self, now: Instant, max_idle: Duration) -> Option<Batch> {
        let front = self.batches.front_mut()?;
        if front.sealed.is_none() && now.saturating_duration_since(front.created) >= max_idle {
            front.seal(now, FlushTrigger::Idle);
        }
        if front.sealed.is_some() {
            self.batches.pop_front()
        } else {
            None
        }
    }
}

#[derive(Default)]
pub(crate) struct BatchQueue {
    state: Mutex<QueueState>,
    progress: Condvar,
}

impl BatchQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an event for `partition`, opening a new batch with `threshold`
    /// when the newest one cannot take it.
    pub(crate) fn push(
        &self,
        partition: &Arc<Partition>,
        event: PendingEvent,
        threshold: usize,
        now: Instant,
    ) {
        let mut state = self.lock();
        let reuse = state.batches.back().is_some_and(|b| b.accepts(partition));
        if !reuse {
            if let Some(back) = state.batches.back_mut() {
                let trigger = if back.events.len() >= back.threshold {
                    FlushTrigger::Full
                } else {
                    FlushTrigger::Rotated
                };
                back.seal(now, trigger);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.batches.push_back(Batch {
                seq,
                partition: partition.clone(),
                events: Vec::with_capacity(threshold.min(1024)),
                threshold: threshold.max(1),
                created: now,
                sealed: None,
            });
        }
        if let Some(back) = state.batches.back_mut() {
            back.events.push(event);
            if back.events.len() >= back.threshold {
                back.seal(now, FlushTrigger::Full);
            }
        }
    }

    /// Claims the queue for draining and returns its first ready batch.
    /// Returns `None` if another drainer holds the queue or nothing is
    /// ready.
    pub(crate) fn begin_drain(&self, now: Instant, max_idle: Duration) -> Option<Batch> {
        let mut state = self.lock();
        if state.draining {
            return None;
        }
        let batch = state.pop_ready(now, max_idle)?;
        state.draining = true;
        Some(batch)
    }

    /// Records the dispatched batch as complete and hands the drainer the
    /// next ready batch, or releases the queue.
    pub(crate) fn finish(&self, batch_seq: u64, now: Instant, max_idle: Duration) -> Option<Batch> {
        let mut state = self.lock();
        state.completed = state.completed.max(batch_seq + 1);
        self.progress.notify_all();
        let next = state.pop_ready(now, max_idle);
        if next.is_none() {
            state.draining = false;
        }
        next
    }

    /// Seals every open batch. Returns the sequence number that
    /// `wait_completed` must reach for all of them to be dispatched.
    pub(crate) fn seal_all(&self, now: Instant) -> u64 {
        let mut state = self.lock();
        for batch in state.batches.iter_mut() {
            batch.seal(now, FlushTrigger::Flush);
        }
        state.next_seq
    }

    pub(crate) fn is_completed(&self, target: u64) -> bool {
        self.lock().completed >= target
    }

    /// Blocks until every batch with `seq < target` has been dispatched.
    pub(crate) fn wait_completed(&self, target: u64) {
        let mut state = self.lock();
        while state.completed < target {
            state = self
                .progress
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of events still buffered.
    pub(crate) fn pending(&self) -> usize {
        self.lock().batches.iter().map(|b| b.events.len()).sum()
    }
}

impl fmt::Debug for BatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("BatchQueue")
            .field("batches", &state.batches.len())
            .field("next_seq", &state.next_seq)
            .field("completed", &state.completed)
            .field("draining", &state.draining)
            .finish()
    }
}
