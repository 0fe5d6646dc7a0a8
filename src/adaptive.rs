//! Feedback controller choosing the producer's batch threshold.
//!
//! Inputs are the spacing between pushes and, for every dispatched batch,
//! how full it was, how long it took to fill and what triggered the
//! dispatch. The output is the threshold for the next batch, always within
//! `[min, max]`.
//!
//! Rules, applied per dispatched batch:
//! - Filled to the threshold within the target latency: double it.
//! - Filled to the threshold but slowly: scale it down by
//!   `target_latency / fill_time`.
//! - Dispatched by idle timeout or flush while less than half full: halve it.
//! - Otherwise keep it. Batches closed early by a push for another
//!   partition say nothing about the push rate and leave it unchanged.
//!
//! Once the push interval is known, the threshold is also capped at twice
//! the number of pushes expected within the target latency.

use std::time::{Duration, Instant};

/// EWMA weight given to the newest push interval.
const SMOOTHING: f64 = 0.2;

/// What caused a batch to be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The batch reached its threshold.
    Full,
    /// An explicit flush, or a wait on one of its futures.
    Flush,
    /// The batch sat unfilled for longer than the idle timeout.
    Idle,
    /// A push for another partition closed the batch early.
    Rotated,
}

/// One dispatched batch as seen by the controller.
#[derive(Debug, Clone, Copy)]
pub struct BatchObservation {
    pub occupancy: usize,
    pub threshold: usize,
    /// Time from the first push into the batch until it was sealed.
    pub fill_time: Duration,
    pub trigger: FlushTrigger,
}

#[derive(Debug, Clone)]
pub struct AdaptiveBatchSize {
    min: usize,
    max: usize,
    target_latency: Duration,
    threshold: usize,
    push_interval: Option<f64>,
    last_push: Option<Instant>,
}

impl AdaptiveBatchSize {
    /// Starts at `min`. A `max` below `min` is raised to `min`, and `min`
    /// is at least 1.
    pub fn new(min: usize, max: usize, target_latency: Duration) -> Self {
        let min = min.max(1);
        AdaptiveBatchSize {
            min,
            max: max.max(min),
            target_latency,
            threshold: min,
            push_interval: None,
            last_push: None,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.min, self.max)
    }

    /// Smoothed interval between pushes, once two pushes have been seen.
    pub fn push_interval(&self) -> Option<Duration> {
        self.push_interval.map(Duration::from_secs_f64)
    }

    pub fn record_push(&mut self, at: Instant) {
        if let Some(last) = self.last_push {
            let sample = at.saturating_duration_since(last).as_secs_f64();
            self.push_interval = Some(match self.push_interval {
                Some(avg) => avg + SMOOTHING * (sample - avg),
                None => sample,
            });
        }
        self.last_push = Some(at);
    }

    /// Feeds one dispatched batch and returns the next threshold.
    pub fn record_dispatch(&mut self, observation: BatchObservation) -> usize {
        let target = self.target_latency.as_secs_f64();
        let fill = observation.fill_time.as_secs_f64();
        let current = observation.threshold.max(1) as f64;

        let mut next = match observation.trigger {
            FlushTrigger::Full if fill <= target => current * 2.0,
            FlushTrigger::Full => current * (target / fill),
            FlushTrigger::Idle | FlushTrigger::Flush
                if observation.occupancy * 2 < observation.threshold =>
            {
                current / 2.0
            }
            _ => current,
        };

        if let Some(interval) = self.push_interval.filter(|i| *i > 0.0) {
            next = next.min(2.0 * target / interval);
        }

        self.threshold = (next.round() as usize).clamp(self.min, self.max);
        self.threshold
    }
}
