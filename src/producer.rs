//! Producers: admission, batching, ordering and dispatch.
//!
//! This module provides:
//! - `ProducerOptions`: batch size, ordering, pool size and idle timeout.
//! - `Producer`: `push`, `push_to` and `flush`, each returning a `Future`.
//! - `ProducerMeta`: shared counters describing the producer's activity.
//!
//! Each push is admitted in three steps: validation, partition selection
//! and serialization, then enqueueing into a batch. A rejected event fails
//! only its own future. Batches are appended to their partition as a whole;
//! an append failure fails every future in the batch with
//! `FluxError::Dispatch`.
//!
//! With `Ordering::Strict` pushes are admitted in push order and all
//! batches share one queue, so they reach their partitions one at a time
//! in creation order. With `Ordering::Loose` every partition has its own
//! queue and the queues dispatch concurrently.
//!
//! A pool of 0 threads does all of this on the calling thread. With N>0
//! threads, admission and dispatch run on the pool and a linger thread
//! dispatches batches that stay idle past `max_idle`.

use std::{
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Condvar, Mutex, PoisonError, Weak,
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::{
    channel::{Sender, bounded, tick},
    select,
};
use eventflux_core::{
    config::{BatchSize, Ordering, ProducerConfig},
    error::{FluxError, Result},
    future::{Future, Promise, promise},
    metadata::{Data, Metadata},
    pool::WorkerPool,
};
use tracing::{debug, error, trace, warn};

use crate::{
    EventId,
    adaptive::{AdaptiveBatchSize, BatchObservation},
    batch::{Batch, BatchQueue, PendingEvent},
    partition::Partition,
    topic::Topic,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerOptions {
    /// Used in thread names and log lines.
    pub name: String,
    pub batch_size: BatchSize,
    pub ordering: Ordering,
    pub thread_count: usize,
    pub max_idle: Duration,
    pub adaptive_min: usize,
    pub adaptive_max: usize,
    pub target_latency: Duration,
}

impl From<&ProducerConfig> for ProducerOptions {
    fn from(config: &ProducerConfig) -> Self {
        ProducerOptions {
            name: "producer".into(),
            batch_size: config.batch_size,
            ordering: config.ordering,
            thread_count: config.thread_count,
            max_idle: config.max_idle(),
            adaptive_min: config.adaptive_min,
            adaptive_max: config.adaptive_max,
            target_latency: Duration::from_millis(config.adaptive_target_latency_ms),
        }
    }
}

impl Default for ProducerOptions {
    fn default() -> Self {
        ProducerOptions::from(&ProducerConfig::default())
    }
}

impl ProducerOptions {
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn batch_size(mut self, batch_size: BatchSize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn ordering(mut self, ordering: Ordering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn thread_count(mut self, threads: usize) -> Self {
        self.thread_count = threads;
        self
    }

    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }
}

/// Counters shared with anyone holding a clone.
#[derive(Debug, Clone, Default)]
pub struct ProducerMeta {
    pub events_pushed: Arc<AtomicUsize>,
    pub events_rejected: Arc<AtomicUsize>,
    pub batches_dispatched: Arc<AtomicUsize>,
    pub batches_failed: Arc<AtomicUsize>,
}

enum Sizing {
    Fixed(usize),
    Adaptive(Mutex<AdaptiveBatchSize>),
}

/// Admits strict-ordering pushes one ticket at a time.
#[derive(Default)]
struct Turnstile {
    turn: Mutex<u64>,
    advanced: Condvar,
}

impl Turnstile {
    fn enter(&self, ticket: u64) -> Turn<'_> {
        let mut turn = self.turn.lock().unwrap_or_else(PoisonError::into_inner);
        while *turn != ticket {
            turn = self
                .advanced
                .wait(turn)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Turn(self)
    }
}

/// Passes the turnstile on to the next ticket when dropped.
struct Turn<'a>(&'a Turnstile);

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut turn = self.0.turn.lock().unwrap_or_else(PoisonError::into_inner);
        *turn += 1;
        self.0.advanced.notify_all();
    }
}

/// Count of admissions handed to the pool but not yet enqueued.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self.idle.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

struct ProducerInner {
    name: String,
    topic: Arc<Topic>,
    ordering: Ordering,
    max_idle: Duration,
    pool: WorkerPool,
    sizing: Sizing,
    /// Keyed by partition index under loose ordering, `None` under strict.
    queues: Mutex<HashMap<Option<usize>, Arc<BatchQueue>>>,
    /// Next strict-ordering ticket. Held while submitting so tickets reach
    /// the pool in order.
    tickets: Mutex<u64>,
    turnstile: Turnstile,
    in_flight: InFlight,
    meta: ProducerMeta,
}

pub struct Producer {
    inner: Arc<ProducerInner>,
    linger: Option<(Sender<()>, JoinHandle<()>)>,
}

impl Producer {
    pub(crate) fn new(topic: Arc<Topic>, options: ProducerOptions) -> Self {
        let sizing = match options.batch_size {
            BatchSize::Fixed(n) => Sizing::Fixed(n.max(1)),
            BatchSize::Adaptive => Sizing::Adaptive(Mutex::new(AdaptiveBatchSize::new(
                options.adaptive_min,
                options.adaptive_max,
                options.target_latency,
            ))),
        };
        let max_idle = options.max_idle.max(Duration::from_millis(1));
        let inner = Arc::new(ProducerInner {
            pool: WorkerPool::new(&format!("producer-{}", options.name), options.thread_count),
            name: options.name,
            topic,
            ordering: options.ordering,
            max_idle,
            sizing,
            queues: Mutex::new(HashMap::new()),
            tickets: Mutex::new(0),
            turnstile: Turnstile::default(),
            in_flight: InFlight::default(),
            meta: ProducerMeta::default(),
        });
        let linger = if inner.pool.is_inline() {
            None
        } else {
            spawn_linger(&inner)
        };
        debug!(
            "producer {} on {}: {:?} ordering, batch_size={}, threads={}",
            inner.name,
            inner.topic.name(),
            inner.ordering,
            options.batch_size,
            inner.pool.threads()
        );
        Producer { inner, linger }
    }

    /// Submits an event. The future resolves to the event's id once its
    /// batch is appended, or to the error that rejected it.
    ///
    /// Waiting on the future flushes the producer first.
    pub fn push(&self, metadata: Metadata, data: Data) -> Future<EventId> {
        self.submit(metadata, data, None)
    }

    /// Like `push`, passing `partition` to the topic's selector as a hint.
    pub fn push_to(&self, metadata: Metadata, data: Data, partition: usize) -> Future<EventId> {
        self.submit(metadata, data, Some(partition))
    }

    /// Dispatches every pending batch. The future resolves once all of
    /// them, and every push admitted before this call, have completed.
    pub fn flush(&self) -> Future<()> {
        let targets = self.inner.flush_now();
        if targets.iter().all(|(q, t)| q.is_completed(*t)) {
            return Future::ready(Ok(()));
        }
        Future::deferred(move || {
            for (queue, target) in targets {
                queue.wait_completed(target);
            }
            Ok(())
        })
    }

    pub fn meta(&self) -> &ProducerMeta {
        &self.inner.meta
    }

    pub fn topic(&self) -> &str {
        self.inner.topic.name()
    }

    pub fn ordering(&self) -> Ordering {
        self.inner.ordering
    }

    /// Threshold the next batch will be opened with.
    pub fn batch_threshold(&self) -> usize {
        self.inner.threshold()
    }

    /// Events admitted but not yet dispatched.
    pub fn pending(&self) -> usize {
        self.inner.queues().iter().map(|q| q.pending()).sum()
    }

    fn submit(&self, metadata: Metadata, data: Data, requested: Option<usize>) -> Future<EventId> {
        if self.linger.is_none() {
            self.inner.expire_idle();
        }
        let (promise, future) = promise();
        let weak: Weak<ProducerInner> = Arc::downgrade(&self.inner);
        let future = future.on_wait(move || {
            if let Some(inner) = weak.upgrade() {
                inner.flush_now();
            }
        });

        match self.inner.ordering {
            Ordering::Strict => {
                let mut tickets = self.inner.tickets.lock().unwrap_or_else(PoisonError::into_inner);
                let ticket = *tickets;
                *tickets += 1;
                self.post(move |inner| inner.admit(metadata, data, requested, promise, Some(ticket)));
            }
            Ordering::Loose => {
                self.post(move |inner| inner.admit(metadata, data, requested, promise, None));
            }
        }
        future
    }

    fn post<F>(&self, job: F)
    where
        F: FnOnce(&Arc<ProducerInner>) + Send + 'static,
    {
        let inner = self.inner.clone();
        // Counted before the job is queued so a flush issued right after
        // this push waits for it.
        *inner.in_flight.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        self.inner.pool.execute(move || {
            let _guard = InFlightGuard(&inner.in_flight);
            job(&inner);
        });
    }
}

impl ProducerInner {
    fn threshold(&self) -> usize {
        match &self.sizing {
            Sizing::Fixed(n) => *n,
            Sizing::Adaptive(controller) => controller
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .threshold(),
        }
    }

    fn queues(&self) -> Vec<Arc<BatchQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn queue(&self, partition: usize) -> Arc<BatchQueue> {
        let key = match self.ordering {
            Ordering::Strict => None,
            Ordering::Loose => Some(partition),
        };
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert_with(|| Arc::new(BatchQueue::new()))
            .clone()
    }

    /// Validates, routes and serializes one event.
    fn prepare(
        &self,
        metadata: &Metadata,
        data: &Data,
        requested: Option<usize>,
    ) -> Result<(Arc<Partition>, Vec<u8>)> {
        self.topic.validator().validate(metadata, data)?;
        let partitions = self.topic.partitions();
        let index = self.topic.selector().select(metadata, partitions.len(), requested)?;
        let partition = partitions.get(index).cloned().ok_or_else(|| {
            FluxError::Validation(format!(
                "selector chose partition {index} of {}",
                partitions.len()
            ))
        })?;
        let bytes = self.topic.serializer().serialize(metadata)?;
        Ok((partition, bytes))
    }

    fn admit(
        self: &Arc<Self>,
        metadata: Metadata,
        data: Data,
        requested: Option<usize>,
        promise: Promise<EventId>,
        ticket: Option<u64>,
    ) {
        // A panicking policy must not stall the turnstile.
        let prepared = panic::catch_unwind(AssertUnwindSafe(|| {
            self.prepare(&metadata, &data, requested)
        }))
        .unwrap_or_else(|_| Err(FluxError::Validation("topic policy panicked".into())));
        let _turn = ticket.map(|t| self.turnstile.enter(t));
        match prepared {
            Err(e) => {
                self.meta.events_rejected.fetch_add(1, AtomicOrdering::Relaxed);
                debug!("{}: rejected {}: {}", self.name, metadata, e);
                promise.set_error(e);
            }
            Ok((partition, bytes)) => {
                self.meta.events_pushed.fetch_add(1, AtomicOrdering::Relaxed);
                let now = Instant::now();
                if let Sizing::Adaptive(controller) = &self.sizing {
                    controller
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record_push(now);
                }
                let queue = self.queue(partition.index());
                queue.push(
                    &partition,
                    PendingEvent {
                        metadata: bytes,
                        data,
                        promise,
                    },
                    self.threshold(),
                    now,
                );
                self.schedule_drain(queue);
            }
        }
    }

    /// Starts a drainer on `queue` if it has a ready batch and no drainer.
    fn schedule_drain(self: &Arc<Self>, queue: Arc<BatchQueue>) {
        let Some(first) = queue.begin_drain(Instant::now(), self.max_idle) else {
            return;
        };
        let inner = self.clone();
        self.pool.execute(move || {
            let mut next = Some(first);
            while let Some(batch) = next {
                let seq = batch.seq;
                inner.dispatch(batch);
                next = queue.finish(seq, Instant::now(), inner.max_idle);
            }
        });
    }

    fn dispatch(&self, batch: Batch) {
        let fill_time = batch.fill_time();
        let trigger = batch.trigger();
        let Batch {
            seq,
            partition,
            events,
            threshold,
            ..
        } = batch;
        let occupancy = events.len();
        let (entries, promises): (Vec<_>, Vec<_>) = events
            .into_iter()
            .map(|e| ((e.metadata, e.data), e.promise))
            .unzip();

        match partition.append(entries) {
            Ok(first) => {
                trace!(
                    "{}: batch {} ({} events, {:?}) appended to {}[{}] at {}",
                    self.name,
                    seq,
                    occupancy,
                    trigger,
                    partition.topic(),
                    partition.index(),
                    first
                );
                for (i, promise) in promises.into_iter().enumerate() {
                    promise.set_value(first + i as EventId);
                }
                self.meta.batches_dispatched.fetch_add(1, AtomicOrdering::Relaxed);
            }
            Err(e) => {
                warn!(
                    "{}: batch {} ({} events) to {}[{}] failed: {}",
                    self.name,
                    seq,
                    occupancy,
                    partition.topic(),
                    partition.index(),
                    e
                );
                for promise in promises {
                    promise.set_error(e.clone());
                }
                self.meta.batches_failed.fetch_add(1, AtomicOrdering::Relaxed);
            }
        }

        if let Sizing::Adaptive(controller) = &self.sizing {
            let next = controller
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record_dispatch(BatchObservation {
                    occupancy,
                    threshold,
                    fill_time,
                    trigger,
                });
            trace!("{}: batch threshold now {}", self.name, next);
        }
    }

    /// Seals every queue and starts drainers. Returns the completion target
    /// of each queue.
    fn flush_now(self: &Arc<Self>) -> Vec<(Arc<BatchQueue>, u64)> {
        self.in_flight.wait_idle();
        let now = Instant::now();
        self.queues()
            .into_iter()
            .map(|queue| {
                let target = queue.seal_all(now);
                self.schedule_drain(queue.clone());
                (queue, target)
            })
            .collect()
    }

    /// Starts drainers for queues whose front batch has gone idle.
    fn expire_idle(self: &Arc<Self>) {
        for queue in self.queues() {
            self.schedule_drain(queue);
        }
    }
}

fn spawn_linger(inner: &Arc<ProducerInner>) -> Option<(Sender<()>, JoinHandle<()>)> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let weak = Arc::downgrade(inner);
    let ticker = tick((inner.max_idle / 2).max(Duration::from_millis(1)));
    let spawned = thread::Builder::new()
        .name(format!("eventflux-linger-{}", inner.name))
        .spawn(move || {
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        match weak.upgrade() {
                            Some(inner) => inner.expire_idle(),
                            None => break,
                        }
                    }
                }
            }
        });
    match spawned {
        Ok(handle) => Some((stop_tx, handle)),
        Err(e) => {
            error!("{}: cannot start linger thread, idle batches wait for the next push: {}", inner.name, e);
            None
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if let Err(e) = self.flush().wait() {
            warn!("{}: final flush failed: {}", self.inner.name, e);
        }
        if let Some((stop, handle)) = self.linger.take() {
            let _ = stop.send(());
            if handle.join().is_err() {
                error!("{}: linger thread panicked", self.inner.name);
            }
        }
        self.inner.pool.join();
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("name", &self.inner.name)
            .field("topic", &self.inner.topic.name())
            .field("ordering", &self.inner.ordering)
            .field("pool", &self.inner.pool)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering::SeqCst;

    use eventflux_core::policy::{PartitionSelector, Serializer, Validator};
    use serde_json::json;

    use super::*;
    use crate::{
        service::ServiceHandle,
        store::{MemoryDataProvider, MemoryMetadataProvider},
        topic::TopicHandle,
    };

    fn topic(partitions: usize) -> (TopicHandle, Arc<MemoryDataProvider>) {
        let service = ServiceHandle::new();
        let data = MemoryDataProvider::new("d");
        service
            .register_metadata_provider(MemoryMetadataProvider::new("m"))
            .expect("register");
        service.register_data_provider(data.clone()).expect("register");
        let topic = service
            .create_topic(
                "t",
                Validator::default(),
                PartitionSelector::default(),
                Serializer::default(),
            )
            .expect("create");
        for _ in 0..partitions {
            service.add_partition("t", "m", "d").expect("add");
        }
        (topic, data)
    }

    fn fixed(n: usize) -> ProducerOptions {
        ProducerOptions::default().batch_size(BatchSize::Fixed(n))
    }

    #[test]
    fn inline_push_dispatches_when_batch_fills() {
        let (topic, _) = topic(1);
        let producer = topic.producer(fixed(2).max_idle(Duration::from_secs(3600)));
        let mut first = producer.push(Metadata::new(json!({"i": 0})), Data::empty());
        assert!(!first.completed());
        let second = producer.push(Metadata::new(json!({"i": 1})), Data::empty());
        assert!(first.completed());
        assert_eq!(first.wait().expect("id"), 0);
        assert_eq!(second.wait().expect("id"), 1);
        assert_eq!(producer.meta().batches_dispatched.load(SeqCst), 1);
    }

    #[test]
    fn waiting_flushes_a_partial_batch() {
        let (topic, _) = topic(1);
        let producer = topic.producer(fixed(100).max_idle(Duration::from_secs(3600)));
        let f = producer.push(Metadata::new(json!({"x": 1})), Data::empty());
        assert_eq!(producer.pending(), 1);
        assert_eq!(f.wait().expect("id"), 0);
        assert_eq!(producer.pending(), 0);
    }

    #[test]
    fn rejection_fails_only_that_event() {
        let (topic, _) = topic(1);
        let producer = topic.producer(fixed(3));
        let ok = producer.push(Metadata::new(json!({"a": 1})), Data::empty());
        let bad = producer.push(Metadata::new(json!([1, 2])), Data::empty());
        let out_of_range = producer.push_to(Metadata::empty(), Data::empty(), 5);
        assert!(matches!(bad.wait(), Err(FluxError::Validation(_))));
        assert!(matches!(out_of_range.wait(), Err(FluxError::Validation(_))));
        assert_eq!(ok.wait().expect("id"), 0);
        assert_eq!(producer.meta().events_rejected.load(SeqCst), 2);
        assert_eq!(producer.meta().events_pushed.load(SeqCst), 1);
    }

    #[test]
    fn dispatch_failure_fails_the_whole_batch() {
        let (topic, data) = topic(1);
        let producer = topic.producer(fixed(3));
        data.set_reachable(false);
        let futures: Vec<_> = (0..3)
            .map(|i| producer.push(Metadata::new(json!({"i": i})), Data::from(vec![i as u8])))
            .collect();
        for f in futures {
            assert!(matches!(f.wait(), Err(FluxError::Dispatch(_))));
        }
        assert_eq!(producer.meta().batches_failed.load(SeqCst), 1);
    }

    #[test]
    fn strict_threaded_producer_keeps_push_order() {
        let (topic, _) = topic(3);
        let producer = topic.producer(fixed(4).thread_count(3).ordering(Ordering::Strict));
        let futures: Vec<_> = (0..60)
            .map(|i| producer.push_to(Metadata::new(json!({"i": i})), Data::empty(), i % 3))
            .collect();
        producer.flush().wait().expect("flush");
        let mut last = [None::<EventId>; 3];
        for (i, f) in futures.into_iter().enumerate() {
            let id = f.wait().expect("id");
            if let Some(prev) = last[i % 3] {
                assert!(id > prev);
            }
            last[i % 3] = Some(id);
        }
        assert_eq!(topic.partitions().iter().map(|p| p.next_event_id).sum::<u64>(), 60);
    }

    #[test]
    fn idle_batches_are_dispatched_by_the_linger_thread() {
        let (topic, _) = topic(1);
        let producer = topic.producer(
            fixed(100)
                .thread_count(1)
                .max_idle(Duration::from_millis(5)),
        );
        let mut f = producer.push(Metadata::empty(), Data::empty());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f.completed() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(f.completed());
        assert_eq!(f.wait().expect("id"), 0);
    }

    #[test]
    fn drop_flushes_pending_batches() {
        let (topic, _) = topic(1);
        let producer = topic.producer(fixed(100).max_idle(Duration::from_secs(3600)));
        let mut f = producer.push(Metadata::empty(), Data::empty());
        drop(producer);
        assert!(f.completed());
        assert_eq!(f.wait().expect("id"), 0);
    }

    #[test]
    fn adaptive_threshold_stays_in_bounds() {
        let (topic, _) = topic(1);
        let mut options = ProducerOptions::default().batch_size(BatchSize::Adaptive);
        options.adaptive_min = 2;
        options.adaptive_max = 16;
        let producer = topic.producer(options);
        assert_eq!(producer.batch_threshold(), 2);
        for i in 0..200 {
            producer.push(Metadata::new(json!({"i": i})), Data::empty());
            let t = producer.batch_threshold();
            assert!((2..=16).contains(&t));
        }
        producer.flush().wait().expect("flush");
        assert_eq!(topic.partitions()[0].next_event_id, 200);
    }
}
