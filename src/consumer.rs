//! Consumers: partition fan-in, data selection and delivery.
//!
//! This module provides:
//! - `ConsumerOptions`: prefetch size, pool size, integrity checking, the
//!   partitions to read and the `DataSelector` / `DataBroker` pair.
//! - `Consumer`: `pull`, returning a `Future<Event>`, and `process`, a
//!   pull loop driving a caller-supplied processor.
//! - `ConsumerMeta`: shared delivery counters.
//!
//! For every event the consumer deserializes its metadata, asks the data
//! selector which part of the stored data to fetch, asks the data broker
//! for buffers of exactly that size and copies the selected bytes into
//! them. A selector or broker error or panic fails that event with
//! `FluxError::Callback`. The failed event is skipped by this consumer but
//! its cursor does not move, so a later consumer under the same name sees
//! it again. A partition that cannot be read fails the pull with
//! `FluxError::Dispatch` and is read again from the same id next time.
//!
//! Each partition has at most one fetch in flight, so events of one
//! partition are delivered in id order. Partitions are interleaved.
//! With a pool of N>0 threads a named fetcher thread prefetches in the
//! background, woken by partition appends. With 0 threads fetching happens
//! inside `pull` and inside `Future::wait`.

use std::{
    collections::VecDeque,
    fmt,
    ops::ControlFlow,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::{
    channel::{Receiver, Sender, bounded},
    select,
};
use eventflux_core::{
    config::{BatchSize, ConsumerConfig},
    descriptor::DataDescriptor,
    error::{BoxError, FluxError, Result},
    future::{Future, Promise, promise},
    metadata::{Data, Metadata},
    pool::WorkerPool,
};
use tracing::{debug, error, trace, warn};

use crate::{
    EventId,
    event::{AckHandle, Event},
    partition::{self, Partition},
    store::StoredRecord,
    topic::Topic,
};

/// Chooses the part of an event's data to fetch. Returning
/// `DataDescriptor::null()` skips the data entirely.
pub type DataSelector = Arc<
    dyn Fn(&Metadata, &DataDescriptor) -> std::result::Result<DataDescriptor, BoxError>
        + Send
        + Sync,
>;

/// Allocates destination buffers for the selected bytes. The buffers'
/// lengths must add up to the selected size.
pub type DataBroker = Arc<
    dyn Fn(&Metadata, &DataDescriptor) -> std::result::Result<Vec<Vec<u8>>, BoxError>
        + Send
        + Sync,
>;

/// Upper bound on one fetch when the batch size is adaptive.
const ADAPTIVE_FETCH_LIMIT: usize = 1024;

/// How long an idle fetcher or inline waiter sleeps between checks.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn select_everything(
    _metadata: &Metadata,
    descriptor: &DataDescriptor,
) -> std::result::Result<DataDescriptor, BoxError> {
    Ok(descriptor.clone())
}

fn single_buffer(
    _metadata: &Metadata,
    descriptor: &DataDescriptor,
) -> std::result::Result<Vec<Vec<u8>>, BoxError> {
    Ok(vec![vec![0; descriptor.size() as usize]])
}

#[derive(Clone)]
pub struct ConsumerOptions {
    pub batch_size: BatchSize,
    pub thread_count: usize,
    /// Verify fully fetched data against the digest recorded at append.
    pub check_data: bool,
    /// Partition indices to read; all partitions when `None`.
    pub targets: Option<Vec<usize>>,
    pub data_selector: DataSelector,
    pub data_broker: DataBroker,
}

impl From<&ConsumerConfig> for ConsumerOptions {
    fn from(config: &ConsumerConfig) -> Self {
        ConsumerOptions {
            batch_size: config.batch_size,
            thread_count: config.thread_count,
            check_data: config.check_data,
            targets: None,
            data_selector: Arc::new(select_everything),
            data_broker: Arc::new(single_buffer),
        }
    }
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions::from(&ConsumerConfig::default())
    }
}

impl ConsumerOptions {
    pub fn batch_size(mut self, batch_size: BatchSize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn thread_count(mut self, threads: usize) -> Self {
        self.thread_count = threads;
        self
    }

    pub fn check_data(mut self, check: bool) -> Self {
        self.check_data = check;
        self
    }

    pub fn targets(mut self, partitions: Vec<usize>) -> Self {
        self.targets = Some(partitions);
        self
    }

    pub fn data_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&Metadata, &DataDescriptor) -> std::result::Result<DataDescriptor, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.data_selector = Arc::new(selector);
        self
    }

    pub fn data_broker<F>(mut self, broker: F) -> Self
    where
        F: Fn(&Metadata, &DataDescriptor) -> std::result::Result<Vec<Vec<u8>>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.data_broker = Arc::new(broker);
        self
    }
}

impl fmt::Debug for ConsumerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerOptions")
            .field("batch_size", &self.batch_size)
            .field("thread_count", &self.thread_count)
            .field("check_data", &self.check_data)
            .field("targets", &self.targets)
            .finish_non_exhaustive()
    }
}

/// Counters shared with anyone holding a clone.
#[derive(Debug, Clone, Default)]
pub struct ConsumerMeta {
    pub events_delivered: Arc<AtomicUsize>,
    pub callback_failures: Arc<AtomicUsize>,
    pub integrity_failures: Arc<AtomicUsize>,
}

/// Read position of this consumer instance on one partition.
struct Slot {
    partition: Arc<Partition>,
    /// Next id to fetch. Starts at the acknowledged cursor.
    next: AtomicU64,
    /// A fetch for this partition is in flight.
    busy: AtomicBool,
}

/// Outcome of one `fetch_round`.
#[derive(Default)]
struct Round {
    started: bool,
    /// Last read failure; the failed partition keeps its position.
    failure: Option<FluxError>,
}

#[derive(Default)]
struct Mailbox {
    ready: VecDeque<Result<Event>>,
    waiting: VecDeque<Promise<Event>>,
}

struct ConsumerInner {
    name: Arc<str>,
    topic: Arc<Topic>,
    slots: Vec<Arc<Slot>>,
    pool: WorkerPool,
    batch_size: BatchSize,
    check_data: bool,
    selector: DataSelector,
    broker: DataBroker,
    mailbox: Mutex<Mailbox>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    rotation: AtomicUsize,
    meta: ConsumerMeta,
}

pub struct Consumer {
    inner: Arc<ConsumerInner>,
    fetcher: Option<(Sender<()>, JoinHandle<()>)>,
}

impl Consumer {
    pub(crate) fn new(topic: Arc<Topic>, name: &str, options: ConsumerOptions) -> Result<Self> {
        if name.is_empty() {
            return Err(FluxError::InvalidArgument("consumer name must not be empty".into()));
        }
        let all = topic.partitions();
        let partitions = match &options.targets {
            None => all,
            Some(targets) => targets
                .iter()
                .map(|&index| {
                    all.get(index).cloned().ok_or_else(|| {
                        FluxError::InvalidArgument(format!(
                            "topic {} has no partition {index}",
                            topic.name()
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let (wake_tx, wake_rx) = bounded(1);
        let mut slots = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let cursor = partition.cursor(name)?;
            partition.watch(wake_tx.clone());
            slots.push(Arc::new(Slot {
                partition,
                next: AtomicU64::new(cursor),
                busy: AtomicBool::new(false),
            }));
        }

        let inner = Arc::new(ConsumerInner {
            name: name.into(),
            pool: WorkerPool::new(&format!("consumer-{name}"), options.thread_count),
            topic,
            slots,
            batch_size: options.batch_size,
            check_data: options.check_data,
            selector: options.data_selector,
            broker: options.data_broker,
            mailbox: Mutex::new(Mailbox::default()),
            wake_tx,
            wake_rx,
            rotation: AtomicUsize::new(0),
            meta: ConsumerMeta::default(),
        });
        let fetcher = if inner.pool.is_inline() {
            None
        } else {
            Some(spawn_fetcher(&inner)?)
        };
        debug!(
            "consumer {} on {}: partitions={:?}, batch_size={}, threads={}",
            inner.name,
            inner.topic.name(),
            inner.partitions(),
            inner.batch_size,
            inner.pool.threads()
        );
        Ok(Consumer { inner, fetcher })
    }

    /// Next event from the assigned partitions.
    ///
    /// Resolves to the `NO_MORE_EVENTS` sentinel once every assigned
    /// partition is complete and drained, to `FluxError::Callback` for
    /// an event whose selector or broker failed, and to
    /// `FluxError::Dispatch` when a partition read fails.
    pub fn pull(&self) -> Future<Event> {
        let inner = &self.inner;
        if inner.pool.is_inline() {
            if let Some(ready) = inner.try_next() {
                return Future::ready(ready);
            }
            let inner = inner.clone();
            return Future::deferred(move || inner.wait_next());
        }

        let (promise, future) = promise();
        {
            let mut mailbox = inner.lock_mailbox();
            if let Some(ready) = mailbox.ready.pop_front() {
                return Future::ready(ready);
            }
            if inner.drained() {
                return Future::ready(Ok(Event::no_more_events()));
            }
            mailbox.waiting.push_back(promise);
        }
        inner.wake();
        future
    }

    /// Pulls events into `processor` until it breaks, `limit` events have
    /// been processed, or the stream ends. Returns the number of events
    /// processed.
    ///
    /// Events that fail to fetch are skipped. A `FluxError::Dispatch`
    /// failure ends the loop with that error.
    pub fn process<F>(&self, mut processor: F, limit: Option<usize>) -> Result<usize>
    where
        F: FnMut(Event) -> ControlFlow<()>,
    {
        let mut processed = 0;
        while limit.is_none_or(|l| processed < l) {
            let event = match self.pull().wait() {
                Ok(event) => event,
                Err(e @ (FluxError::Cancellation | FluxError::Dispatch(_))) => return Err(e),
                Err(e) => {
                    debug!("{}: skipping event: {}", self.inner.name, e);
                    continue;
                }
            };
            if event.is_no_more_events() {
                break;
            }
            processed += 1;
            if processor(event).is_break() {
                break;
            }
        }
        Ok(processed)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn topic(&self) -> &str {
        self.inner.topic.name()
    }

    /// Indices of the partitions this consumer reads.
    pub fn partitions(&self) -> Vec<usize> {
        self.inner.partitions()
    }

    pub fn meta(&self) -> &ConsumerMeta {
        &self.inner.meta
    }

    /// Events fetched but not yet pulled.
    pub fn prefetched(&self) -> usize {
        self.inner.lock_mailbox().ready.len()
    }
}

impl ConsumerInner {
    fn lock_mailbox(&self) -> std::sync::MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn partitions(&self) -> Vec<usize> {
        self.slots.iter().map(|s| s.partition.index()).collect()
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn fetch_limit(&self, available: u64) -> usize {
        let available = usize::try_from(available).unwrap_or(usize::MAX);
        match self.batch_size {
            BatchSize::Fixed(n) => n.max(1).min(available),
            BatchSize::Adaptive => available.min(ADAPTIVE_FETCH_LIMIT),
        }
    }

    /// Every assigned partition is complete and fully delivered.
    fn drained(&self) -> bool {
        self.slots.iter().all(|slot| {
            slot.partition.is_complete()
                && !slot.busy.load(Ordering::SeqCst)
                && slot.next.load(Ordering::SeqCst) >= slot.partition.next_event_id()
        })
    }

    /// Starts at most one fetch per idle partition with unread events.
    fn fetch_round(self: &Arc<Self>) -> Round {
        let mut round = Round::default();
        let count = self.slots.len();
        if count == 0 {
            return round;
        }
        let start = self.rotation.fetch_add(1, Ordering::Relaxed);
        for i in 0..count {
            let slot = &self.slots[(start + i) % count];
            let next = slot.next.load(Ordering::SeqCst);
            let end = slot.partition.next_event_id();
            if next >= end {
                continue;
            }
            if slot
                .busy
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            let records = match slot.partition.read(next, self.fetch_limit(end - next)) {
                Ok(records) if !records.is_empty() => records,
                Ok(_) => {
                    slot.busy.store(false, Ordering::SeqCst);
                    continue;
                }
                Err(e) => {
                    warn!(
                        "{}: read from {}[{}] at {} failed: {}",
                        self.name,
                        self.topic.name(),
                        slot.partition.index(),
                        next,
                        e
                    );
                    slot.busy.store(false, Ordering::SeqCst);
                    round.failure = Some(e);
                    continue;
                }
            };
            slot.next.store(next + records.len() as EventId, Ordering::SeqCst);
            trace!(
                "{}: fetched {} events from {}[{}] at {}",
                self.name,
                records.len(),
                self.topic.name(),
                slot.partition.index(),
                next
            );
            round.started = true;

            let inner = self.clone();
            let slot = slot.clone();
            self.pool.execute(move || {
                for (id, record) in records {
                    let result = inner.process_record(&slot.partition, id, record);
                    inner.deliver(result);
                }
                slot.busy.store(false, Ordering::SeqCst);
                inner.wake();
            });
        }
        round
    }

    /// Runs a caller callback, turning errors and panics into
    /// `FluxError::Callback`.
    fn callback<T>(
        &self,
        what: &str,
        f: impl FnOnce() -> std::result::Result<T, BoxError>,
    ) -> Result<T> {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => format!("{what} failed: {e}"),
            Err(_) => format!("{what} panicked"),
        };
        self.meta.callback_failures.fetch_add(1, Ordering::Relaxed);
        Err(FluxError::Callback(outcome))
    }

    fn process_record(
        &self,
        partition: &Arc<Partition>,
        id: EventId,
        record: StoredRecord,
    ) -> Result<Event> {
        let metadata = self.topic.serializer().deserialize(&record.metadata)?;
        let full = record.descriptor;

        let selected = self.callback("data selector", || (self.selector)(&metadata, &full))?;
        if !selected.is_empty() && selected.location() != full.location() {
            self.meta.callback_failures.fetch_add(1, Ordering::Relaxed);
            return Err(FluxError::Callback(format!(
                "data selector returned a view of {:?}, event {id} lives at {:?}",
                selected.location(),
                full.location()
            )));
        }

        let mut buffers = if selected.is_empty() {
            Vec::new()
        } else {
            self.callback("data broker", || (self.broker)(&metadata, &selected))?
        };
        let capacity: u64 = buffers.iter().map(|b| b.len() as u64).sum();
        if capacity != selected.size() {
            self.meta.callback_failures.fetch_add(1, Ordering::Relaxed);
            return Err(FluxError::Callback(format!(
                "data broker returned {capacity} bytes of buffers for {} selected bytes",
                selected.size()
            )));
        }
        partition.load(&selected, &mut buffers)?;
        let data = Data::new(buffers);

        if self.check_data && selected == full {
            if let Some(expected) = record.digest {
                let actual = partition::digest(&data);
                if actual != expected {
                    self.meta.integrity_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "{}: event {} of {}[{}] failed integrity check: expected {}, got {}",
                        self.name,
                        id,
                        self.topic.name(),
                        partition.index(),
                        hex::encode(&expected[..8]),
                        hex::encode(&actual[..8])
                    );
                }
            }
        }

        Ok(Event::new(
            id,
            metadata,
            full,
            data,
            AckHandle {
                partition: partition.clone(),
                consumer: self.name.clone(),
            },
        ))
    }

    /// Hands a fetched event to the oldest live waiter, or queues it.
    fn deliver(&self, result: Result<Event>) {
        if result.is_ok() {
            self.meta.events_delivered.fetch_add(1, Ordering::Relaxed);
        }
        let mut mailbox = self.lock_mailbox();
        if let Err(unclaimed) = Self::hand_off(&mut mailbox, result) {
            mailbox.ready.push_back(unclaimed);
        }
    }

    /// Completes the oldest waiter still holding its future. Gives the
    /// result back when nobody is waiting.
    fn hand_off(
        mailbox: &mut Mailbox,
        mut result: Result<Event>,
    ) -> std::result::Result<(), Result<Event>> {
        while let Some(waiter) = mailbox.waiting.pop_front() {
            match waiter.try_complete(result) {
                Ok(()) => return Ok(()),
                Err(unclaimed) => result = unclaimed,
            }
        }
        Err(result)
    }

    /// Inline pull: whatever is ready, after fetching if needed.
    fn try_next(self: &Arc<Self>) -> Option<Result<Event>> {
        loop {
            if let Some(ready) = self.lock_mailbox().ready.pop_front() {
                return Some(ready);
            }
            let round = self.fetch_round();
            if round.started {
                continue;
            }
            if let Some(e) = round.failure {
                return Some(Err(e));
            }
            if self.drained() {
                return Some(Ok(Event::no_more_events()));
            }
            return None;
        }
    }

    /// Inline wait: blocks for appends until an event is available.
    fn wait_next(self: &Arc<Self>) -> Result<Event> {
        loop {
            if let Some(ready) = self.try_next() {
                return ready;
            }
            let _ = self.wake_rx.recv_timeout(POLL_INTERVAL);
        }
    }

    /// One fetcher iteration: prefetch, then release waiters on a read
    /// failure or at end of stream.
    fn pump(self: &Arc<Self>) {
        let wanted = {
            let mailbox = self.lock_mailbox();
            !mailbox.waiting.is_empty() || mailbox.ready.len() < self.fetch_limit(u64::MAX)
        };
        let round = if wanted { self.fetch_round() } else { Round::default() };
        let mut mailbox = self.lock_mailbox();
        if let Some(e) = round.failure {
            if mailbox.ready.is_empty() {
                // Dropped when nobody waits; the next pull reads again.
                let _ = Self::hand_off(&mut mailbox, Err(e));
            }
        }
        if mailbox.ready.is_empty() && !mailbox.waiting.is_empty() && self.drained() {
            for waiter in mailbox.waiting.drain(..) {
                waiter.set_value(Event::no_more_events());
            }
        }
    }
}

fn spawn_fetcher(inner: &Arc<ConsumerInner>) -> Result<(Sender<()>, JoinHandle<()>)> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let wake_rx = inner.wake_rx.clone();
    let weak: Weak<ConsumerInner> = Arc::downgrade(inner);
    let handle = thread::Builder::new()
        .name(format!("eventflux-fetch-{}", inner.name))
        .spawn(move || {
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(wake_rx) -> _ => {},
                    default(POLL_INTERVAL) => {},
                }
                match weak.upgrade() {
                    Some(inner) => inner.pump(),
                    None => break,
                }
            }
        })
        .map_err(|e| FluxError::InvalidArgument(format!("cannot start fetcher thread: {e}")))?;
    Ok((stop_tx, handle))
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some((stop, handle)) = self.fetcher.take() {
            let _ = stop.send(());
            if handle.join().is_err() {
                error!("{}: fetcher thread panicked", self.inner.name);
            }
        }
        self.inner.pool.join();
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.inner.name)
            .field("topic", &self.inner.topic.name())
            .field("partitions", &self.inner.partitions())
            .field("pool", &self.inner.pool)
            .finish()
    }
}
