//! A single appendable log backing part of a topic.
//!
//! Appends are serialized per partition. Each append stores the batch's
//! data first and then its metadata records in one call, so readers either
//! see the whole batch or none of it. Consumers register wake tokens and are
//! notified after every append and when the partition is marked complete.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use crossbeam::channel::{Sender, TrySendError};
use eventflux_core::{
    descriptor::DataDescriptor,
    error::{FluxError, Result},
    metadata::Data,
};
use tracing::{debug, trace, warn};

use crate::{
    EventId, NO_MORE_EVENTS,
    store::{DataStore, MetadataStore, StoredRecord},
};

/// Serialized metadata and payload of one event awaiting append.
pub type Entry = (Vec<u8>, Data);

pub struct Partition {
    topic: String,
    index: usize,
    metadata_provider: String,
    data_provider: String,
    metadata: Arc<dyn MetadataStore>,
    data: Arc<dyn DataStore>,
    append_lock: Mutex<()>,
    cursor_lock: Mutex<()>,
    watchers: Mutex<Vec<Sender<()>>>,
    complete: AtomicBool,
}

impl Partition {
    pub fn new(
        topic: &str,
        index: usize,
        metadata_provider: &str,
        data_provider: &str,
        metadata: Arc<dyn MetadataStore>,
        data: Arc<dyn DataStore>,
    ) -> Self {
        Partition {
            topic: topic.to_string(),
            index,
            metadata_provider: metadata_provider.to_string(),
            data_provider: data_provider.to_string(),
            metadata,
            data,
            append_lock: Mutex::new(()),
            cursor_lock: Mutex::new(()),
            watchers: Mutex::new(Vec::new()),
            complete: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn metadata_provider(&self) -> &str {
        &self.metadata_provider
    }

    pub fn data_provider(&self) -> &str {
        &self.data_provider
    }

    /// Id the next appended event will receive.
    pub fn next_event_id(&self) -> EventId {
        self.metadata.next_id()
    }

    /// Appends a batch and returns the id assigned to its first event.
    ///
    /// Any failure is reported as `FluxError::Dispatch` and leaves neither
    /// records nor data behind.
    pub fn append(&self, entries: Vec<Entry>) -> Result<EventId> {
        if entries.is_empty() {
            return Ok(self.next_event_id());
        }
        let count = entries.len();
        let guard = self.append_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut stored = Vec::new();
        let appended = self.write(entries, &mut stored);
        if appended.is_err() && !stored.is_empty() {
            if let Err(e) = self.data.release(&stored) {
                warn!(
                    "{}[{}]: could not release data of a failed append: {}",
                    self.topic, self.index, e
                );
            }
        }
        drop(guard);
        let first = appended.map_err(into_dispatch)?;

        debug!(
            "{}[{}]: appended {} events starting at {}",
            self.topic, self.index, count, first
        );
        self.notify();
        Ok(first)
    }

    /// Stores the data of every entry, then the records. `stored` collects
    /// the descriptors written so far.
    fn write(&self, entries: Vec<Entry>, stored: &mut Vec<DataDescriptor>) -> Result<EventId> {
        let mut records = Vec::with_capacity(entries.len());
        for (metadata, data) in entries {
            let (descriptor, digest) = if data.is_empty() {
                (DataDescriptor::null(), None)
            } else {
                let descriptor = self.data.store(&data)?;
                stored.push(descriptor.clone());
                (descriptor, Some(digest(&data)))
            };
            records.push(StoredRecord {
                metadata,
                descriptor,
                digest,
            });
        }
        self.metadata.append(records)
    }

    /// Up to `max` records starting at `from`. Failures are reported as
    /// `FluxError::Dispatch`.
    pub fn read(&self, from: EventId, max: usize) -> Result<Vec<(EventId, StoredRecord)>> {
        self.metadata.read(from, max).map_err(into_dispatch)
    }

    /// Copies the selected bytes into the caller's buffers.
    pub fn load(&self, descriptor: &DataDescriptor, buffers: &mut [Vec<u8>]) -> Result<()> {
        self.data.load(descriptor, buffers)
    }

    /// First id not yet acknowledged by `consumer`.
    pub fn cursor(&self, consumer: &str) -> Result<EventId> {
        self.metadata.load_cursor(consumer)
    }

    /// Moves `consumer`'s cursor past `id`. Acknowledgement is cumulative:
    /// every id up to and including `id` counts as acknowledged, and the
    /// cursor never moves backwards.
    pub fn acknowledge(&self, consumer: &str, id: EventId) -> Result<()> {
        if id == NO_MORE_EVENTS {
            return Err(FluxError::NoMoreEvents);
        }
        let next = self.next_event_id();
        if id >= next {
            return Err(FluxError::InvalidArgument(format!(
                "{}[{}]: cannot acknowledge event {id}, log ends at {next}",
                self.topic, self.index
            )));
        }
        let _guard = self.cursor_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.metadata.load_cursor(consumer)?;
        if id + 1 > current {
            self.metadata.store_cursor(consumer, id + 1)?;
            trace!("{}[{}]: {} acknowledged through {}", self.topic, self.index, consumer, id);
        }
        Ok(())
    }

    /// Registers a wake token sender notified on append and completion.
    pub fn watch(&self, waker: Sender<()>) {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(waker);
    }

    /// Declares that no further events will be appended.
    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
        debug!("{}[{}]: marked complete", self.topic, self.index);
        self.notify();
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    fn notify(&self) {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        // A full channel already holds a pending token.
        watchers.retain(|w| !matches!(w.try_send(()), Err(TrySendError::Disconnected(_))));
    }
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("topic", &self.topic)
            .field("index", &self.index)
            .field("metadata_provider", &self.metadata_provider)
            .field("data_provider", &self.data_provider)
            .field("next_event_id", &self.next_event_id())
            .field("complete", &self.is_complete())
            .finish()
    }
}

fn into_dispatch(e: FluxError) -> FluxError {
    match e {
        FluxError::Dispatch(_) => e,
        other => FluxError::Dispatch(other.to_string()),
    }
}

/// blake3 digest over all segments, in order.
pub fn digest(data: &Data) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for segment in data.segments() {
        hasher.update(segment);
    }
    *hasher.finalize().as_bytes()
}
