//! Storage provider interfaces and in-memory reference providers.
//!
//! This module defines:
//! - `MetadataStore` / `DataStore`: the per-partition append, read and
//!   transfer primitives the engine consumes.
//! - `MetadataProvider` / `DataProvider`: addressable services that hand out
//!   per-partition stores and report whether they are reachable.
//! - `MemoryMetadataProvider` / `MemoryDataProvider`: process-local
//!   implementations used for embedding and tests. They keep everything in
//!   memory and can simulate outages and capacity limits.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use eventflux_core::{
    descriptor::{DataDescriptor, Location},
    error::{FluxError, Result},
    metadata::Data,
};
use tracing::{trace, warn};

use crate::EventId;

/// One event as kept by a metadata store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Metadata as produced by the topic's serializer.
    pub metadata: Vec<u8>,
    /// Full descriptor of the event's data.
    pub descriptor: DataDescriptor,
    /// blake3 digest of the data, when there is any.
    pub digest: Option<[u8; 32]>,
}

/// Ordered record log plus named consumer cursors for one partition.
pub trait MetadataStore: Send + Sync + fmt::Debug {
    /// Appends all records atomically and returns the id of the first one.
    /// Ids are contiguous.
    fn append(&self, records: Vec<StoredRecord>) -> Result<EventId>;

    /// Up to `max` records starting at id `from`.
    fn read(&self, from: EventId, max: usize) -> Result<Vec<(EventId, StoredRecord)>>;

    /// Id the next appended record will receive.
    fn next_id(&self) -> EventId;

    /// First unacknowledged id for `consumer`; 0 when unknown.
    fn load_cursor(&self, consumer: &str) -> Result<EventId>;

    fn store_cursor(&self, consumer: &str, next: EventId) -> Result<()>;

    fn is_reachable(&self) -> bool;
}

/// Out-of-line byte storage for one partition.
pub trait DataStore: Send + Sync + fmt::Debug {
    /// Stores all segments contiguously and returns a descriptor for them.
    fn store(&self, data: &Data) -> Result<DataDescriptor>;

    /// Copies the bytes selected by `descriptor` into `buffers`, filling
    /// them in order. The buffers' total length must equal the descriptor's
    /// size.
    fn load(&self, descriptor: &DataDescriptor, buffers: &mut [Vec<u8>]) -> Result<()>;

    /// Gives back space taken by `descriptors`, returned by `store` for an
    /// append that did not complete. Nothing else refers to them.
    fn release(&self, descriptors: &[DataDescriptor]) -> Result<()>;

    fn is_reachable(&self) -> bool;
}

pub trait MetadataProvider: Send + Sync + fmt::Debug {
    fn address(&self) -> &str;
    fn is_reachable(&self) -> bool;
    /// Opens (or creates) the store backing `topic`'s partition `index`.
    fn open(&self, topic: &str, index: usize) -> Result<Arc<dyn MetadataStore>>;
}

pub trait DataProvider: Send + Sync + fmt::Debug {
    fn address(&self) -> &str;
    fn is_reachable(&self) -> bool;
    fn open(&self, topic: &str, index: usize) -> Result<Arc<dyn DataStore>>;
}

fn unreachable_error(address: &str) -> FluxError {
    FluxError::Dispatch(format!("provider {address:?} is unreachable"))
}

/// Shared on/off switch used to simulate a provider outage.
#[derive(Debug, Clone)]
struct Reachability(Arc<AtomicBool>);

impl Reachability {
    fn new() -> Self {
        Reachability(Arc::new(AtomicBool::new(true)))
    }

    fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, up: bool) {
        self.0.store(up, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MemoryMetadataProvider {
    address: String,
    reachable: Reachability,
    stores: Mutex<HashMap<(String, usize), Arc<MemoryMetadataStore>>>,
}

impl MemoryMetadataProvider {
    pub fn new(address: &str) -> Arc<Self> {
        Arc::new(MemoryMetadataProvider {
            address: address.to_string(),
            reachable: Reachability::new(),
            stores: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_reachable(&self, up: bool) {
        self.reachable.set(up);
    }
}

impl MetadataProvider for MemoryMetadataProvider {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_reachable(&self) -> bool {
        self.reachable.get()
    }

    fn open(&self, topic: &str, index: usize) -> Result<Arc<dyn MetadataStore>> {
        if !self.is_reachable() {
            return Err(unreachable_error(&self.address));
        }
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        let store = stores
            .entry((topic.to_string(), index))
            .or_insert_with(|| {
                Arc::new(MemoryMetadataStore {
                    address: self.address.clone(),
                    reachable: self.reachable.clone(),
                    records: RwLock::new(Vec::new()),
                    cursors: Mutex::new(HashMap::new()),
                })
            })
            .clone();
        Ok(store)
    }
}

#[derive(Debug)]
pub struct MemoryMetadataStore {
    address: String,
    reachable: Reachability,
    records: RwLock<Vec<StoredRecord>>,
    cursors: Mutex<HashMap<String, EventId>>,
}

impl MemoryMetadataStore {
    fn check(&self) -> Result<()> {
        if self.reachable.get() {
            Ok(())
        } else {
            Err(unreachable_error(&self.address))
        }
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn append(&self, records: Vec<StoredRecord>) -> Result<EventId> {
        self.check()?;
        let mut log = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let first = log.len() as EventId;
        log.extend(records);
        Ok(first)
    }

    fn read(&self, from: EventId, max: usize) -> Result<Vec<(EventId, StoredRecord)>> {
        self.check()?;
        let log = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let start = usize::try_from(from).unwrap_or(usize::MAX).min(log.len());
        Ok(log[start..]
            .iter()
            .take(max)
            .enumerate()
            .map(|(i, r)| (from + i as EventId, r.clone()))
            .collect())
    }

    fn next_id(&self) -> EventId {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as EventId
    }

    fn load_cursor(&self, consumer: &str) -> Result<EventId> {
        self.check()?;
        let cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(cursors.get(consumer).copied().unwrap_or(0))
    }

    fn store_cursor(&self, consumer: &str, next: EventId) -> Result<()> {
        self.check()?;
        self.cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(consumer.to_string(), next);
        Ok(())
    }

    fn is_reachable(&self) -> bool {
        self.reachable.get()
    }
}

#[derive(Debug)]
pub struct MemoryDataProvider {
    address: String,
    reachable: Reachability,
    capacity: Option<u64>,
    stores: Mutex<HashMap<(String, usize), Arc<MemoryDataStore>>>,
}

impl MemoryDataProvider {
    pub fn new(address: &str) -> Arc<Self> {
        Self::build(address, None)
    }

    /// Provider whose stores each refuse writes past `capacity` bytes.
    pub fn with_capacity(address: &str, capacity: u64) -> Arc<Self> {
        Self::build(address, Some(capacity))
    }

    fn build(address: &str, capacity: Option<u64>) -> Arc<Self> {
        Arc::new(MemoryDataProvider {
            address: address.to_string(),
            reachable: Reachability::new(),
            capacity,
            stores: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_reachable(&self, up: bool) {
        self.reachable.set(up);
    }
}

impl DataProvider for MemoryDataProvider {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_reachable(&self) -> bool {
        self.reachable.get()
    }

    fn open(&self, topic: &str, index: usize) -> Result<Arc<dyn DataStore>> {
        if !self.is_reachable() {
            return Err(unreachable_error(&self.address));
        }
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        let store = stores
            .entry((topic.to_string(), index))
            .or_insert_with(|| {
                Arc::new(MemoryDataStore {
                    address: self.address.clone(),
                    reachable: self.reachable.clone(),
                    capacity: self.capacity,
                    region: RwLock::new(Vec::new()),
                })
            })
            .clone();
        Ok(store)
    }
}

/// One growable byte region. A location is the little-endian start offset
/// of an event's bytes within it.
#[derive(Debug)]
pub struct MemoryDataStore {
    address: String,
    reachable: Reachability,
    capacity: Option<u64>,
    region: RwLock<Vec<u8>>,
}

impl MemoryDataStore {
    fn base_offset(location: &Location) -> Result<u64> {
        let bytes: [u8; 8] = location.as_bytes().try_into().map_err(|_| {
            FluxError::InvalidArgument(format!("{location:?} is not a memory store location"))
        })?;
        Ok(u64::from_le_bytes(bytes))
    }
}

impl DataStore for MemoryDataStore {
    fn store(&self, data: &Data) -> Result<DataDescriptor> {
        if !self.reachable.get() {
            return Err(unreachable_error(&self.address));
        }
        let size = data.size();
        if size == 0 {
            return Ok(DataDescriptor::null());
        }
        let mut region = self.region.write().unwrap_or_else(PoisonError::into_inner);
        let start = region.len() as u64;
        if let Some(cap) = self.capacity {
            if start + size > cap {
                return Err(FluxError::Dispatch(format!(
                    "data store {:?} capacity exceeded: {} + {} > {}",
                    self.address, start, size, cap
                )));
            }
        }
        for segment in data.segments() {
            region.extend_from_slice(segment);
        }
        trace!("stored {} bytes at offset {}", size, start);
        Ok(DataDescriptor::new(Location::new(start.to_le_bytes().to_vec()), size))
    }

    fn load(&self, descriptor: &DataDescriptor, buffers: &mut [Vec<u8>]) -> Result<()> {
        if !self.reachable.get() {
            return Err(unreachable_error(&self.address));
        }
        let capacity: u64 = buffers.iter().map(|b| b.len() as u64).sum();
        if capacity != descriptor.size() {
            return Err(FluxError::InvalidArgument(format!(
                "buffers hold {capacity} bytes but descriptor selects {}",
                descriptor.size()
            )));
        }
        if descriptor.is_empty() {
            return Ok(());
        }
        let base = Self::base_offset(descriptor.location())?;
        let region = self.region.read().unwrap_or_else(PoisonError::into_inner);

        let mut writer = ScatterWriter::new(buffers);
        for extent in descriptor.extents() {
            let start = base + extent.offset;
            let end = start + extent.len;
            if end > region.len() as u64 {
                return Err(FluxError::OutOfRange {
                    offset: start,
                    size: extent.len,
                    bound: region.len() as u64,
                });
            }
            writer.write(&region[start as usize..end as usize]);
        }
        Ok(())
    }

    /// Only space at the end of the region can be reclaimed. Partitions
    /// serialize their appends, so an aborted batch always sits there.
    fn release(&self, descriptors: &[DataDescriptor]) -> Result<()> {
        if !self.reachable.get() {
            return Err(unreachable_error(&self.address));
        }
        let mut starts = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors.iter().filter(|d| !d.is_empty()) {
            starts.push(Self::base_offset(descriptor.location())?);
        }
        let Some(start) = starts.into_iter().min() else {
            return Ok(());
        };
        let mut region = self.region.write().unwrap_or_else(PoisonError::into_inner);
        let end = descriptors
            .iter()
            .filter_map(|d| Some(Self::base_offset(d.location()).ok()? + d.size()))
            .max()
            .unwrap_or(start);
        if end == region.len() as u64 {
            region.truncate(start as usize);
            trace!("released {} bytes from offset {}", end - start, start);
        } else {
            warn!(
                "data store {:?}: cannot release [{}, {}), region ends at {}",
                self.address,
                start,
                end,
                region.len()
            );
        }
        Ok(())
    }

    fn is_reachable(&self) -> bool {
        self.reachable.get()
    }
}

/// Sequential writer over a list of fixed-size buffers.
struct ScatterWriter<'a> {
    buffers: &'a mut [Vec<u8>],
    index: usize,
    offset: usize,
}

impl<'a> ScatterWriter<'a> {
    fn new(buffers: &'a mut [Vec<u8>]) -> Self {
        ScatterWriter {
            buffers,
            index: 0,
            offset: 0,
        }
    }

    fn write(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let Some(buf) = self.buffers.get_mut(self.index) else {
                return;
            };
            let room = buf.len() - self.offset;
            if room == 0 {
                self.index += 1;
                self.offset = 0;
                continue;
            }
            let n = room.min(bytes.len());
            buf[self.offset..self.offset + n].copy_from_slice(&bytes[..n]);
            self.offset += n;
            bytes = &bytes[n..];
        }
    }
}
