//! Topics: a fixed policy triple plus a growable list of partitions.

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use eventflux_core::{
    error::Result,
    policy::{PartitionSelector, Serializer, Validator},
};

use crate::{
    EventId,
    consumer::{Consumer, ConsumerOptions},
    partition::Partition,
    producer::{Producer, ProducerOptions},
};

pub(crate) struct Topic {
    name: String,
    validator: Validator,
    selector: PartitionSelector,
    serializer: Serializer,
    partitions: RwLock<Vec<Arc<Partition>>>,
}

impl Topic {
    pub(crate) fn new(
        name: &str,
        validator: Validator,
        selector: PartitionSelector,
        serializer: Serializer,
    ) -> Self {
        Topic {
            name: name.to_string(),
            validator,
            selector,
            serializer,
            partitions: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn validator(&self) -> &Validator {
        &self.validator
    }

    pub(crate) fn selector(&self) -> &PartitionSelector {
        &self.selector
    }

    pub(crate) fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    /// Current partitions, in index order.
    pub(crate) fn partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn partition_count(&self) -> usize {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Builds the next partition with `make(index)` and appends it.
    pub(crate) fn add_partition<F>(&self, make: F) -> Result<usize>
    where
        F: FnOnce(usize) -> Result<Partition>,
    {
        let mut partitions = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        let index = partitions.len();
        partitions.push(Arc::new(make(index)?));
        Ok(index)
    }
}

/// Point-in-time view of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub index: usize,
    pub metadata_provider: String,
    pub data_provider: String,
    pub next_event_id: EventId,
    pub complete: bool,
}

/// Caller-facing handle on an open topic.
#[derive(Clone)]
pub struct TopicHandle {
    pub(crate) topic: Arc<Topic>,
}

impl TopicHandle {
    pub fn name(&self) -> &str {
        self.topic.name()
    }

    pub fn validator(&self) -> &Validator {
        self.topic.validator()
    }

    pub fn partition_selector(&self) -> &PartitionSelector {
        self.topic.selector()
    }

    pub fn serializer(&self) -> &Serializer {
        self.topic.serializer()
    }

    pub fn partition_count(&self) -> usize {
        self.topic.partition_count()
    }

    /// Snapshot of the partition list. Partitions added afterwards are not
    /// reflected.
    pub fn partitions(&self) -> Vec<PartitionInfo> {
        self.topic
            .partitions()
            .iter()
            .map(|p| PartitionInfo {
                index: p.index(),
                metadata_provider: p.metadata_provider().to_string(),
                data_provider: p.data_provider().to_string(),
                next_event_id: p.next_event_id(),
                complete: p.is_complete(),
            })
            .collect()
    }

    /// Starts a producer on this topic.
    pub fn producer(&self, options: ProducerOptions) -> Producer {
        Producer::new(self.topic.clone(), options)
    }

    /// Starts a consumer reading under `name`. Consumers sharing a name
    /// share acknowledgement cursors.
    pub fn consumer(&self, name: &str, options: ConsumerOptions) -> Result<Consumer> {
        Consumer::new(self.topic.clone(), name, options)
    }
}

impl fmt::Debug for TopicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicHandle")
            .field("name", &self.topic.name)
            .field("validator", &self.topic.validator)
            .field("selector", &self.topic.selector)
            .field("serializer", &self.topic.serializer)
            .field("partitions", &self.partition_count())
            .finish()
    }
}
