//! Events as delivered to consumers.

use std::{fmt, sync::Arc};

use eventflux_core::{
    descriptor::DataDescriptor,
    error::{FluxError, Result},
    metadata::{Data, Metadata},
};

use crate::{EventId, NO_MORE_EVENTS, partition::Partition};

/// Binds an event to the partition and consumer name that received it.
#[derive(Clone)]
pub(crate) struct AckHandle {
    pub(crate) partition: Arc<Partition>,
    pub(crate) consumer: Arc<str>,
}

/// One partition-assigned record handed to a consumer.
///
/// `descriptor` always describes the full stored data, while `data` holds
/// only what the consumer's data selector asked for.
pub struct Event {
    id: EventId,
    partition: usize,
    metadata: Metadata,
    descriptor: DataDescriptor,
    data: Data,
    ack: Option<AckHandle>,
}

impl Event {
    pub(crate) fn new(
        id: EventId,
        metadata: Metadata,
        descriptor: DataDescriptor,
        data: Data,
        ack: AckHandle,
    ) -> Self {
        Event {
            id,
            partition: ack.partition.index(),
            metadata,
            descriptor,
            data,
            ack: Some(ack),
        }
    }

    /// End-of-stream sentinel.
    pub fn no_more_events() -> Self {
        Event {
            id: NO_MORE_EVENTS,
            partition: 0,
            metadata: Metadata::empty(),
            descriptor: DataDescriptor::null(),
            data: Data::empty(),
            ack: None,
        }
    }

    pub fn is_no_more_events(&self) -> bool {
        self.id == NO_MORE_EVENTS
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    /// Index of the partition the event was read from.
    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn descriptor(&self) -> &DataDescriptor {
        &self.descriptor
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn into_parts(self) -> (Metadata, Data) {
        (self.metadata, self.data)
    }

    /// Advances the consumer's cursor on this event's partition past this
    /// event, and past every earlier one.
    ///
    /// Idempotent. Fails with `FluxError::NoMoreEvents` on the sentinel.
    pub fn acknowledge(&self) -> Result<()> {
        match &self.ack {
            Some(ack) => ack.partition.acknowledge(&ack.consumer, self.id),
            None => Err(FluxError::NoMoreEvents),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_no_more_events() {
            return f.write_str("Event(NO_MORE_EVENTS)");
        }
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("partition", &self.partition)
            .field("metadata", &self.metadata)
            .field("size", &self.descriptor.size())
            .field("fetched", &self.data.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_cannot_be_acknowledged() {
        let e = Event::no_more_events();
        assert!(e.is_no_more_events());
        assert_eq!(e.acknowledge(), Err(FluxError::NoMoreEvents));
        assert!(e.data().is_empty());
        assert_eq!(format!("{e:?}"), "Event(NO_MORE_EVENTS)");
    }
}
