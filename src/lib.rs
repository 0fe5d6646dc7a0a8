//! eventflux: a partitioned publish/subscribe event-streaming engine.
//!
//! This crate provides:
//! - `ServiceHandle`: the topic/partition directory and provider registry.
//! - `Producer`: batching, ordering and asynchronous dispatch of events.
//! - `Consumer`: partition fan-in with caller-controlled data selection,
//!   buffer brokering and cumulative acknowledgement.
//! - Storage provider traits plus in-memory providers (`store`).
//!
//! Descriptor algebra, metadata, policies, futures, configuration and
//! logging live in `eventflux-core` and are re-exported here.
pub mod adaptive;
pub mod batch;
pub mod consumer;
pub mod event;
pub mod partition;
pub mod producer;
pub mod service;
pub mod store;
pub mod topic;

pub use eventflux_core::{
    config::{self, BatchSize, Config, Ordering},
    descriptor::{DataDescriptor, Extent, Location},
    error::{FluxError, PolicyKind, Result},
    future::{Future, Promise},
    CONFIG_ENV, initialize, load_config,
    metadata::{Data, Metadata},
    policy::{
        PartitionSelector, Serializer, Validator, register_partition_selector,
        register_serializer, register_validator,
    },
};

pub use crate::{
    adaptive::AdaptiveBatchSize,
    consumer::{Consumer, ConsumerMeta, ConsumerOptions, DataBroker, DataSelector},
    event::Event,
    producer::{Producer, ProducerMeta, ProducerOptions},
    service::ServiceHandle,
    topic::TopicHandle,
};

/// Identifier of an event within its partition.
pub type EventId = u64;

/// Id carried by the end-of-stream sentinel event.
pub const NO_MORE_EVENTS: EventId = u64::MAX;
