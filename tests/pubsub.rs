use std::{ops::ControlFlow, sync::Arc, time::Duration};

use eventflux::{
    BatchSize, ConsumerOptions, Data, DataDescriptor, FluxError, Metadata, NO_MORE_EVENTS,
    Ordering, PartitionSelector, ProducerOptions, Serializer, ServiceHandle, TopicHandle,
    Validator,
    store::{MemoryDataProvider, MemoryMetadataProvider},
};
use serde_json::json;

struct Fixture {
    service: ServiceHandle,
    meta: Arc<MemoryMetadataProvider>,
    data: Arc<MemoryDataProvider>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_data(MemoryDataProvider::new("data-0"))
    }

    fn with_data(data: Arc<MemoryDataProvider>) -> Self {
        let service = ServiceHandle::new();
        let meta = MemoryMetadataProvider::new("meta-0");
        service
            .register_metadata_provider(meta.clone())
            .expect("register metadata provider");
        service
            .register_data_provider(data.clone())
            .expect("register data provider");
        Fixture {
            service,
            meta,
            data,
        }
    }

    fn topic(&self, name: &str, validator: Validator, partitions: usize) -> TopicHandle {
        let topic = self
            .service
            .create_topic(name, validator, PartitionSelector::default(), Serializer::default())
            .expect("create topic");
        for _ in 0..partitions {
            self.service
                .add_partition(name, "meta-0", "data-0")
                .expect("add partition");
        }
        topic
    }
}

fn fixed(n: usize) -> ProducerOptions {
    ProducerOptions::default().batch_size(BatchSize::Fixed(n))
}

fn collect_ids(topic: &TopicHandle, consumer: &str, options: ConsumerOptions) -> Vec<(usize, u64)> {
    let consumer = topic.consumer(consumer, options).expect("consumer");
    let mut ids = Vec::new();
    consumer
        .process(
            |event| {
                ids.push((event.partition(), event.id()));
                ControlFlow::Continue(())
            },
            None,
        )
        .expect("process");
    ids
}

#[test]
fn default_topic_round_trip() {
    let fx = Fixture::new();
    let topic = fx.topic("t", Validator::default(), 1);

    let producer = topic.producer(ProducerOptions::default());
    let id = producer
        .push(Metadata::parse(r#"{"x":1}"#).expect("json"), Data::empty())
        .wait()
        .expect("push");
    assert_eq!(id, 0);

    let consumer = topic.consumer("c", ConsumerOptions::default()).expect("consumer");
    let event = consumer.pull().wait().expect("pull");
    assert_eq!(event.metadata().json(), &json!({"x": 1}));
    assert!(event.data().is_empty());
    assert!(event.descriptor().is_empty());
}

#[test]
fn schema_rejection_is_never_delivered() {
    let fx = Fixture::new();
    let validator = Validator::from_metadata(
        "schema",
        &Metadata::new(json!({
            "schema": {"type": "object", "properties": {"x": {"type": "string"}}}
        })),
    )
    .expect("schema validator");
    let topic = fx.topic("t", validator, 1);

    let producer = topic.producer(fixed(4));
    let bad = producer.push(Metadata::new(json!({"x": 123})), Data::empty());
    let good = producer.push(Metadata::new(json!({"x": "ok"})), Data::empty());
    assert!(matches!(bad.wait(), Err(FluxError::Validation(_))));
    assert_eq!(good.wait().expect("accepted"), 0);
    drop(producer);
    fx.service.mark_complete("t").expect("complete");

    let consumer = topic.consumer("c", ConsumerOptions::default()).expect("consumer");
    let mut seen = Vec::new();
    consumer
        .process(
            |e| {
                seen.push(e.metadata().clone());
                ControlFlow::Continue(())
            },
            None,
        )
        .expect("process");
    assert_eq!(seen, vec![Metadata::new(json!({"x": "ok"}))]);
}

#[test]
fn empty_selector_fetches_no_data() {
    let fx = Fixture::new();
    let topic = fx.topic("t", Validator::default(), 2);
    let producer = topic.producer(fixed(3).ordering(Ordering::Loose));
    for i in 0..9u8 {
        producer.push(
            Metadata::new(json!({"i": i})),
            Data::new(vec![vec![i; 16], vec![i; 3]]),
        );
    }
    producer.flush().wait().expect("flush");
    fx.service.mark_complete("t").expect("complete");

    let consumer = topic
        .consumer(
            "c",
            ConsumerOptions::default().data_selector(|_, _| Ok(DataDescriptor::null())),
        )
        .expect("consumer");
    let mut count = 0;
    consumer
        .process(
            |e| {
                assert!(e.data().segments().is_empty());
                assert_eq!(e.descriptor().size(), 19);
                count += 1;
                ControlFlow::Continue(())
            },
            None,
        )
        .expect("process");
    assert_eq!(count, 9);
}

#[test]
fn strict_single_partition_preserves_push_order() {
    for threads in [0, 4] {
        let fx = Fixture::new();
        let topic = fx.topic("t", Validator::default(), 1);
        let producer = topic.producer(
            ProducerOptions::default()
                .batch_size(BatchSize::Adaptive)
                .ordering(Ordering::Strict)
                .thread_count(threads),
        );
        let futures: Vec<_> = (0..200)
            .map(|seq| producer.push(Metadata::new(json!({"seq": seq})), Data::empty()))
            .collect();
        producer.flush().wait().expect("flush");
        let ids: Vec<u64> = futures
            .into_iter()
            .map(|f| f.wait().expect("pushed"))
            .collect();
        assert_eq!(ids, (0..200).collect::<Vec<u64>>());

        fx.service.mark_complete("t").expect("complete");
        let consumer = topic.consumer("c", ConsumerOptions::default()).expect("consumer");
        let mut seqs = Vec::new();
        consumer
            .process(
                |e| {
                    seqs.push(e.metadata().get("seq").and_then(|v| v.as_u64()).expect("seq"));
                    ControlFlow::Continue(())
                },
                None,
            )
            .expect("process");
        assert_eq!(seqs, (0..200).collect::<Vec<u64>>());
    }
}

#[test]
fn loose_ordering_yields_increasing_ids_per_partition() {
    let fx = Fixture::new();
    let topic = fx.topic("t", Validator::default(), 3);
    let producer = topic.producer(fixed(5).ordering(Ordering::Loose).thread_count(3));
    for i in 0..150 {
        producer.push(Metadata::new(json!({"i": i})), Data::from(vec![1, 2, 3]));
    }
    producer.flush().wait().expect("flush");
    fx.service.mark_complete("t").expect("complete");

    let ids = collect_ids(&topic, "c", ConsumerOptions::default().thread_count(2));
    assert_eq!(ids.len(), 150);
    for partition in 0..3 {
        let mine: Vec<u64> = ids.iter().filter(|(p, _)| *p == partition).map(|(_, id)| *id).collect();
        assert_eq!(mine, (0..mine.len() as u64).collect::<Vec<_>>());
    }
}

#[test]
fn acknowledgement_is_cumulative_across_subscriptions() {
    let fx = Fixture::new();
    let topic = fx.topic("t", Validator::default(), 1);
    let producer = topic.producer(fixed(10));
    for i in 0..10 {
        producer.push(Metadata::new(json!({"i": i})), Data::empty());
    }
    producer.flush().wait().expect("flush");

    {
        let consumer = topic.consumer("group", ConsumerOptions::default()).expect("consumer");
        let mut events = Vec::new();
        for _ in 0..6 {
            events.push(consumer.pull().wait().expect("pull"));
        }
        // Acking 4 covers 0..=4; acking 2 afterwards does not move back.
        events[4].acknowledge().expect("ack");
        events[2].acknowledge().expect("ack");
        events[4].acknowledge().expect("idempotent");
    }

    fx.service.mark_complete("t").expect("complete");
    let resumed = collect_ids(&topic, "group", ConsumerOptions::default());
    assert_eq!(resumed.iter().map(|(_, id)| *id).collect::<Vec<_>>(), vec![5, 6, 7, 8, 9]);

    let fresh = collect_ids(&topic, "other", ConsumerOptions::default());
    assert_eq!(fresh.len(), 10);
}

#[test]
fn unreachable_data_provider_fails_the_batch() {
    let fx = Fixture::new();
    let topic = fx.topic("t", Validator::default(), 1);
    let producer = topic.producer(fixed(4));
    let ok = producer.push(Metadata::new(json!({"before": true})), Data::from(vec![0u8; 4]));
    producer.flush().wait().expect("flush");
    assert_eq!(ok.wait().expect("id"), 0);

    fx.data.set_reachable(false);
    let failed: Vec<_> = (0..4)
        .map(|i| producer.push(Metadata::new(json!({"i": i})), Data::from(vec![1u8; 8])))
        .collect();
    for f in failed {
        assert!(matches!(f.wait(), Err(FluxError::Dispatch(_))));
    }
    assert_eq!(topic.partitions()[0].next_event_id, 1);

    fx.data.set_reachable(true);
    let retried = producer.push(Metadata::new(json!({"retry": true})), Data::from(vec![2u8; 8]));
    assert_eq!(retried.wait().expect("id"), 1);
}

#[test]
fn batch_over_capacity_leaves_no_data_behind() {
    let fx = Fixture::with_data(MemoryDataProvider::with_capacity("data-0", 8));
    let topic = fx.topic("t", Validator::default(), 1);
    let producer = topic.producer(fixed(2).max_idle(Duration::from_secs(3600)));

    let first = producer.push(Metadata::new(json!({"n": 0})), Data::from(vec![0u8; 6]));
    let second = producer.push(Metadata::new(json!({"n": 1})), Data::from(vec![1u8; 6]));
    assert!(matches!(first.wait(), Err(FluxError::Dispatch(_))));
    assert!(matches!(second.wait(), Err(FluxError::Dispatch(_))));

    let small = producer.push(Metadata::new(json!({"n": 2})), Data::from(vec![2u8; 4]));
    producer.flush().wait().expect("flush");
    assert_eq!(small.wait().expect("id"), 0);

    let consumer = topic.consumer("c", ConsumerOptions::default()).expect("consumer");
    assert_eq!(consumer.pull().wait().expect("event").data().to_vec(), vec![2u8; 4]);
}

#[test]
fn unreachable_metadata_fails_the_pull() {
    for threads in [0, 2] {
        let fx = Fixture::new();
        let topic = fx.topic("t", Validator::default(), 1);
        let producer = topic.producer(fixed(1));
        producer
            .push(Metadata::new(json!({"n": 0})), Data::from(b"abc".to_vec()))
            .wait()
            .expect("push");

        let consumer = topic
            .consumer("c", ConsumerOptions::default().thread_count(threads))
            .expect("consumer");
        fx.meta.set_reachable(false);
        assert!(
            matches!(consumer.pull().wait(), Err(FluxError::Dispatch(_))),
            "threads={threads}"
        );
        assert!(matches!(
            consumer.process(|_| ControlFlow::Continue(()), None),
            Err(FluxError::Dispatch(_))
        ));

        // The failed read did not move the consumer past the event.
        fx.meta.set_reachable(true);
        let event = consumer.pull().wait().expect("event");
        assert_eq!(event.id(), 0);
        assert_eq!(event.data().to_vec(), b"abc");
    }
}

#[test]
fn directory_errors_are_synchronous() {
    let fx = Fixture::new();
    fx.topic("t", Validator::default(), 0);
    assert!(matches!(
        fx.service.create_topic(
            "t",
            Validator::default(),
            PartitionSelector::default(),
            Serializer::default()
        ),
        Err(FluxError::AlreadyExists { .. })
    ));
    assert!(matches!(
        fx.service.add_partition("t", "meta-0", "nowhere"),
        Err(FluxError::InvalidProvider { .. })
    ));
    assert!(matches!(
        fx.service.open_topic("missing"),
        Err(FluxError::TopicNotFound(_))
    ));
    assert_eq!(fx.service.list_topics(), vec!["t".to_string()]);
}

#[test]
fn threaded_consumer_sees_events_appended_later() {
    let fx = Fixture::new();
    let topic = fx.topic("t", Validator::default(), 2);
    let consumer = topic
        .consumer("live", ConsumerOptions::default().thread_count(2))
        .expect("consumer");
    let pending = consumer.pull();

    let producer = topic.producer(fixed(1).thread_count(2).ordering(Ordering::Loose));
    producer
        .push(Metadata::new(json!({"late": true})), Data::from(b"hello".to_vec()))
        .wait()
        .expect("push");

    let event = pending.wait().expect("event");
    assert_eq!(event.metadata().get("late"), Some(&json!(true)));
    assert_eq!(event.data().to_vec(), b"hello");

    fx.service.mark_complete("t").expect("complete");
    let end = consumer.pull().wait().expect("sentinel");
    assert_eq!(end.id(), NO_MORE_EVENTS);
}

#[test]
fn policies_round_trip_through_topic_handles() {
    let fx = Fixture::new();
    let serializer = Serializer::from_config(&Metadata::new(json!({
        "__type__": "schema",
        "schema": {"type": "object", "required": ["nested"]}
    })))
    .expect("schema serializer");
    let topic = fx
        .service
        .create_topic("t", Validator::default(), PartitionSelector::default(), serializer)
        .expect("create");
    fx.service.add_partition("t", "meta-0", "data-0").expect("add");

    let reopened = fx.service.open_topic("t").expect("open");
    assert_eq!(reopened.serializer().type_name(), "schema");
    assert_eq!(
        reopened.serializer().config().get("schema"),
        Some(&json!({"type": "object", "required": ["nested"]}))
    );
    assert_eq!(reopened.validator().type_name(), "default");

    let producer = topic.producer(fixed(1));
    producer
        .push(Metadata::new(json!({"nested": {"k": [1, 2]}})), Data::empty())
        .wait()
        .expect("push");
    let consumer = reopened.consumer("c", ConsumerOptions::default()).expect("consumer");
    let event = consumer.pull().wait().expect("pull");
    assert_eq!(event.metadata().get("nested.k"), Some(&json!([1, 2])));

    let refused = producer.push(Metadata::new(json!({"flat": true})), Data::empty());
    assert!(matches!(refused.wait(), Err(FluxError::Serialization(_))));
}
