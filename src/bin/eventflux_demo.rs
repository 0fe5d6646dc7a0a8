// Producer/consumer round trip against in-memory providers.
//
// Run: EVENTFLUX_CONFIG=eventflux.toml cargo run --bin eventflux_demo
//
// Creates a topic with a schema validator and two partitions, pushes a few
// readings with payloads, then consumes them back fetching only the first
// four bytes of every payload.

use std::ops::ControlFlow;

use eventflux::{
    ConsumerOptions, Data, DataDescriptor, Metadata, PartitionSelector, ProducerOptions,
    Serializer, ServiceHandle, Validator,
    store::{MemoryDataProvider, MemoryMetadataProvider},
};
use serde_json::json;
use tracing::{info, warn};

const READINGS: usize = 10;

fn main() -> anyhow::Result<()> {
    let conf = eventflux::initialize();

    let service = ServiceHandle::new();
    service.register_metadata_provider(MemoryMetadataProvider::new("meta-0"))?;
    service.register_data_provider(MemoryDataProvider::new("data-0"))?;

    let validator = Validator::from_metadata(
        "schema",
        &Metadata::new(json!({
            "schema": {
                "type": "object",
                "required": ["sensor", "seq"],
                "properties": {
                    "sensor": {"type": "string"},
                    "seq": {"type": "integer", "minimum": 0}
                }
            }
        })),
    )?;
    let selector = PartitionSelector::from_metadata("key", &Metadata::new(json!({"key": "sensor"})))?;
    let topic = service.create_topic("readings", validator, selector, Serializer::default())?;
    for _ in 0..2 {
        service.add_partition("readings", "meta-0", "data-0")?;
    }

    let producer = topic.producer(ProducerOptions::from(&conf.producer).name("demo"));
    let mut pushed = Vec::with_capacity(READINGS);
    for seq in 0..READINGS {
        let sensor = if seq % 2 == 0 { "north" } else { "south" };
        let payload = format!("{sensor}:{seq:04}").into_bytes();
        pushed.push(producer.push(
            Metadata::new(json!({"sensor": sensor, "seq": seq})),
            Data::from(payload),
        ));
    }
    // Rejected by the schema: seq must be an integer.
    let rejected = producer.push(
        Metadata::new(json!({"sensor": "east", "seq": "first"})),
        Data::empty(),
    );
    producer.flush().wait()?;
    for future in pushed {
        future.wait()?;
    }
    if let Err(e) = rejected.wait() {
        warn!("rejected as expected: {e}");
    }
    drop(producer);
    service.mark_complete("readings")?;

    let options = ConsumerOptions::from(&conf.consumer).data_selector(|_, d: &DataDescriptor| {
        if d.is_empty() {
            Ok(DataDescriptor::null())
        } else {
            Ok(d.sub_view(0, d.size().min(4))?)
        }
    });
    let consumer = topic.consumer("demo", options)?;
    let consumed = consumer.process(
        |event| {
            info!(
                "partition {} event {}: {} prefix={:?}",
                event.partition(),
                event.id(),
                event.metadata(),
                String::from_utf8_lossy(&event.data().to_vec())
            );
            if let Err(e) = event.acknowledge() {
                warn!("ack failed: {e}");
            }
            ControlFlow::Continue(())
        },
        None,
    )?;
    info!(
        "consumed {consumed} events from {} partitions",
        topic.partition_count()
    );
    Ok(())
}
