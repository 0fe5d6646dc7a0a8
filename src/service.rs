//! Topic/partition directory.
//!
//! A `ServiceHandle` maps topic names to topics and provider addresses to
//! registered storage providers. It is cheap to clone; all clones share the
//! same directory. Directory operations fail synchronously.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use eventflux_core::{
    error::{FluxError, Result},
    policy::{PartitionSelector, Serializer, Validator},
};
use tracing::{debug, info};

use crate::{
    partition::Partition,
    store::{DataProvider, MetadataProvider},
    topic::{Topic, TopicHandle},
};

/// Longest accepted topic name, in characters.
pub const MAX_TOPIC_NAME: usize = 256;

#[derive(Default)]
struct Directory {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    metadata_providers: RwLock<HashMap<String, Arc<dyn MetadataProvider>>>,
    data_providers: RwLock<HashMap<String, Arc<dyn DataProvider>>>,
}

#[derive(Clone, Default)]
pub struct ServiceHandle {
    inner: Arc<Directory>,
}

impl ServiceHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a metadata provider available to `add_partition` under its
    /// address.
    pub fn register_metadata_provider(&self, provider: Arc<dyn MetadataProvider>) -> Result<()> {
        let mut providers = self
            .inner
            .metadata_providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let address = provider.address().to_string();
        if providers.contains_key(&address) {
            return Err(FluxError::AlreadyExists {
                kind: "metadata provider",
                name: address,
            });
        }
        debug!("registered metadata provider {}", address);
        providers.insert(address, provider);
        Ok(())
    }

    pub fn register_data_provider(&self, provider: Arc<dyn DataProvider>) -> Result<()> {
        let mut providers = self
            .inner
            .data_providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let address = provider.address().to_string();
        if providers.contains_key(&address) {
            return Err(FluxError::AlreadyExists {
                kind: "data provider",
                name: address,
            });
        }
        debug!("registered data provider {}", address);
        providers.insert(address, provider);
        Ok(())
    }

    /// Creates a topic with no partitions.
    ///
    /// # Errors
    /// `InvalidArgument` if the name is empty or longer than 256 characters,
    /// `AlreadyExists` if the name is taken.
    pub fn create_topic(
        &self,
        name: &str,
        validator: Validator,
        selector: PartitionSelector,
        serializer: Serializer,
    ) -> Result<TopicHandle> {
        let len = name.chars().count();
        if len == 0 || len > MAX_TOPIC_NAME {
            return Err(FluxError::InvalidArgument(format!(
                "topic name must be 1..={MAX_TOPIC_NAME} characters, got {len}"
            )));
        }
        let mut topics = self.inner.topics.write().unwrap_or_else(PoisonError::into_inner);
        if topics.contains_key(name) {
            return Err(FluxError::AlreadyExists {
                kind: "topic",
                name: name.to_string(),
            });
        }
        let topic = Arc::new(Topic::new(name, validator, selector, serializer));
        topics.insert(name.to_string(), topic.clone());
        info!(
            "created topic {} (validator={}, selector={}, serializer={})",
            name,
            topic.validator().type_name(),
            topic.selector().type_name(),
            topic.serializer().type_name()
        );
        Ok(TopicHandle { topic })
    }

    /// Appends a partition to `topic` backed by the providers registered
    /// under the given addresses, and returns its index.
    ///
    /// # Errors
    /// `TopicNotFound` for an unknown topic, `InvalidProvider` if either
    /// address is unknown, unreachable or refuses to open a store.
    pub fn add_partition(
        &self,
        topic: &str,
        metadata_provider: &str,
        data_provider: &str,
    ) -> Result<usize> {
        let topic = self.topic(topic)?;
        let meta = self.metadata_provider(metadata_provider)?;
        let data = self.data_provider(data_provider)?;

        let index = topic.add_partition(|index| {
            let meta_store = meta
                .open(topic.name(), index)
                .map_err(|e| invalid_provider(metadata_provider, e.to_string()))?;
            let data_store = data
                .open(topic.name(), index)
                .map_err(|e| invalid_provider(data_provider, e.to_string()))?;
            Ok(Partition::new(
                topic.name(),
                index,
                metadata_provider,
                data_provider,
                meta_store,
                data_store,
            ))
        })?;
        info!(
            "added partition {}[{}] on ({}, {})",
            topic.name(),
            index,
            metadata_provider,
            data_provider
        );
        Ok(index)
    }

    /// Resolves a topic and its current partitions.
    pub fn open_topic(&self, name: &str) -> Result<TopicHandle> {
        Ok(TopicHandle {
            topic: self.topic(name)?,
        })
    }

    /// Names of all topics, sorted.
    pub fn list_topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Marks every partition of `topic` complete. Consumers receive
    /// `NO_MORE_EVENTS` once they have drained them.
    pub fn mark_complete(&self, topic: &str) -> Result<()> {
        for partition in self.topic(topic)?.partitions() {
            partition.mark_complete();
        }
        Ok(())
    }

    fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        self.inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| FluxError::TopicNotFound(name.to_string()))
    }

    fn metadata_provider(&self, address: &str) -> Result<Arc<dyn MetadataProvider>> {
        let provider = self
            .inner
            .metadata_providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .ok_or_else(|| invalid_provider(address, "no metadata provider registered".into()))?;
        if !provider.is_reachable() {
            return Err(invalid_provider(address, "unreachable".into()));
        }
        Ok(provider)
    }

    fn data_provider(&self, address: &str) -> Result<Arc<dyn DataProvider>> {
        let provider = self
            .inner
            .data_providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .ok_or_else(|| invalid_provider(address, "no data provider registered".into()))?;
        if !provider.is_reachable() {
            return Err(invalid_provider(address, "unreachable".into()));
        }
        Ok(provider)
    }
}

fn invalid_provider(address: &str, reason: String) -> FluxError {
    FluxError::InvalidProvider {
        address: address.to_string(),
        reason,
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("topics", &self.list_topics())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryDataProvider, MemoryMetadataProvider};

    fn service() -> (ServiceHandle, Arc<MemoryMetadataProvider>) {
        let service = ServiceHandle::new();
        let meta = MemoryMetadataProvider::new("meta-0");
        service.register_metadata_provider(meta.clone()).expect("register");
        service
            .register_data_provider(MemoryDataProvider::new("data-0"))
            .expect("register");
        (service, meta)
    }

    fn create(service: &ServiceHandle, name: &str) -> Result<TopicHandle> {
        service.create_topic(
            name,
            Validator::default(),
            PartitionSelector::default(),
            Serializer::default(),
        )
    }

    #[test]
    fn topic_names_are_unique_and_bounded() {
        let (service, _) = service();
        create(&service, "t").expect("create");
        assert!(matches!(
            create(&service, "t"),
            Err(FluxError::AlreadyExists { kind: "topic", .. })
        ));
        assert!(matches!(create(&service, ""), Err(FluxError::InvalidArgument(_))));
        assert!(create(&service, &"n".repeat(256)).is_ok());
        assert!(matches!(
            create(&service, &"n".repeat(257)),
            Err(FluxError::InvalidArgument(_))
        ));
        assert_eq!(service.list_topics(), vec!["n".repeat(256), "t".to_string()]);
    }

    #[test]
    fn partitions_need_reachable_providers() {
        let (service, meta) = service();
        create(&service, "t").expect("create");
        assert_eq!(service.add_partition("t", "meta-0", "data-0").expect("add"), 0);
        assert_eq!(service.add_partition("t", "meta-0", "data-0").expect("add"), 1);

        assert!(matches!(
            service.add_partition("t", "meta-9", "data-0"),
            Err(FluxError::InvalidProvider { .. })
        ));
        meta.set_reachable(false);
        assert!(matches!(
            service.add_partition("t", "meta-0", "data-0"),
            Err(FluxError::InvalidProvider { .. })
        ));
        assert_eq!(
            service.add_partition("nope", "meta-0", "data-0"),
            Err(FluxError::TopicNotFound("nope".into()))
        );
        assert_eq!(service.open_topic("t").expect("open").partition_count(), 2);
    }

    #[test]
    fn open_topic_returns_a_snapshot() {
        let (service, _) = service();
        create(&service, "t").expect("create");
        service.add_partition("t", "meta-0", "data-0").expect("add");
        let snapshot = service.open_topic("t").expect("open").partitions();
        service.add_partition("t", "meta-0", "data-0").expect("add");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].metadata_provider, "meta-0");
        assert_eq!(service.open_topic("t").expect("open").partitions().len(), 2);
        assert!(matches!(service.open_topic("x"), Err(FluxError::TopicNotFound(_))));
    }

    #[test]
    fn duplicate_provider_address_is_rejected() {
        let (service, _) = service();
        assert!(matches!(
            service.register_metadata_provider(MemoryMetadataProvider::new("meta-0")),
            Err(FluxError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn mark_complete_covers_every_partition() {
        let (service, _) = service();
        create(&service, "t").expect("create");
        service.add_partition("t", "meta-0", "data-0").expect("add");
        service.add_partition("t", "meta-0", "data-0").expect("add");
        service.mark_complete("t").expect("complete");
        let topic = service.open_topic("t").expect("open");
        assert!(topic.partitions().iter().all(|p| p.complete));
    }
}
