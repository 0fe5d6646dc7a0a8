use std::{
    collections::HashMap,
    sync::{Arc, OnceLock, PoisonError, RwLock},
};

use tracing::debug;

use super::{
    PartitionSelectorPolicy, SerializerPolicy, ValidatorPolicy,
    eventbridge::EventbridgeValidator,
    schema::SchemaValidator,
    selector::{HashSelector, KeySelector, RoundRobinSelector},
    serializer::{JsonSerializer, SchemaSerializer},
    validator::JsonObjectValidator,
};
use crate::{
    error::{FluxError, PolicyKind, Result},
    metadata::Metadata,
};

pub type Constructor<P> = Arc<dyn Fn(&Metadata) -> Result<Arc<P>> + Send + Sync>;

/// Type-name to constructor map for one policy family.
pub struct Registry<P: ?Sized + 'static> {
    kind: PolicyKind,
    entries: RwLock<HashMap<String, Constructor<P>>>,
    fallback: Arc<P>,
}

impl<P: ?Sized + 'static> Registry<P> {
    fn new(kind: PolicyKind, fallback: Arc<P>) -> Self {
        Registry {
            kind,
            entries: RwLock::new(HashMap::new()),
            fallback,
        }
    }

    /// Adds or replaces a constructor. Returns true when a previous entry
    /// was replaced.
    pub fn register<F>(&self, name: &str, ctor: F) -> bool
    where
        F: Fn(&Metadata) -> Result<Arc<P>> + Send + Sync + 'static,
    {
        debug!("registering {} policy {:?}", self.kind, name);
        let ctor: Constructor<P> = Arc::new(ctor);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), ctor)
            .is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn build(&self, name: &str, config: &Metadata) -> Result<Arc<P>> {
        let ctor = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| FluxError::PolicyNotFound {
                kind: self.kind,
                name: name.to_string(),
            })?;
        // Constructor runs outside the lock so it may itself consult the registry.
        ctor(config)
    }

    /// The built-in instance used by `Default` handles.
    pub fn default_policy(&self) -> Arc<P> {
        self.fallback.clone()
    }
}

static VALIDATORS: OnceLock<Registry<dyn ValidatorPolicy>> = OnceLock::new();
static SELECTORS: OnceLock<Registry<dyn PartitionSelectorPolicy>> = OnceLock::new();
static SERIALIZERS: OnceLock<Registry<dyn SerializerPolicy>> = OnceLock::new();

pub fn validators() -> &'static Registry<dyn ValidatorPolicy> {
    VALIDATORS.get_or_init(|| {
        let r: Registry<dyn ValidatorPolicy> =
            Registry::new(PolicyKind::Validator, Arc::new(JsonObjectValidator));
        r.register("default", |_| Ok(Arc::new(JsonObjectValidator)));
        r.register("schema", |config| {
            Ok(Arc::new(SchemaValidator::from_config(config)?))
        });
        r.register("eventbridge", |config| {
            Ok(Arc::new(EventbridgeValidator::from_config(config)?))
        });
        r
    })
}

pub fn partition_selectors() -> &'static Registry<dyn PartitionSelectorPolicy> {
    SELECTORS.get_or_init(|| {
        let r: Registry<dyn PartitionSelectorPolicy> =
            Registry::new(PolicyKind::PartitionSelector, Arc::new(HashSelector));
        r.register("default", |_| Ok(Arc::new(HashSelector)));
        r.register("key", |config| Ok(Arc::new(KeySelector::from_config(config)?)));
        r.register("round_robin", |_| Ok(Arc::new(RoundRobinSelector::default())));
        r
    })
}

pub fn serializers() -> &'static Registry<dyn SerializerPolicy> {
    SERIALIZERS.get_or_init(|| {
        let r: Registry<dyn SerializerPolicy> =
            Registry::new(PolicyKind::Serializer, Arc::new(JsonSerializer));
        r.register("default", |_| Ok(Arc::new(JsonSerializer)));
        r.register("schema", |config| {
            Ok(Arc::new(SchemaSerializer::from_config(config)?))
        });
        r
    })
}

/// Makes a validator type available to `Validator::from_metadata`.
pub fn register_validator<F>(name: &str, ctor: F) -> bool
where
    F: Fn(&Metadata) -> Result<Arc<dyn ValidatorPolicy>> + Send + Sync + 'static,
{
    validators().register(name, ctor)
}

/// Makes a partition selector type available to `PartitionSelector::from_metadata`.
pub fn register_partition_selector<F>(name: &str, ctor: F) -> bool
where
    F: Fn(&Metadata) -> Result<Arc<dyn PartitionSelectorPolicy>> + Send + Sync + 'static,
{
    partition_selectors().register(name, ctor)
}

/// Makes a serializer type available to `Serializer::from_metadata`.
pub fn register_serializer<F>(name: &str, ctor: F) -> bool
where
    F: Fn(&Metadata) -> Result<Arc<dyn SerializerPolicy>> + Send + Sync + 'static,
{
    serializers().register(name, ctor)
}
