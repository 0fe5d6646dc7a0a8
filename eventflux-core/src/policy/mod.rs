//! Pluggable per-topic policies.
//!
//! This module provides:
//! - `ValidatorPolicy`, `PartitionSelectorPolicy`, `SerializerPolicy`: the
//!   narrow interfaces a policy implements.
//! - `Validator`, `PartitionSelector`, `Serializer`: cheap, cloneable
//!   handles around a policy instance plus the `(type_name, config)` pair it
//!   was built from.
//! - Open registries mapping type names to constructors, seeded with the
//!   built-in `default`, `schema`, `eventbridge`, `key`, `round_robin`
//!   variants and extensible at runtime through `register_*`.
//!
//! Policies are built either by name (`from_metadata`) or from a config
//! document carrying its own name under `__type__` (`from_config`).

pub mod eventbridge;
pub mod registry;
pub mod schema;
pub mod selector;
pub mod serializer;
pub mod validator;

use std::{fmt, sync::Arc};

use serde_json::Value;

pub use self::registry::{
    register_partition_selector, register_serializer, register_validator,
};
use crate::{
    error::{PolicyKind, Result},
    metadata::{Data, Metadata},
};

/// Config key naming the policy type in a self-describing config.
pub const TYPE_KEY: &str = "__type__";

/// Name of the built-in variant of each policy family.
pub const DEFAULT_TYPE: &str = "default";

/// Accepts or rejects an event before it is assigned a partition.
pub trait ValidatorPolicy: Send + Sync + fmt::Debug {
    fn validate(&self, metadata: &Metadata, data: &Data) -> Result<()>;
}

/// Routes an event to a partition index in `0..partitions`.
///
/// `requested` carries an explicit partition asked for by the producer.
pub trait PartitionSelectorPolicy: Send + Sync + fmt::Debug {
    fn select(&self, metadata: &Metadata, partitions: usize, requested: Option<usize>)
    -> Result<usize>;
}

/// Encodes metadata for storage and decodes it on the consumer side.
pub trait SerializerPolicy: Send + Sync + fmt::Debug {
    fn serialize(&self, metadata: &Metadata) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Metadata>;
}

/// Strips the `__type__` key from a self-describing config.
fn split_config(config: &Metadata) -> (String, Metadata) {
    let type_name = config
        .get_str(TYPE_KEY)
        .unwrap_or(DEFAULT_TYPE)
        .to_string();
    let mut json = config.json().clone();
    if let Value::Object(map) = &mut json {
        map.remove(TYPE_KEY);
    }
    (type_name, Metadata::new(json))
}

/// Config document with the type name folded back in.
fn describe(type_name: &str, config: &Metadata) -> Metadata {
    let mut json = match config.json() {
        Value::Object(map) => Value::Object(map.clone()),
        _ => Value::Object(Default::default()),
    };
    if let Value::Object(map) = &mut json {
        map.insert(TYPE_KEY.into(), Value::String(type_name.into()));
    }
    Metadata::new(json)
}

macro_rules! policy_handle {
    ($(#[$doc:meta])* $name:ident, $policy:ident, $kind:expr, $registry:path) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name {
            type_name: Arc<str>,
            config: Metadata,
            inner: Arc<dyn $policy>,
        }

        impl $name {
            /// Builds the policy registered under `type_name`.
            pub fn from_metadata(type_name: &str, config: &Metadata) -> Result<Self> {
                let inner = $registry().build(type_name, config)?;
                Ok($name {
                    type_name: type_name.into(),
                    config: config.clone(),
                    inner,
                })
            }

            /// Builds the policy named by the config's `__type__` key,
            /// falling back to `default`.
            pub fn from_config(config: &Metadata) -> Result<Self> {
                let (type_name, config) = split_config(config);
                Self::from_metadata(&type_name, &config)
            }

            /// Wraps an already constructed policy.
            pub fn from_policy(type_name: &str, config: Metadata, inner: Arc<dyn $policy>) -> Self {
                $name {
                    type_name: type_name.into(),
                    config,
                    inner,
                }
            }

            pub fn type_name(&self) -> &str {
                &self.type_name
            }

            /// The config this policy was built from, without its type.
            pub fn config(&self) -> &Metadata {
                &self.config
            }

            /// Self-describing config accepted by `from_config`.
            pub fn metadata(&self) -> Metadata {
                describe(&self.type_name, &self.config)
            }

            pub fn kind() -> PolicyKind {
                $kind
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name {
                    type_name: DEFAULT_TYPE.into(),
                    config: Metadata::empty(),
                    inner: $registry().default_policy(),
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("type_name", &self.type_name)
                    .field("config", &self.config)
                    .finish()
            }
        }
    };
}

policy_handle!(
    /// Topic-bound acceptance policy.
    Validator,
    ValidatorPolicy,
    PolicyKind::Validator,
    registry::validators
);

policy_handle!(
    /// Topic-bound routing policy.
    PartitionSelector,
    PartitionSelectorPolicy,
    PolicyKind::PartitionSelector,
    registry::partition_selectors
);

policy_handle!(
    /// Topic-bound metadata encoding.
    Serializer,
    SerializerPolicy,
    PolicyKind::Serializer,
    registry::serializers
);

impl Validator {
    pub fn validate(&self, metadata: &Metadata, data: &Data) -> Result<()> {
        self.inner.validate(metadata, data)
    }
}

impl PartitionSelector {
    pub fn select(
        &self,
        metadata: &Metadata,
        partitions: usize,
        requested: Option<usize>,
    ) -> Result<usize> {
        self.inner.select(metadata, partitions, requested)
    }
}

impl Serializer {
    pub fn serialize(&self, metadata: &Metadata) -> Result<Vec<u8>> {
        self.inner.serialize(metadata)
    }

    pub fn deserialize(&self, bytes: &[u8]) -> Result<Metadata> {
        self.inner.deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::FluxError;

    #[test]
    fn from_config_reads_type_key() {
        let config = Metadata::new(json!({
            "__type__": "schema",
            "schema": {"type": "object", "required": ["x"]}
        }));
        let v = Validator::from_config(&config).expect("schema validator");
        assert_eq!(v.type_name(), "schema");
        assert!(v.config().get(TYPE_KEY).is_none());
        assert_eq!(v.metadata().get_str(TYPE_KEY), Some("schema"));

        let rebuilt = Validator::from_config(&v.metadata()).expect("round trip");
        assert_eq!(rebuilt.type_name(), "schema");
        assert!(rebuilt.validate(&Metadata::new(json!({})), &Data::empty()).is_err());
    }

    #[test]
    fn missing_type_key_means_default() {
        let s = Serializer::from_config(&Metadata::empty()).expect("default");
        assert_eq!(s.type_name(), DEFAULT_TYPE);
    }

    #[test]
    fn unknown_type_is_not_silently_defaulted() {
        let err = PartitionSelector::from_metadata("consistent_ring", &Metadata::empty())
            .expect_err("unknown");
        assert_eq!(
            err,
            FluxError::PolicyNotFound {
                kind: PolicyKind::PartitionSelector,
                name: "consistent_ring".into()
            }
        );
    }
}
