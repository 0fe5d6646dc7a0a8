//! Error taxonomy shared by every eventflux component.
//!
//! Directory operations return these errors synchronously. Producer and
//! consumer operations deliver them through the associated [`crate::future::Future`].

use std::fmt;

/// Boxed error type returned by caller-supplied callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FluxError {
    /// Event rejected by a topic policy.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Transport or partition failure while appending a batch.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("view [{offset}, {offset}+{size}) out of range for descriptor of size {bound}")]
    OutOfRange { offset: u64, size: u64, bound: u64 },

    /// A data selector or data broker failed or panicked.
    #[error("callback failed: {0}")]
    Callback(String),

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("invalid provider {address:?}: {reason}")]
    InvalidProvider { address: String, reason: String },

    /// The completing side of a future went away without a value.
    #[error("operation cancelled")]
    Cancellation,

    #[error("no {kind} policy registered under {name:?}")]
    PolicyNotFound { kind: PolicyKind, name: String },

    #[error("invalid {kind} policy configuration: {reason}")]
    InvalidPolicyConfig { kind: PolicyKind, reason: String },

    #[error("topic {0:?} not found")]
    TopicNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Acknowledging the end-of-stream marker.
    #[error("no more events")]
    NoMoreEvents,
}

/// The policy families a topic binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    Validator,
    PartitionSelector,
    Serializer,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Validator => write!(f, "validator"),
            PolicyKind::PartitionSelector => write!(f, "partition selector"),
            PolicyKind::Serializer => write!(f, "serializer"),
        }
    }
}

impl From<serde_json::Error> for FluxError {
    fn from(e: serde_json::Error) -> Self {
        FluxError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FluxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_item() {
        let e = FluxError::AlreadyExists {
            kind: "topic",
            name: "orders".into(),
        };
        assert_eq!(e.to_string(), "topic \"orders\" already exists");

        let e = FluxError::PolicyNotFound {
            kind: PolicyKind::Serializer,
            name: "avro".into(),
        };
        assert!(e.to_string().contains("serializer"));
        assert!(e.to_string().contains("avro"));
    }

    #[test]
    fn json_errors_become_serialization_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{").expect_err("must fail");
        assert!(matches!(FluxError::from(err), FluxError::Serialization(_)));
    }
}
