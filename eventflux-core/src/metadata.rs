//! Event metadata and payload types.
//!
//! This module provides:
//! - `Metadata`: a structured JSON document attached to every event.
//! - `Data`: an ordered list of owned byte segments travelling with an event.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FluxError, Result};

/// Structured key/value document describing an event.
///
/// The engine treats the document as opaque except where a policy inspects
/// it. Values are addressed with dotted paths (`"sensor.id"`).
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Value);

impl Metadata {
    pub fn new(value: Value) -> Self {
        Metadata(value)
    }

    /// An empty JSON object.
    pub fn empty() -> Self {
        Metadata(Value::Object(Default::default()))
    }

    /// Parses a JSON string.
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map(Metadata)
            .map_err(|e| FluxError::Validation(format!("metadata is not valid JSON: {e}")))
    }

    pub fn json(&self) -> &Value {
        &self.0
    }

    pub fn into_json(self) -> Value {
        self.0
    }

    pub fn is_object(&self) -> bool {
        self.0.is_object()
    }

    /// Looks up a dotted path, e.g. `"a.b.c"`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.0, |node, key| node.get(key))
    }

    /// Reads a string field, used by policy configs.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Compact JSON rendering.
    pub fn to_json_string(&self) -> String {
        self.0.to_string()
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata::empty()
    }
}

impl From<Value> for Metadata {
    fn from(value: Value) -> Self {
        Metadata(value)
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Metadata({})", self.0)
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered byte segments that make up an event's payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Data {
    segments: Vec<Vec<u8>>,
}

impl Data {
    pub fn new(segments: Vec<Vec<u8>>) -> Self {
        Data { segments }
    }

    pub fn empty() -> Self {
        Data::default()
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<Vec<u8>> {
        self.segments
    }

    /// Total number of bytes across all segments.
    pub fn size(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Concatenates all segments.
    pub fn to_vec(&self) -> Vec<u8> {
        self.segments.concat()
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Self {
        Data {
            segments: vec![bytes],
        }
    }
}

impl From<&[u8]> for Data {
    fn from(bytes: &[u8]) -> Self {
        Data::from(bytes.to_vec())
    }
}
