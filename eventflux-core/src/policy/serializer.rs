use super::{SerializerPolicy, schema::SchemaValidator};
use crate::{
    error::{FluxError, PolicyKind, Result},
    metadata::Metadata,
};

/// Built-in serializer: compact JSON text.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl SerializerPolicy for JsonSerializer {
    fn serialize(&self, metadata: &Metadata) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(metadata.json())?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Metadata> {
        Ok(Metadata::new(serde_json::from_slice(bytes)?))
    }
}

/// JSON body preceded by its length as a little-endian `u32`. Metadata
/// must conform to the configured schema to be encoded.
///
/// Configured with `{"schema": <schema>}`, using the same schema subset as
/// the schema validator.
#[derive(Debug)]
pub struct SchemaSerializer {
    schema: SchemaValidator,
}

const PREFIX: usize = std::mem::size_of::<u32>();

impl SchemaSerializer {
    pub fn from_config(config: &Metadata) -> Result<Self> {
        let schema = config.get("schema").ok_or_else(|| FluxError::InvalidPolicyConfig {
            kind: PolicyKind::Serializer,
            reason: "schema serializer config requires a \"schema\" field".into(),
        })?;
        let schema = SchemaValidator::new(schema).map_err(|e| match e {
            FluxError::InvalidPolicyConfig { reason, .. } => FluxError::InvalidPolicyConfig {
                kind: PolicyKind::Serializer,
                reason,
            },
            other => other,
        })?;
        Ok(SchemaSerializer { schema })
    }
}

impl SerializerPolicy for SchemaSerializer {
    fn serialize(&self, metadata: &Metadata) -> Result<Vec<u8>> {
        let violations = self.schema.violations(metadata.json());
        if !violations.is_empty() {
            return Err(FluxError::Serialization(format!(
                "metadata does not match the serializer schema: {}",
                violations.join("; ")
            )));
        }
        let body = serde_json::to_vec(metadata.json())?;
        let len = u32::try_from(body.len())
            .map_err(|_| FluxError::Serialization(format!("metadata too large: {} bytes", body.len())))?;
        let mut out = Vec::with_capacity(PREFIX + body.len());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Metadata> {
        let Some((head, body)) = bytes.split_first_chunk::<PREFIX>() else {
            return Err(FluxError::Serialization(format!(
                "buffer of {} bytes is shorter than the length prefix",
                bytes.len()
            )));
        };
        let len = u32::from_le_bytes(*head) as usize;
        if len != body.len() {
            return Err(FluxError::Serialization(format!(
                "length prefix says {len} bytes but {} follow",
                body.len()
            )));
        }
        Ok(Metadata::new(serde_json::from_slice(body)?))
    }
}
