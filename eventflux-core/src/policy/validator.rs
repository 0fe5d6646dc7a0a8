use super::ValidatorPolicy;
use crate::{
    error::{FluxError, Result},
    metadata::{Data, Metadata},
};

/// Built-in validator: metadata must be a JSON object.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonObjectValidator;

impl ValidatorPolicy for JsonObjectValidator {
    fn validate(&self, metadata: &Metadata, _data: &Data) -> Result<()> {
        if metadata.is_object() {
            Ok(())
        } else {
            Err(FluxError::Validation(format!(
                "metadata must be a JSON object, got {}",
                metadata
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accepts_objects_only() {
        let v = JsonObjectValidator;
        assert!(v.validate(&Metadata::new(json!({"x": 1})), &Data::empty()).is_ok());
        assert!(v.validate(&Metadata::new(json!([1, 2])), &Data::empty()).is_err());
        assert!(v.validate(&Metadata::new(json!("x")), &Data::empty()).is_err());
    }
}
