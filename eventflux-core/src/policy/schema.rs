//! JSON-schema-like validator.
//!
//! The validator is configured with `{"schema": <schema>}` and supports the
//! keywords `type`, `enum`, `const`, `minimum`, `maximum`,
//! `exclusiveMinimum`, `exclusiveMaximum`, `minLength`, `maxLength`,
//! `pattern`, `items`, `minItems`, `maxItems`, `properties`, `required` and
//! `additionalProperties`. Boolean schemas (`true` / `false`) are accepted
//! anywhere a schema is. Unknown keywords are ignored.
//!
//! The schema is compiled once at construction, so a malformed schema is
//! reported when the topic is created rather than on the first push. Every
//! violation found in a document is reported, each tagged with the JSON
//! pointer of the offending value.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{Map, Value};

use super::ValidatorPolicy;
use crate::{
    error::{FluxError, PolicyKind, Result},
    metadata::{Data, Metadata},
};

#[derive(Debug)]
pub struct SchemaValidator {
    root: Node,
}

#[derive(Debug)]
enum Node {
    Any,
    Never,
    Rules(Box<Rules>),
}

#[derive(Debug, Default)]
struct Rules {
    types: Option<Vec<JsonType>>,
    enumeration: Option<Vec<Value>>,
    constant: Option<Value>,
    minimum: Option<f64>,
    maximum: Option<f64>,
    exclusive_minimum: Option<f64>,
    exclusive_maximum: Option<f64>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    pattern: Option<Regex>,
    items: Option<Node>,
    min_items: Option<usize>,
    max_items: Option<usize>,
    properties: BTreeMap<String, Node>,
    required: Vec<String>,
    additional: Option<Node>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonType {
    Null,
    Boolean,
    Integer,
    Number,
    String,
    Array,
    Object,
}

impl JsonType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "null" => JsonType::Null,
            "boolean" => JsonType::Boolean,
            "integer" => JsonType::Integer,
            "number" => JsonType::Number,
            "string" => JsonType::String,
            "array" => JsonType::Array,
            "object" => JsonType::Object,
            _ => return None,
        })
    }

    fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonType::Null,
            Value::Bool(_) => JsonType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => JsonType::Integer,
            Value::Number(_) => JsonType::Number,
            Value::String(_) => JsonType::String,
            Value::Array(_) => JsonType::Array,
            Value::Object(_) => JsonType::Object,
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (JsonType::Number, Value::Number(_)) => true,
            (JsonType::Integer, Value::Number(n)) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => JsonType::of(value) == self,
        }
    }

    fn name(self) -> &'static str {
        match self {
            JsonType::Null => "null",
            JsonType::Boolean => "boolean",
            JsonType::Integer => "integer",
            JsonType::Number => "number",
            JsonType::String => "string",
            JsonType::Array => "array",
            JsonType::Object => "object",
        }
    }
}

fn config_error(reason: impl Into<String>) -> FluxError {
    FluxError::InvalidPolicyConfig {
        kind: PolicyKind::Validator,
        reason: reason.into(),
    }
}

impl SchemaValidator {
    pub fn from_config(config: &Metadata) -> Result<Self> {
        let schema = config
            .get("schema")
            .ok_or_else(|| config_error("schema validator config requires a \"schema\" field"))?;
        SchemaValidator::new(schema)
    }

    pub fn new(schema: &Value) -> Result<Self> {
        let root = compile(schema, "#").map_err(config_error)?;
        Ok(SchemaValidator { root })
    }

    /// All violations of `value`, empty when it conforms.
    pub fn violations(&self, value: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        check(&self.root, value, "", &mut errors);
        errors
    }
}

impl ValidatorPolicy for SchemaValidator {
    fn validate(&self, metadata: &Metadata, _data: &Data) -> Result<()> {
        let errors = self.violations(metadata.json());
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FluxError::Validation(format!(
                "Metadata does not comply to required schema: {}",
                errors.join("; ")
            )))
        }
    }
}

fn compile(schema: &Value, at: &str) -> std::result::Result<Node, String> {
    let map = match schema {
        Value::Bool(true) => return Ok(Node::Any),
        Value::Bool(false) => return Ok(Node::Never),
        Value::Object(map) => map,
        other => return Err(format!("{at}: schema must be an object or boolean, got {other}")),
    };

    let mut rules = Rules::default();

    if let Some(t) = map.get("type") {
        let names: Vec<&Value> = match t {
            Value::Array(list) => list.iter().collect(),
            single => vec![single],
        };
        let mut types = Vec::with_capacity(names.len());
        for name in names {
            let parsed = name
                .as_str()
                .and_then(JsonType::parse)
                .ok_or_else(|| format!("{at}/type: unknown type {name}"))?;
            types.push(parsed);
        }
        rules.types = Some(types);
    }

    if let Some(e) = map.get("enum") {
        let values = e
            .as_array()
            .ok_or_else(|| format!("{at}/enum: must be an array"))?;
        rules.enumeration = Some(values.clone());
    }
    rules.constant = map.get("const").cloned();

    rules.minimum = number(map, "minimum", at)?;
    rules.maximum = number(map, "maximum", at)?;
    rules.exclusive_minimum = number(map, "exclusiveMinimum", at)?;
    rules.exclusive_maximum = number(map, "exclusiveMaximum", at)?;
    rules.min_length = count(map, "minLength", at)?;
    rules.max_length = count(map, "maxLength", at)?;
    rules.min_items = count(map, "minItems", at)?;
    rules.max_items = count(map, "maxItems", at)?;

    if let Some(p) = map.get("pattern") {
        let source = p
            .as_str()
            .ok_or_else(|| format!("{at}/pattern: must be a string"))?;
        let re = Regex::new(source).map_err(|e| format!("{at}/pattern: {e}"))?;
        rules.pattern = Some(re);
    }

    if let Some(items) = map.get("items") {
        rules.items = Some(compile(items, &format!("{at}/items"))?);
    }

    if let Some(props) = map.get("properties") {
        let props = props
            .as_object()
            .ok_or_else(|| format!("{at}/properties: must be an object"))?;
        for (name, sub) in props {
            let node = compile(sub, &format!("{at}/properties/{name}"))?;
            rules.properties.insert(name.clone(), node);
        }
    }

    if let Some(req) = map.get("required") {
        let req = req
            .as_array()
            .ok_or_else(|| format!("{at}/required: must be an array"))?;
        for name in req {
            let name = name
                .as_str()
                .ok_or_else(|| format!("{at}/required: entries must be strings"))?;
            rules.required.push(name.to_string());
        }
    }

    if let Some(extra) = map.get("additionalProperties") {
        rules.additional = Some(compile(extra, &format!("{at}/additionalProperties"))?);
    }

    Ok(Node::Rules(Box::new(rules)))
}

fn number(map: &Map<String, Value>, key: &str, at: &str) -> std::result::Result<Option<f64>, String> {
    match map.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| format!("{at}/{key}: must be a number")),
    }
}

fn count(map: &Map<String, Value>, key: &str, at: &str) -> std::result::Result<Option<usize>, String> {
    match map.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| format!("{at}/{key}: must be a non-negative integer")),
    }
}

fn pointer_or_root(pointer: &str) -> &str {
    if pointer.is_empty() { "/" } else { pointer }
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn check(node: &Node, value: &Value, pointer: &str, errors: &mut Vec<String>) {
    let rules = match node {
        Node::Any => return,
        Node::Never => {
            errors.push(format!("{}: no value is allowed here", pointer_or_root(pointer)));
            return;
        }
        Node::Rules(rules) => rules,
    };
    let here = pointer_or_root(pointer);

    if let Some(types) = &rules.types {
        if !types.iter().any(|t| t.accepts(value)) {
            let expected: Vec<&str> = types.iter().map(|t| t.name()).collect();
            errors.push(format!(
                "{here}: expected {}, found {}",
                expected.join(" or "),
                JsonType::of(value).name()
            ));
            // Keyword checks below assume the declared type.
            return;
        }
    }

    if let Some(options) = &rules.enumeration {
        if !options.contains(value) {
            errors.push(format!("{here}: {value} is not one of the allowed values"));
        }
    }
    if let Some(expected) = &rules.constant {
        if expected != value {
            errors.push(format!("{here}: expected constant {expected}, found {value}"));
        }
    }

    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if rules.minimum.is_some_and(|m| f < m) {
                    errors.push(format!("{here}: {f} is below the minimum"));
                }
                if rules.maximum.is_some_and(|m| f > m) {
                    errors.push(format!("{here}: {f} is above the maximum"));
                }
                if rules.exclusive_minimum.is_some_and(|m| f <= m) {
                    errors.push(format!("{here}: {f} must be greater than the exclusive minimum"));
                }
                if rules.exclusive_maximum.is_some_and(|m| f >= m) {
                    errors.push(format!("{here}: {f} must be less than the exclusive maximum"));
                }
            }
        }
        Value::String(s) => {
            let len = s.chars().count();
            if rules.min_length.is_some_and(|m| len < m) {
                errors.push(format!("{here}: string shorter than {}", rules.min_length.unwrap_or_default()));
            }
            if rules.max_length.is_some_and(|m| len > m) {
                errors.push(format!("{here}: string longer than {}", rules.max_length.unwrap_or_default()));
            }
            if let Some(re) = &rules.pattern {
                if !re.is_match(s) {
                    errors.push(format!("{here}: {s:?} does not match pattern {}", re.as_str()));
                }
            }
        }
        Value::Array(items) => {
            if rules.min_items.is_some_and(|m| items.len() < m) {
                errors.push(format!("{here}: fewer than {} items", rules.min_items.unwrap_or_default()));
            }
            if rules.max_items.is_some_and(|m| items.len() > m) {
                errors.push(format!("{here}: more than {} items", rules.max_items.unwrap_or_default()));
            }
            if let Some(item_schema) = &rules.items {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{pointer}/{i}"), errors);
                }
            }
        }
        Value::Object(map) => {
            for name in &rules.required {
                if !map.contains_key(name) {
                    errors.push(format!("{here}: missing required property {name:?}"));
                }
            }
            for (key, child) in map {
                let child_pointer = format!("{pointer}/{}", escape_pointer(key));
                match (rules.properties.get(key), &rules.additional) {
                    (Some(sub), _) => check(sub, child, &child_pointer, errors),
                    (None, Some(Node::Never)) => {
                        errors.push(format!("{here}: unexpected property {key:?}"));
                    }
                    (None, Some(extra)) => check(extra, child, &child_pointer, errors),
                    (None, None) => {}
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn validator(schema: Value) -> SchemaValidator {
        SchemaValidator::new(&schema).expect("valid schema")
    }

    #[test]
    fn type_mismatch_is_reported_with_pointer() {
        let v = validator(json!({
            "type": "object",
            "properties": {"x": {"type": "string"}},
            "required": ["x"]
        }));
        let err = v
            .validate(&Metadata::new(json!({"x": 123})), &Data::empty())
            .expect_err("x must be a string");
        let FluxError::Validation(msg) = err else {
            panic!("expected a validation error");
        };
        assert!(msg.starts_with("Metadata does not comply to required schema"));
        assert!(msg.contains("/x: expected string, found integer"), "{msg}");

        assert!(v.validate(&Metadata::new(json!({"x": "ok"})), &Data::empty()).is_ok());
    }

    #[test]
    fn collects_every_violation() {
        let v = validator(json!({
            "type": "object",
            "required": ["id", "tags"],
            "properties": {
                "id": {"type": "integer", "minimum": 1},
                "name": {"type": "string", "maxLength": 3, "pattern": "^[a-z]+$"},
                "tags": {"type": "array", "items": {"type": "string"}, "maxItems": 2}
            },
            "additionalProperties": false
        }));
        let errors = v.violations(&json!({
            "id": 0,
            "name": "ABCD",
            "tags": ["a", 2, "c"],
            "extra": true
        }));
        assert!(errors.iter().any(|e| e.starts_with("/id:")), "{errors:?}");
        assert_eq!(errors.iter().filter(|e| e.starts_with("/name:")).count(), 2);
        assert!(errors.iter().any(|e| e.starts_with("/tags/1:")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("more than 2 items")));
        assert!(errors.iter().any(|e| e.contains("unexpected property \"extra\"")));

        let errors = v.violations(&json!({}));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn enum_const_and_type_unions() {
        let v = validator(json!({
            "properties": {
                "level": {"enum": ["low", "high"]},
                "v": {"const": 2},
                "maybe": {"type": ["string", "null"]},
                "n": {"type": "integer"}
            }
        }));
        assert!(v.violations(&json!({"level": "low", "v": 2, "maybe": null, "n": 4.0})).is_empty());
        assert_eq!(v.violations(&json!({"level": "mid", "v": 3, "maybe": 1, "n": 4.5})).len(), 4);
    }

    #[test]
    fn malformed_schemas_are_rejected_up_front() {
        for schema in [
            json!("string"),
            json!({"type": "text"}),
            json!({"pattern": "("}),
            json!({"required": "x"}),
            json!({"properties": {"x": 5}}),
            json!({"minLength": -1}),
        ] {
            assert!(
                matches!(SchemaValidator::new(&schema), Err(FluxError::InvalidPolicyConfig { .. })),
                "{schema}"
            );
        }
    }

    #[test]
    fn pointer_escapes_special_characters() {
        let v = validator(json!({"additionalProperties": {"type": "string"}}));
        let errors = v.violations(&json!({"a/b": 1}));
        assert_eq!(errors, vec!["/a~1b: expected string, found integer".to_string()]);
    }
}
