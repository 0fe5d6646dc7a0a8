//! Content-filter validator using event-bus style patterns.
//!
//! Configured with `{"schema": <pattern>}` where a pattern is an object
//! mapping (possibly dotted) field names to conditions:
//!
//! ```text
//! { "source": "sensor" }                        exact value
//! { "kind": ["a", "b"] }                        one of several values
//! { "detail": { "state": "ok" } }               nested pattern
//! { "name": [ {"prefix": "eu-"} ] }             rule list, any rule may match
//! { "$or": [ {"x": 1}, {"y": 2} ] }             any sub-pattern matches
//! ```
//!
//! Rules: `prefix`, `suffix` (both optionally with `equals-ignore-case`),
//! `anything-but`, `equals-ignore-case`, `numeric`, `wildcard`, `exists`
//! and `$or`. All top-level conditions must hold for an event to pass.

use regex::Regex;
use serde_json::{Map, Value};

use super::ValidatorPolicy;
use crate::{
    error::{FluxError, PolicyKind, Result},
    metadata::{Data, Metadata},
};

#[derive(Debug)]
pub struct EventbridgeValidator {
    pattern: Pattern,
}

/// Conjunction of field conditions, optionally with `$or` alternatives.
#[derive(Debug)]
struct Pattern {
    fields: Vec<(String, FieldTest)>,
    alternatives: Vec<Vec<Pattern>>,
}

#[derive(Debug)]
enum FieldTest {
    Equals(Value),
    OneOf(Vec<Value>),
    Nested(Pattern),
    AnyRule(Vec<Rule>),
}

#[derive(Debug)]
enum Rule {
    Exists(bool),
    Prefix { values: Vec<String>, ignore_case: bool },
    Suffix { values: Vec<String>, ignore_case: bool },
    EqualsIgnoreCase(Vec<String>),
    AnythingBut(AnythingBut),
    Numeric(Vec<(NumericOp, f64)>),
    Wildcard(Regex),
    Or(Vec<Pattern>),
}

#[derive(Debug)]
enum AnythingBut {
    Values(Vec<Value>),
    Rule(Box<Rule>),
}

#[derive(Debug, Clone, Copy)]
enum NumericOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

fn invalid(reason: impl Into<String>) -> FluxError {
    FluxError::InvalidPolicyConfig {
        kind: PolicyKind::Validator,
        reason: format!("invalid eventbridge pattern: {}", reason.into()),
    }
}

impl EventbridgeValidator {
    pub fn from_config(config: &Metadata) -> Result<Self> {
        let pattern = config
            .get("schema")
            .ok_or_else(|| invalid("config requires a \"schema\" field"))?;
        EventbridgeValidator::new(pattern)
    }

    pub fn new(pattern: &Value) -> Result<Self> {
        Ok(EventbridgeValidator {
            pattern: compile_pattern(pattern)?,
        })
    }

    pub fn matches(&self, value: &Value) -> bool {
        self.pattern.matches(value)
    }
}

impl ValidatorPolicy for EventbridgeValidator {
    fn validate(&self, metadata: &Metadata, _data: &Data) -> Result<()> {
        if self.matches(metadata.json()) {
            Ok(())
        } else {
            Err(FluxError::Validation(
                "metadata does not satisfy eventbridge pattern".into(),
            ))
        }
    }
}

fn compile_pattern(pattern: &Value) -> Result<Pattern> {
    let map = pattern
        .as_object()
        .ok_or_else(|| invalid(format!("expected object, got {pattern}")))?;
    let mut compiled = Pattern {
        fields: Vec::new(),
        alternatives: Vec::new(),
    };
    for (key, value) in map {
        if key == "$or" {
            compiled.alternatives.push(compile_or(value)?);
            continue;
        }
        let test = match value {
            Value::Object(_) => FieldTest::Nested(compile_pattern(value)?),
            Value::Array(list) => compile_list(list)?,
            primitive => FieldTest::Equals(primitive.clone()),
        };
        compiled.fields.push((key.clone(), test));
    }
    Ok(compiled)
}

fn compile_or(value: &Value) -> Result<Vec<Pattern>> {
    let list = value
        .as_array()
        .ok_or_else(|| invalid("\"$or\" must be a list of objects"))?;
    list.iter().map(compile_pattern).collect()
}

fn compile_list(list: &[Value]) -> Result<FieldTest> {
    let objects = list.iter().filter(|v| v.is_object()).count();
    if objects == 0 {
        if list.iter().any(Value::is_array) {
            return Err(invalid("nested lists are not allowed"));
        }
        return Ok(FieldTest::OneOf(list.to_vec()));
    }
    if objects != list.len() {
        return Err(invalid("cannot mix primitives with complex conditions"));
    }
    let rules = list
        .iter()
        .filter_map(Value::as_object)
        .map(|rule| {
            if rule.len() != 1 {
                return Err(invalid("each rule can only have one statement"));
            }
            compile_rule(rule)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(FieldTest::AnyRule(rules))
}

fn compile_rule(rule: &Map<String, Value>) -> Result<Rule> {
    let Some((name, arg)) = rule.iter().next() else {
        return Err(invalid("empty rule"));
    };
    match name.as_str() {
        "exists" => arg
            .as_bool()
            .map(Rule::Exists)
            .ok_or_else(|| invalid("\"exists\" expects a boolean")),
        "prefix" => {
            let (values, ignore_case) = affixes(arg, "prefix")?;
            Ok(Rule::Prefix { values, ignore_case })
        }
        "suffix" => {
            let (values, ignore_case) = affixes(arg, "suffix")?;
            Ok(Rule::Suffix { values, ignore_case })
        }
        "equals-ignore-case" => Ok(Rule::EqualsIgnoreCase(
            strings(arg, "equals-ignore-case")?
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
        )),
        "anything-but" => match arg {
            Value::Array(list) => {
                if list.iter().any(|v| v.is_array() || v.is_object()) {
                    return Err(invalid("\"anything-but\" list must contain only primitives"));
                }
                Ok(Rule::AnythingBut(AnythingBut::Values(list.clone())))
            }
            Value::Object(inner) => {
                if inner.len() != 1 {
                    return Err(invalid("\"anything-but\" takes a single sub-rule"));
                }
                Ok(Rule::AnythingBut(AnythingBut::Rule(Box::new(compile_rule(inner)?))))
            }
            primitive => Ok(Rule::AnythingBut(AnythingBut::Values(vec![primitive.clone()]))),
        },
        "numeric" => compile_numeric(arg),
        "wildcard" => {
            let source = arg
                .as_str()
                .ok_or_else(|| invalid("\"wildcard\" expects a string"))?;
            Ok(Rule::Wildcard(wildcard_regex(source)?))
        }
        "$or" => Ok(Rule::Or(compile_or(arg)?)),
        other => Err(invalid(format!("unexpected rule {other:?}"))),
    }
}

fn strings(arg: &Value, rule: &str) -> Result<Vec<String>> {
    match arg {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(list) => list
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(format!("\"{rule}\" list should contain only strings")))
            })
            .collect(),
        _ => Err(invalid(format!("\"{rule}\" expects a string or a list of strings"))),
    }
}

fn affixes(arg: &Value, rule: &str) -> Result<(Vec<String>, bool)> {
    match arg {
        Value::Object(inner) => {
            let Some(values) = inner.get("equals-ignore-case").filter(|_| inner.len() == 1) else {
                return Err(invalid(format!(
                    "only \"equals-ignore-case\" is allowed inside \"{rule}\""
                )));
            };
            let lowered = strings(values, rule)?
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect();
            Ok((lowered, true))
        }
        other => Ok((strings(other, rule)?, false)),
    }
}

fn compile_numeric(arg: &Value) -> Result<Rule> {
    let list = arg
        .as_array()
        .filter(|l| !l.is_empty() && l.len() % 2 == 0)
        .ok_or_else(|| invalid("\"numeric\" expects an even-length list of operator/operand pairs"))?;
    let mut conditions = Vec::with_capacity(list.len() / 2);
    for pair in list.chunks(2) {
        let op = match pair[0].as_str() {
            Some("=") => NumericOp::Eq,
            Some("<") => NumericOp::Lt,
            Some("<=") => NumericOp::Le,
            Some(">") => NumericOp::Gt,
            Some(">=") => NumericOp::Ge,
            _ => return Err(invalid(format!("unknown numeric operator {}", pair[0]))),
        };
        let operand = pair[1]
            .as_f64()
            .ok_or_else(|| invalid("numeric operand should be a number"))?;
        conditions.push((op, operand));
    }
    Ok(Rule::Numeric(conditions))
}

/// `*` matches any run of characters; everything else is literal.
fn wildcard_regex(source: &str) -> Result<Regex> {
    let body = source
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).map_err(|e| invalid(e.to_string()))
}

fn lookup<'a>(value: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted.split('.').try_fold(value, |node, key| node.get(key))
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

impl Pattern {
    fn matches(&self, doc: &Value) -> bool {
        self.fields
            .iter()
            .all(|(key, test)| test.matches(lookup(doc, key)))
            && self
                .alternatives
                .iter()
                .all(|any| any.iter().any(|p| p.matches(doc)))
    }
}

impl FieldTest {
    fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            FieldTest::Equals(expected) => value.is_some_and(|v| same_value(v, expected)),
            FieldTest::OneOf(options) => {
                value.is_some_and(|v| options.iter().any(|o| same_value(v, o)))
            }
            FieldTest::Nested(pattern) => value.is_some_and(|v| pattern.matches(v)),
            FieldTest::AnyRule(rules) => rules.iter().any(|r| r.matches(value)),
        }
    }
}

impl Rule {
    fn matches(&self, value: Option<&Value>) -> bool {
        let value = match (self, value) {
            (Rule::Exists(expected), found) => return found.is_some() == *expected,
            (_, None) => return false,
            (_, Some(v)) => v,
        };
        match self {
            Rule::Exists(_) => false,
            Rule::Prefix { values, ignore_case } => value.as_str().is_some_and(|s| {
                let s = fold(s, *ignore_case);
                values.iter().any(|p| s.starts_with(p.as_str()))
            }),
            Rule::Suffix { values, ignore_case } => value.as_str().is_some_and(|s| {
                let s = fold(s, *ignore_case);
                values.iter().any(|p| s.ends_with(p.as_str()))
            }),
            Rule::EqualsIgnoreCase(values) => value
                .as_str()
                .is_some_and(|s| values.contains(&s.to_lowercase())),
            Rule::AnythingBut(AnythingBut::Values(values)) => {
                !values.iter().any(|v| same_value(v, value))
            }
            Rule::AnythingBut(AnythingBut::Rule(rule)) => !rule.matches(Some(value)),
            Rule::Numeric(conditions) => value.as_f64().is_some_and(|n| {
                conditions.iter().all(|(op, operand)| match op {
                    NumericOp::Eq => n == *operand,
                    NumericOp::Lt => n < *operand,
                    NumericOp::Le => n <= *operand,
                    NumericOp::Gt => n > *operand,
                    NumericOp::Ge => n >= *operand,
                })
            }),
            Rule::Wildcard(re) => value.as_str().is_some_and(|s| re.is_match(s)),
            Rule::Or(patterns) => patterns.iter().any(|p| p.matches(value)),
        }
    }
}

fn fold(s: &str, ignore_case: bool) -> std::borrow::Cow<'_, str> {
    if ignore_case {
        std::borrow::Cow::Owned(s.to_lowercase())
    } else {
        std::borrow::Cow::Borrowed(s)
    }
}
