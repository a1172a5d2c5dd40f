//! Schema and record flattening.
//!
//! Nested object properties are turned into top-level columns named by their
//! path joined with `__`, down to a configurable depth. Anything left nested
//! below that depth is stored as a JSON document in a single column.

use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;
use serde_json::{Map, Number, Value};
use snafu::prelude::*;

use crate::error::{DuplicateColumnSnafu, FlattenError};

/// Separator between path segments of a flattened column name.
pub const SEPARATOR: &str = "__";

/// Longest column name produced before path segments get abbreviated.
const MAX_NAME_LENGTH: usize = 255;

/// Column name to column schema, sorted by name.
pub type FlatSchema = BTreeMap<String, Value>;

/// Column name to value, in record order.
pub type FlatRecord = IndexMap<String, FlatValue>;

/// A single column value of a flattened record.
#[derive(Debug, Clone, PartialEq)]
pub enum FlatValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// A nested value serialized as JSON text.
    Json(String),
}

impl FlatValue {
    fn from_scalar(value: Value) -> Self {
        match value {
            Value::Null => FlatValue::Null,
            Value::Bool(b) => FlatValue::Bool(b),
            Value::Number(n) => from_number(&n),
            Value::String(s) => FlatValue::String(s),
            nested => FlatValue::Json(nested.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FlatValue::Null)
    }

    /// JSON text of the value as it is written into a CSV load file.
    ///
    /// Returns `None` for values that are written as an empty field.
    pub fn to_json_text(&self) -> Option<String> {
        match self {
            FlatValue::Null => None,
            FlatValue::String(s) if s.is_empty() => None,
            FlatValue::Bool(b) => Some(b.to_string()),
            FlatValue::Int(i) => Some(i.to_string()),
            FlatValue::Float(f) => Some(float_text(*f)),
            FlatValue::String(s) | FlatValue::Json(s) => Some(Value::String(s.clone()).to_string()),
        }
    }

    /// Convert back into a JSON value. JSON text columns are parsed again.
    pub fn to_value(&self) -> Value {
        match self {
            FlatValue::Null => Value::Null,
            FlatValue::Bool(b) => Value::Bool(*b),
            FlatValue::Int(i) => Value::from(*i),
            FlatValue::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            FlatValue::String(s) => Value::String(s.clone()),
            FlatValue::Json(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        }
    }
}

impl fmt::Display for FlatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlatValue::Null => write!(f, "null"),
            FlatValue::Bool(b) => write!(f, "{b}"),
            FlatValue::Int(i) => write!(f, "{i}"),
            FlatValue::Float(v) => write!(f, "{}", float_text(*v)),
            FlatValue::String(s) | FlatValue::Json(s) => write!(f, "{s}"),
        }
    }
}

fn from_number(number: &Number) -> FlatValue {
    if let Some(i) = number.as_i64() {
        FlatValue::Int(i)
    } else if let Some(f) = number.as_f64() {
        FlatValue::Float(f)
    } else {
        FlatValue::String(number.to_string())
    }
}

fn float_text(value: f64) -> String {
    Number::from_f64(value).map_or_else(|| "null".to_string(), |n| n.to_string())
}

/// Whether a JSON schema `type` (a string or a list) includes `name`.
pub fn type_includes(property: &Value, name: &str) -> bool {
    match property.get("type") {
        Some(Value::String(t)) => t == name,
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some(name)),
        _ => false,
    }
}

fn format_of(property: &Value) -> Option<&str> {
    property.get("format").and_then(Value::as_str)
}

/// Column name for `key` nested under `parents`, abbreviated to fit the
/// identifier length limit.
pub fn flatten_key(key: &str, parents: &[String]) -> String {
    let mut segments: Vec<String> = parents.to_vec();
    segments.push(key.to_string());

    let mut joined = segments.join(SEPARATOR);
    let mut next = 0;
    while joined.len() >= MAX_NAME_LENGTH && next < segments.len() {
        segments[next] = abbreviate(&segments[next]);
        next += 1;
        joined = segments.join(SEPARATOR);
    }
    joined
}

fn abbreviate(segment: &str) -> String {
    let mut camel = String::with_capacity(segment.len());
    let mut upper_next = true;
    for c in segment.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            camel.extend(c.to_uppercase());
            upper_next = false;
        } else {
            camel.push(c);
        }
    }

    let capitals: String = camel.chars().filter(|c| !c.is_ascii_lowercase()).collect();
    let short = if capitals.chars().count() > 1 {
        capitals
    } else {
        segment.chars().take(3).collect()
    };
    short.to_lowercase()
}

/// Flatten the `properties` of an object schema into columns.
pub fn flatten_schema(schema: &Value, max_level: usize) -> Result<FlatSchema, FlattenError> {
    let mut columns = Vec::new();
    collect_schema_columns(schema, &[], 0, max_level, &mut columns);

    let mut flat = FlatSchema::new();
    for (name, property) in columns {
        ensure!(!flat.contains_key(&name), DuplicateColumnSnafu { column: name });
        flat.insert(name, property);
    }
    Ok(flat)
}

fn collect_schema_columns(
    schema: &Value,
    parents: &[String],
    level: usize,
    max_level: usize,
    out: &mut Vec<(String, Value)>,
) {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return;
    };

    for (key, property) in properties {
        let name = flatten_key(key, parents);
        if property.get("type").is_some() {
            if type_includes(property, "object") && property.get("properties").is_some() && level < max_level {
                let mut nested = parents.to_vec();
                nested.push(key.clone());
                collect_schema_columns(property, &nested, level + 1, max_level, out);
            } else {
                out.push((name, property.clone()));
            }
        } else if let Some(alternative) = first_alternative(property) {
            out.push((name, alternative));
        }
    }
}

/// First `anyOf`/`oneOf` alternative, widened to accept null.
fn first_alternative(property: &Value) -> Option<Value> {
    let alternatives = property
        .get("anyOf")
        .or_else(|| property.get("oneOf"))
        .and_then(Value::as_array)?;
    let mut first = alternatives.first()?.clone();
    let kind = first.get("type").and_then(Value::as_str).map(str::to_string);
    if let (Some(kind), Some(object)) = (kind, first.as_object_mut()) {
        object.insert("type".to_string(), Value::from(vec!["null".to_string(), kind]));
    }
    Some(first)
}

/// Flatten a record into the columns of `schema`.
///
/// Keys without a column in `schema` are dropped.
pub fn flatten_record(record: &Map<String, Value>, schema: &FlatSchema, max_level: usize) -> FlatRecord {
    let mut flat = FlatRecord::new();
    collect_record_values(record, schema, &[], 0, max_level, &mut flat);
    flat
}

fn collect_record_values(
    record: &Map<String, Value>,
    schema: &FlatSchema,
    parents: &[String],
    level: usize,
    max_level: usize,
    out: &mut FlatRecord,
) {
    for (key, value) in record {
        let name = flatten_key(key, parents);
        match value {
            Value::Object(nested) if level < max_level && !schema.contains_key(&name) => {
                let mut path = parents.to_vec();
                path.push(key.clone());
                collect_record_values(nested, schema, &path, level + 1, max_level, out);
            }
            _ => {
                let Some(property) = schema.get(&name) else {
                    continue;
                };
                out.insert(name, flat_value(value, property));
            }
        }
    }
}

fn flat_value(value: &Value, property: &Value) -> FlatValue {
    match value {
        Value::Object(_) | Value::Array(_) => FlatValue::Json(value.to_string()),
        Value::Null => FlatValue::Null,
        scalar if column_type(property) == "variant" => FlatValue::Json(scalar.to_string()),
        scalar => FlatValue::from_scalar(scalar.clone()),
    }
}

/// Rebuild the nested key structure of a flattened record.
pub fn unflatten_record(flat: &FlatRecord) -> Map<String, Value> {
    let mut root = Map::new();
    for (name, value) in flat {
        let segments: Vec<&str> = name.split(SEPARATOR).collect();
        insert_path(&mut root, &segments, value.to_value());
    }
    root
}

fn insert_path(node: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            node.insert(last.to_string(), value);
        }
        [first, rest @ ..] => {
            let entry = node
                .entry(first.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                insert_path(child, rest, value);
            }
        }
    }
}

/// Warehouse column type for a flattened column schema.
pub fn column_type(property: &Value) -> &'static str {
    let format = format_of(property);
    if type_includes(property, "object") || type_includes(property, "array") {
        "variant"
    } else if format == Some("date-time") {
        "timestamp_ntz"
    } else if format == Some("date") {
        "date"
    } else if format == Some("time") {
        "time"
    } else if format == Some("binary") {
        "binary"
    } else if type_includes(property, "number") {
        "float"
    } else if type_includes(property, "integer") && type_includes(property, "string") {
        "text"
    } else if type_includes(property, "integer") {
        "number"
    } else if type_includes(property, "boolean") {
        "boolean"
    } else {
        "text"
    }
}

/// SQL function applied to a staged value before it is loaded, if any.
pub fn column_trans(property: &Value) -> Option<&'static str> {
    if type_includes(property, "object") || type_includes(property, "array") {
        Some("parse_json")
    } else if format_of(property) == Some("binary") {
        Some("to_binary")
    } else {
        None
    }
}
