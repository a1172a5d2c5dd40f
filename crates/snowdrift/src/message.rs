//! Input events.
//!
//! Each input line is one JSON object with a `type` discriminator. Lines are
//! parsed in two steps: the envelope is checked for the keys each type
//! requires, then the typed message is deserialized from it.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use snafu::prelude::*;

use crate::error::{
    InvalidFieldSnafu, InvalidJsonSnafu, MissingKeySnafu, NotAnObjectSnafu, ProtocolError,
    UnknownTypeSnafu,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Schema(SchemaMessage),
    Record(RecordMessage),
    State(StateMessage),
    Batch(BatchMessage),
    ActivateVersion(ActivateVersionMessage),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SchemaMessage {
    pub stream: String,
    pub schema: Value,
    /// Absent and empty are different: absent is always rejected.
    #[serde(default)]
    pub key_properties: Option<Vec<String>>,
    #[serde(default)]
    pub bookmark_properties: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecordMessage {
    pub stream: String,
    pub record: Map<String, Value>,
    #[serde(default)]
    pub time_extracted: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StateMessage {
    pub value: Value,
}

/// A pre-built file of records for one stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchMessage {
    pub stream: String,
    #[serde(alias = "file_ref")]
    pub filepath: String,
    #[serde(default = "default_batch_format")]
    pub format: String,
    #[serde(default)]
    pub compression: Option<String>,
    #[serde(default, alias = "batch_size")]
    pub size: Option<u64>,
}

fn default_batch_format() -> String {
    "jsonl".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActivateVersionMessage {
    pub stream: String,
    #[serde(default)]
    pub version: Option<i64>,
}

/// Parse one input line.
pub fn parse_line(line: &str) -> Result<Event, ProtocolError> {
    let value: Value = serde_json::from_str(line).context(InvalidJsonSnafu { line })?;
    let Value::Object(object) = value else {
        return NotAnObjectSnafu { line }.fail();
    };

    let kind = match object.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(other) => other.to_string(),
        None => return MissingKeySnafu { key: "type", line }.fail(),
    };

    let event = match kind.as_str() {
        "SCHEMA" => {
            require(&object, &["stream", "schema"], line)?;
            Event::Schema(typed(object)?)
        }
        "RECORD" => {
            require(&object, &["stream", "record"], line)?;
            Event::Record(typed(object)?)
        }
        "STATE" => {
            require(&object, &["value"], line)?;
            Event::State(typed(object)?)
        }
        "BATCH" => {
            require(&object, &["stream"], line)?;
            if !object.contains_key("filepath") && !object.contains_key("file_ref") {
                return MissingKeySnafu { key: "filepath", line }.fail();
            }
            Event::Batch(typed(object)?)
        }
        "ACTIVATE_VERSION" => {
            require(&object, &["stream"], line)?;
            Event::ActivateVersion(typed(object)?)
        }
        _ => return UnknownTypeSnafu { kind, line }.fail(),
    };
    Ok(event)
}

fn require(object: &Map<String, Value>, keys: &[&str], line: &str) -> Result<(), ProtocolError> {
    match keys.iter().find(|key| !object.contains_key(**key)) {
        Some(key) => MissingKeySnafu { key: *key, line }.fail(),
        None => Ok(()),
    }
}

fn typed<T: DeserializeOwned>(object: Map<String, Value>) -> Result<T, ProtocolError> {
    serde_json::from_value(Value::Object(object)).context(InvalidFieldSnafu { key: "message" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_message() {
        let line = r#"{"type": "SCHEMA", "stream": "public-orders", "schema": {"properties": {"id": {"type": "integer"}}}, "key_properties": ["id"], "bookmark_properties": ["updated_at"]}"#;
        let Event::Schema(schema) = parse_line(line).unwrap() else {
            panic!("expected schema");
        };
        assert_eq!(schema.stream, "public-orders");
        assert_eq!(schema.key_properties, Some(vec!["id".to_string()]));
        assert_eq!(schema.bookmark_properties, Some(vec!["updated_at".to_string()]));
    }

    #[test]
    fn test_schema_without_key_properties_parses() {
        let line = r#"{"type": "SCHEMA", "stream": "t", "schema": {}}"#;
        let Event::Schema(schema) = parse_line(line).unwrap() else {
            panic!("expected schema");
        };
        assert_eq!(schema.key_properties, None);
    }

    #[test]
    fn test_record_message() {
        let line = r#"{"type": "RECORD", "stream": "t", "record": {"id": 1}, "time_extracted": "2024-01-01T00:00:00Z"}"#;
        let Event::Record(record) = parse_line(line).unwrap() else {
            panic!("expected record");
        };
        assert_eq!(record.record["id"], 1);
        assert_eq!(record.time_extracted.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn test_batch_message_aliases() {
        let line = r#"{"type": "BATCH", "stream": "t", "file_ref": "/tmp/b.jsonl", "batch_size": 10}"#;
        let Event::Batch(batch) = parse_line(line).unwrap() else {
            panic!("expected batch");
        };
        assert_eq!(batch.filepath, "/tmp/b.jsonl");
        assert_eq!(batch.format, "jsonl");
        assert_eq!(batch.size, Some(10));
        assert_eq!(batch.compression, None);
    }

    #[test]
    fn test_state_and_activate_version() {
        assert!(matches!(
            parse_line(r#"{"type": "STATE", "value": {"bookmarks": {}}}"#).unwrap(),
            Event::State(_)
        ));
        assert!(matches!(
            parse_line(r#"{"type": "ACTIVATE_VERSION", "stream": "t", "version": 3}"#).unwrap(),
            Event::ActivateVersion(ActivateVersionMessage { version: Some(3), .. })
        ));
    }

    #[test]
    fn test_protocol_errors() {
        assert!(matches!(
            parse_line("not json").unwrap_err(),
            ProtocolError::InvalidJson { .. }
        ));
        assert!(matches!(
            parse_line("[1, 2]").unwrap_err(),
            ProtocolError::NotAnObject { .. }
        ));
        assert!(matches!(
            parse_line(r#"{"stream": "t"}"#).unwrap_err(),
            ProtocolError::MissingKey { key, .. } if key == "type"
        ));
        assert!(matches!(
            parse_line(r#"{"type": "RECORD", "record": {}}"#).unwrap_err(),
            ProtocolError::MissingKey { key, .. } if key == "stream"
        ));
        assert!(matches!(
            parse_line(r#"{"type": "SCHEMA", "stream": "t"}"#).unwrap_err(),
            ProtocolError::MissingKey { key, .. } if key == "schema"
        ));
        assert!(matches!(
            parse_line(r#"{"type": "BATCH", "stream": "t"}"#).unwrap_err(),
            ProtocolError::MissingKey { key, .. } if key == "filepath"
        ));
        assert!(matches!(
            parse_line(r#"{"type": "UNKNOWN"}"#).unwrap_err(),
            ProtocolError::UnknownType { kind, .. } if kind == "UNKNOWN"
        ));
        assert!(matches!(
            parse_line(r#"{"type": "RECORD", "stream": "t", "record": [1]}"#).unwrap_err(),
            ProtocolError::InvalidField { .. }
        ));
    }
}
