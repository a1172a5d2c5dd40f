//! Per-record transformation applied before a record is buffered.
//!
//! A raw record goes through, in order: date/time clamping, optional schema
//! validation, metadata columns, flattening. The same pipeline is used for
//! streamed `RECORD` lines and for the lines of a `BATCH` file.

use std::sync::{Arc, LazyLock};

use chrono::{NaiveDate, NaiveTime, Utc};
use regex::Regex;
use serde_json::{Map, Value, json};
use snafu::prelude::*;
use tracing::warn;

use crate::error::{PrimaryKeyNotFoundSnafu, UnexpectedValueTypeSnafu, ValidationError};
use crate::flatten::{FlatRecord, FlatSchema, flatten_record, type_includes};
use crate::validate::RecordValidator;

/// Value written for date-time and date columns that the warehouse cannot store.
pub const MAX_TIMESTAMP: &str = "9999-12-31 23:59:59.999999";

/// Value written for time columns that the warehouse cannot store.
pub const MAX_TIME: &str = "23:59:59.999999";

pub const EXTRACTED_AT: &str = "_sdc_extracted_at";
pub const BATCHED_AT: &str = "_sdc_batched_at";
pub const DELETED_AT: &str = "_sdc_deleted_at";

const DATE_TIME_FORMATS: &[&str] = &["date-time", "time", "date"];

/// Add the `_sdc_*` metadata columns to a stream schema.
pub fn add_metadata_columns(schema: &mut Value) {
    let Some(object) = schema.as_object_mut() else {
        return;
    };
    let properties = object
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(properties) = properties.as_object_mut() {
        properties.insert(
            EXTRACTED_AT.to_string(),
            json!({"type": ["null", "string"], "format": "date-time"}),
        );
        properties.insert(
            BATCHED_AT.to_string(),
            json!({"type": ["null", "string"], "format": "date-time"}),
        );
        properties.insert(DELETED_AT.to_string(), json!({"type": ["null", "string"]}));
    }
}

/// Current UTC time in the format written to `_sdc_batched_at`.
pub fn batched_at_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Set the `_sdc_*` metadata values of a record.
pub fn add_metadata_values(record: &mut Map<String, Value>, time_extracted: Option<&str>, batched_at: &str) {
    record.insert(
        EXTRACTED_AT.to_string(),
        time_extracted.map_or(Value::Null, |t| Value::String(t.to_string())),
    );
    record.insert(BATCHED_AT.to_string(), Value::String(batched_at.to_string()));
    let deleted_at = record.get(DELETED_AT).cloned().unwrap_or(Value::Null);
    record.insert(DELETED_AT.to_string(), deleted_at);
}

/// Replace date, time and date-time strings the warehouse cannot represent
/// with the largest value of the column type.
pub fn clamp_date_times(record: &mut Map<String, Value>, schema: &Value) -> Result<(), ValidationError> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (key, value) in record.iter_mut() {
        if value.is_null() {
            continue;
        }
        let Some(format) = properties.get(key).and_then(date_time_format) else {
            continue;
        };
        let Value::String(text) = value else {
            return UnexpectedValueTypeSnafu {
                column: key.clone(),
                value: value.to_string(),
            }
            .fail();
        };
        if !is_representable(text) {
            *value = Value::String(if format == "time" { MAX_TIME } else { MAX_TIMESTAMP }.to_string());
        }
    }
    Ok(())
}

fn date_time_format(property: &Value) -> Option<&str> {
    let is_date_time = |candidate: &Value| {
        type_includes(candidate, "string")
            && candidate
                .get("format")
                .and_then(Value::as_str)
                .is_some_and(|f| DATE_TIME_FORMATS.contains(&f))
    };

    match property.get("anyOf").and_then(Value::as_array) {
        Some(alternatives) => alternatives.iter().find(|alt| is_date_time(alt)),
        None => Some(property).filter(|p| is_date_time(p)),
    }
    .and_then(|p| p.get("format"))
    .and_then(Value::as_str)
}

/// ISO 8601 style dates, times and date-times, in extended (`2024-03-01
/// 10:00:00`) or basic (`20240301T100000`) form, with an optional `Z`,
/// `UTC`/`GMT` or numeric offset.
static DATE_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?xi)
        ^
        (?:
            (?P<year>\d{4,})
            (?: [-/](?P<month>\d{1,2})[-/](?P<day>\d{1,2}) | (?P<bmonth>\d{2})(?P<bday>\d{2}) )
        )?
        (?:
            (?: ^ | [T\x20] )
            (?P<hour>\d{1,2}) : (?P<minute>\d{2}) (?: : (?P<second>\d{2}) (?:[.,]\d+)? )?
            |
            T (?P<bhour>\d{2}) (?P<bminute>\d{2}) (?P<bsecond>\d{2})? (?:[.,]\d+)?
        )?
        \s*
        (?: Z | UTC | GMT | [+-](?P<offset_hour>\d{2}) (?: :? (?P<offset_minute>\d{2}) )? )?
        $
        ",
    )
    .expect("date-time pattern is valid")
});

/// Whether a date, time or date-time string parses within the warehouse range.
/// Strings that are not dates at all count as unrepresentable.
fn is_representable(text: &str) -> bool {
    let Some(caps) = DATE_TIME.captures(text.trim()) else {
        return false;
    };
    let field = |names: &[&str]| names.iter().find_map(|name| caps.name(name));
    let number = |names: &[&str]| field(names).and_then(|m| m.as_str().parse::<u32>().ok());

    let date = field(&["year"]).map(|_| {
        let year = number(&["year"]).filter(|year| (1..=9999).contains(year));
        match (year, number(&["month", "bmonth"]), number(&["day", "bday"])) {
            (Some(year), Some(month), Some(day)) => NaiveDate::from_ymd_opt(year as i32, month, day).is_some(),
            _ => false,
        }
    });
    let time = field(&["hour", "bhour"]).map(|_| {
        let second = match field(&["second", "bsecond"]) {
            Some(_) => number(&["second", "bsecond"]),
            None => Some(0),
        };
        match (number(&["hour", "bhour"]), number(&["minute", "bminute"]), second) {
            (Some(hour), Some(minute), Some(second)) => NaiveTime::from_hms_opt(hour, minute, second).is_some(),
            _ => false,
        }
    });
    let offset = field(&["offset_hour"]).map(|_| {
        number(&["offset_hour"]).is_some_and(|hour| hour < 24)
            && number(&["offset_minute"]).is_none_or(|minute| minute < 60)
    });

    (date.is_some() || time.is_some()) && [date, time, offset].into_iter().flatten().all(|valid| valid)
}

/// Everything needed to turn a raw record of one stream into a bucket row.
pub struct RecordTransform {
    pub stream: String,
    /// Stream schema, including metadata columns when they are enabled.
    pub schema: Value,
    pub flat_schema: FlatSchema,
    pub key_properties: Vec<String>,
    pub max_level: usize,
    pub add_metadata: bool,
    pub validator: Option<Arc<dyn RecordValidator>>,
    pub precision_as_warnings: bool,
}

impl std::fmt::Debug for RecordTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordTransform")
            .field("stream", &self.stream)
            .field("columns", &self.flat_schema.len())
            .field("key_properties", &self.key_properties)
            .finish()
    }
}

impl RecordTransform {
    pub fn apply(
        &self,
        mut record: Map<String, Value>,
        time_extracted: Option<&str>,
        batched_at: &str,
    ) -> Result<FlatRecord, ValidationError> {
        clamp_date_times(&mut record, &self.schema)?;

        if let Some(validator) = &self.validator {
            match validator.validate(&record) {
                Ok(()) => {}
                Err(err @ ValidationError::Precision { .. }) if self.precision_as_warnings => {
                    warn!(stream = %self.stream, "{err}");
                }
                Err(err) => return Err(err),
            }
        }

        if self.add_metadata {
            add_metadata_values(&mut record, time_extracted, batched_at);
        }

        Ok(flatten_record(&record, &self.flat_schema, self.max_level))
    }

    /// Key values of a flattened record joined with `,`, or `None` when the
    /// stream has no key properties.
    pub fn primary_key(&self, record: &FlatRecord) -> Result<Option<String>, ValidationError> {
        if self.key_properties.is_empty() {
            return Ok(None);
        }

        let mut parts = Vec::with_capacity(self.key_properties.len());
        for key in &self.key_properties {
            let value = record.get(key).context(PrimaryKeyNotFoundSnafu {
                keys: self.key_properties.clone(),
                available: record.keys().cloned().collect::<Vec<_>>(),
            })?;
            parts.push(value.to_string());
        }
        Ok(Some(parts.join(",")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::{FlatValue, flatten_schema};

    fn record(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    struct RejectAll(ValidationError);

    impl RecordValidator for RejectAll {
        fn validate(&self, _record: &Map<String, Value>) -> Result<(), ValidationError> {
            Err(match &self.0 {
                ValidationError::Precision { record } => ValidationError::Precision { record: record.clone() },
                _ => ValidationError::SchemaMismatch {
                    record: String::new(),
                    details: "rejected".to_string(),
                },
            })
        }
    }

    fn transform(schema: Value, key_properties: &[&str]) -> RecordTransform {
        RecordTransform {
            stream: "orders".to_string(),
            flat_schema: flatten_schema(&schema, 0).unwrap(),
            schema,
            key_properties: key_properties.iter().map(|k| k.to_string()).collect(),
            max_level: 0,
            add_metadata: false,
            validator: None,
            precision_as_warnings: false,
        }
    }

    #[test]
    fn test_clamp_date_times() {
        let mut value = record(json!({
            "key1": "1",
            "key2": "2030-01-22",
            "key3": "10000-01-22 12:04:22",
            "key4": "25:01:01",
            "key5": "I'm good",
            "key6": null
        }));
        let schema = json!({
            "properties": {
                "key1": {"type": ["null", "string", "integer"]},
                "key2": {"anyOf": [{"type": ["null", "string"], "format": "date"}, {"type": ["null", "string"]}]},
                "key3": {"type": ["null", "string"], "format": "date-time"},
                "key4": {"anyOf": [{"type": ["null", "string"], "format": "time"}, {"type": ["null", "string"]}]},
                "key5": {"type": ["null", "string"]},
                "key6": {"type": ["null", "string"], "format": "time"}
            }
        });

        clamp_date_times(&mut value, &schema).unwrap();
        assert_eq!(
            Value::Object(value),
            json!({
                "key1": "1",
                "key2": "2030-01-22",
                "key3": "9999-12-31 23:59:59.999999",
                "key4": "23:59:59.999999",
                "key5": "I'm good",
                "key6": null
            })
        );
    }

    #[test]
    fn test_clamp_keeps_valid_timestamps() {
        let schema = json!({"properties": {"ts": {"type": ["null", "string"], "format": "date-time"}}});
        for ts in ["2024-03-01T10:00:00Z", "2024-03-01T10:00:00.123456+02:00", "2024-03-01 10:00:00", "2024-03-01"] {
            let mut value = record(json!({ "ts": ts }));
            clamp_date_times(&mut value, &schema).unwrap();
            assert_eq!(value["ts"], ts);
        }
    }

    #[test]
    fn test_representable_date_times() {
        let cases = [
            ("2024-03-01", true),
            ("2024-03-01T10:00:00Z", true),
            ("2024-03-01T10:00:00.123456+02:00", true),
            ("2024-03-01T10:00:00+00", true),
            ("2024-03-01 10:00:00 UTC", true),
            ("2024-03-01 10:00", true),
            ("2024/03/01 10:00:00", true),
            ("20240301T100000", true),
            ("20240301T100000.5-0500", true),
            ("10:00:00", true),
            ("10:00:00+02:00", true),
            ("10:00", true),
            ("0001-01-01 00:00:00", true),
            ("10000-01-22 12:04:22", false),
            ("0000-01-01", false),
            ("2024-02-30", false),
            ("2024-13-01", false),
            ("25:01:01", false),
            ("10:61:00", false),
            ("2024-03-01T10:00:00+25:00", false),
            ("I'm good", false),
            ("", false),
        ];
        for (text, expected) in cases {
            assert_eq!(is_representable(text), expected, "{text}");
        }
    }

    #[test]
    fn test_clamp_rejects_non_string() {
        let mut value = record(json!({"key": 100}));
        let schema = json!({"properties": {"key": {"type": ["null", "string"], "format": "date"}}});
        let err = clamp_date_times(&mut value, &schema).unwrap_err();
        assert!(matches!(err, ValidationError::UnexpectedValueType { column, .. } if column == "key"));
    }

    #[test]
    fn test_metadata_columns_and_values() {
        let mut schema = json!({"properties": {"id": {"type": "integer"}}});
        add_metadata_columns(&mut schema);
        let properties = schema["properties"].as_object().unwrap();
        assert_eq!(properties[BATCHED_AT]["format"], "date-time");
        assert!(properties[DELETED_AT].get("format").is_none());

        let mut value = record(json!({"id": 1, "_sdc_deleted_at": "2024-01-01T00:00:00Z"}));
        add_metadata_values(&mut value, None, "2024-02-02T00:00:00.000000");
        assert_eq!(value[EXTRACTED_AT], Value::Null);
        assert_eq!(value[BATCHED_AT], "2024-02-02T00:00:00.000000");
        assert_eq!(value[DELETED_AT], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_apply_and_primary_key() {
        let mut schema = json!({"properties": {"id": {"type": "integer"}, "region": {"type": "string"}}});
        add_metadata_columns(&mut schema);
        let mut t = transform(schema, &["id", "region"]);
        t.add_metadata = true;

        let flat = t
            .apply(record(json!({"id": 7, "region": "eu"})), Some("2024-01-01T00:00:00Z"), "now")
            .unwrap();
        assert_eq!(flat["id"], FlatValue::Int(7));
        assert_eq!(flat[BATCHED_AT], FlatValue::String("now".to_string()));
        assert_eq!(t.primary_key(&flat).unwrap().as_deref(), Some("7,eu"));
    }

    #[test]
    fn test_primary_key_not_found() {
        let t = transform(json!({"properties": {"id": {"type": "integer"}, "name": {"type": "string"}}}), &["id"]);
        let flat = t.apply(record(json!({"name": "x"})), None, "now").unwrap();
        let err = t.primary_key(&flat).unwrap_err();
        let ValidationError::PrimaryKeyNotFound { keys, available } = err else {
            panic!("expected missing key error");
        };
        assert_eq!(keys, vec!["id"]);
        assert_eq!(available, vec!["name"]);
    }

    #[test]
    fn test_no_key_properties() {
        let t = transform(json!({"properties": {"id": {"type": "integer"}}}), &[]);
        let flat = t.apply(record(json!({"id": 1})), None, "now").unwrap();
        assert_eq!(t.primary_key(&flat).unwrap(), None);
    }

    #[test]
    fn test_precision_errors_as_warnings() {
        let mut t = transform(json!({"properties": {"amount": {"type": "number"}}}), &[]);
        t.validator = Some(Arc::new(RejectAll(ValidationError::Precision { record: String::new() })));
        assert!(matches!(
            t.apply(record(json!({"amount": 1.5})), None, "now").unwrap_err(),
            ValidationError::Precision { .. }
        ));

        t.precision_as_warnings = true;
        assert!(t.apply(record(json!({"amount": 1.5})), None, "now").is_ok());

        t.validator = Some(Arc::new(RejectAll(ValidationError::SchemaMismatch {
            record: String::new(),
            details: String::new(),
        })));
        assert!(t.apply(record(json!({"amount": 1.5})), None, "now").is_err());
    }
}
