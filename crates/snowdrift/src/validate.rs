//! JSON Schema record validation.

use jsonschema::error::ValidationErrorKind;
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// Checks a raw record against its stream schema.
pub trait RecordValidator: Send + Sync {
    fn validate(&self, record: &Map<String, Value>) -> Result<(), ValidationError>;
}

/// Validator compiled from the schema of a `SCHEMA` message.
pub struct JsonSchemaValidator {
    validator: jsonschema::Validator,
}

impl std::fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonSchemaValidator")
    }
}

impl JsonSchemaValidator {
    pub fn new(stream: &str, schema: &Value) -> Result<Self, ValidationError> {
        let validator = jsonschema::validator_for(schema).map_err(|err| {
            ValidationError::InvalidSchema {
                stream: stream.to_string(),
                message: err.to_string(),
            }
        })?;
        Ok(Self { validator })
    }
}

impl RecordValidator for JsonSchemaValidator {
    /// Schema mismatches take precedence over `multipleOf` checks that cannot
    /// be decided at double precision, which are reported as
    /// [`ValidationError::Precision`].
    fn validate(&self, record: &Map<String, Value>) -> Result<(), ValidationError> {
        let instance = Value::Object(record.clone());

        let mut precision = false;
        let mut details = Vec::new();
        for error in self.validator.iter_errors(&instance) {
            match error.kind {
                ValidationErrorKind::MultipleOf { multiple_of } if !is_decidable(&error.instance, multiple_of) => {
                    precision = true
                }
                _ => details.push(format!("{}: {}", error.instance_path, error)),
            }
        }

        if !details.is_empty() {
            return Err(ValidationError::SchemaMismatch {
                record: instance.to_string(),
                details: details.join("\n"),
            });
        }
        if precision {
            return Err(ValidationError::Precision {
                record: instance.to_string(),
            });
        }
        Ok(())
    }
}

/// Significant digits a double holds exactly.
const EXACT_DIGITS: usize = 15;

/// Whether `value` is a multiple of `multiple_of` can be told apart from
/// rounding noise: the value has fewer than 15 significant digits and the
/// quotient stays within the integers a double represents exactly.
fn is_decidable(value: &Value, multiple_of: f64) -> bool {
    let Some(number) = value.as_f64() else {
        return true;
    };
    let quotient = (number / multiple_of).abs();
    significant_digits(&value.to_string()) < EXACT_DIGITS && quotient.is_finite() && quotient <= 2f64.powi(53)
}

fn significant_digits(text: &str) -> usize {
    let mantissa = text.split(['e', 'E']).next().unwrap_or(text);
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let digits = digits.trim_start_matches('0');
    let digits = if mantissa.contains('.') {
        digits
    } else {
        digits.trim_end_matches('0')
    };
    digits.len().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn validator() -> JsonSchemaValidator {
        JsonSchemaValidator::new(
            "orders",
            &json!({
                "type": "object",
                "properties": {
                    "id": {"type": "integer"},
                    "amount": {"type": ["null", "number"], "multipleOf": 0.5}
                }
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_record() {
        assert!(validator().validate(&record(json!({"id": 1, "amount": 2.5}))).is_ok());
    }

    #[test]
    fn test_type_mismatch() {
        let err = validator().validate(&record(json!({"id": "one"}))).unwrap_err();
        assert!(matches!(err, ValidationError::SchemaMismatch { .. }));
        assert!(err.to_string().contains("\"one\""));
    }

    #[test]
    fn test_multiple_of_mismatch() {
        let err = validator()
            .validate(&record(json!({"id": 1, "amount": 2.25})))
            .unwrap_err();
        assert!(matches!(err, ValidationError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_undecidable_multiple_of_is_precision_error() {
        let validator = JsonSchemaValidator::new(
            "orders",
            &json!({"properties": {"amount": {"type": "number", "multipleOf": 0.0001}}}),
        )
        .unwrap();
        let err = validator
            .validate(&record(json!({"amount": 1.234567890123456789})))
            .unwrap_err();
        assert!(matches!(err, ValidationError::Precision { .. }));
    }

    #[test]
    fn test_is_decidable() {
        assert!(is_decidable(&json!(2.25), 0.5));
        assert!(is_decidable(&json!(10), 3.0));
        assert!(!is_decidable(&json!(1.234567890123456789), 0.0001));
        assert!(!is_decidable(&json!(1e300), 1e-10));
        assert!(is_decidable(&json!("text"), 0.5));
    }

    #[test]
    fn test_significant_digits() {
        assert_eq!(significant_digits("2.25"), 3);
        assert_eq!(significant_digits("-0.00125"), 3);
        assert_eq!(significant_digits("1200"), 2);
        assert_eq!(significant_digits("1.5e300"), 2);
        assert_eq!(significant_digits("0"), 1);
    }

    #[test]
    fn test_invalid_schema() {
        let err = JsonSchemaValidator::new("orders", &json!({"type": 12})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidSchema { stream, .. } if stream == "orders"));
    }
}
