//! Parquet load files.
//!
//! Integer, number and boolean columns are typed; everything else, nested
//! JSON included, is written as UTF-8 text. A column whose values do not fit
//! its declared type falls back to text. Pages use the gzip codec unless
//! compression is disabled.

use std::fs::File;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, RecordBatch, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel};
use parquet::file::properties::WriterProperties;
use snafu::prelude::*;

use crate::error::{ArrowSnafu, EncodeError, ParquetSnafu};
use crate::flatten::{FlatRecord, FlatSchema, FlatValue, column_type};

pub(super) fn write(file: File, rows: &[FlatRecord], schema: &FlatSchema, compress: bool) -> Result<(), EncodeError> {
    let mut fields = Vec::with_capacity(schema.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.len());

    for (name, property) in schema {
        let values: Vec<Option<&FlatValue>> = rows
            .iter()
            .map(|row| row.get(name).filter(|v| !v.is_null()))
            .collect();
        let data_type = arrow_type(column_type(property), &values);
        columns.push(build_column(&data_type, &values));
        fields.push(Field::new(name, data_type, true));
    }

    let arrow_schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(arrow_schema.clone(), columns).context(ArrowSnafu)?;

    let codec = if compress {
        Compression::GZIP(GzipLevel::default())
    } else {
        Compression::UNCOMPRESSED
    };
    let props = WriterProperties::builder().set_compression(codec).build();
    let mut writer = ArrowWriter::try_new(file, arrow_schema, Some(props)).context(ParquetSnafu)?;
    writer.write(&batch).context(ParquetSnafu)?;
    writer.close().context(ParquetSnafu)?;
    Ok(())
}

fn arrow_type(column_type: &str, values: &[Option<&FlatValue>]) -> DataType {
    let fits = |check: fn(&FlatValue) -> bool| values.iter().flatten().all(|v| check(v));
    match column_type {
        "number" if fits(|v| matches!(v, FlatValue::Int(_))) => DataType::Int64,
        "float" if fits(|v| matches!(v, FlatValue::Int(_) | FlatValue::Float(_))) => DataType::Float64,
        "boolean" if fits(|v| matches!(v, FlatValue::Bool(_))) => DataType::Boolean,
        _ => DataType::Utf8,
    }
}

fn build_column(data_type: &DataType, values: &[Option<&FlatValue>]) -> ArrayRef {
    match data_type {
        DataType::Int64 => {
            let mut builder = Int64Builder::with_capacity(values.len());
            for value in values {
                builder.append_option(match value {
                    Some(FlatValue::Int(i)) => Some(*i),
                    _ => None,
                });
            }
            Arc::new(builder.finish())
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::with_capacity(values.len());
            for value in values {
                builder.append_option(match value {
                    Some(FlatValue::Int(i)) => Some(*i as f64),
                    Some(FlatValue::Float(f)) => Some(*f),
                    _ => None,
                });
            }
            Arc::new(builder.finish())
        }
        DataType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(values.len());
            for value in values {
                builder.append_option(match value {
                    Some(FlatValue::Bool(b)) => Some(*b),
                    _ => None,
                });
            }
            Arc::new(builder.finish())
        }
        _ => {
            let mut builder = StringBuilder::new();
            for value in values {
                builder.append_option(value.map(ToString::to_string));
            }
            Arc::new(builder.finish())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::{Float64Type, Int64Type};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use serde_json::json;

    #[test]
    fn test_typed_columns() {
        let mut schema = FlatSchema::new();
        schema.insert("amount".to_string(), json!({"type": ["null", "number"]}));
        schema.insert("id".to_string(), json!({"type": "integer"}));
        schema.insert("meta".to_string(), json!({"type": ["null", "object"]}));
        schema.insert("odd".to_string(), json!({"type": "integer"}));

        let rows = vec![
            FlatRecord::from([
                ("id".to_string(), FlatValue::Int(1)),
                ("amount".to_string(), FlatValue::Int(3)),
                ("meta".to_string(), FlatValue::Json(r#"{"a":1}"#.to_string())),
                ("odd".to_string(), FlatValue::String("n/a".to_string())),
            ]),
            FlatRecord::from([
                ("id".to_string(), FlatValue::Int(2)),
                ("amount".to_string(), FlatValue::Float(1.5)),
                ("meta".to_string(), FlatValue::Null),
                ("odd".to_string(), FlatValue::Int(7)),
            ]),
        ];

        let file = tempfile::NamedTempFile::new().unwrap();
        write(file.reopen().unwrap(), &rows, &schema, true).unwrap();

        let reader = ParquetRecordBatchReaderBuilder::try_new(file.reopen().unwrap())
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>().unwrap();
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 2);

        let amount = batch.column_by_name("amount").unwrap().as_primitive::<Float64Type>();
        assert_eq!(amount.value(0), 3.0);
        assert_eq!(amount.value(1), 1.5);

        let id = batch.column_by_name("id").unwrap().as_primitive::<Int64Type>();
        assert_eq!(id.value(1), 2);

        let meta = batch.column_by_name("meta").unwrap().as_string::<i32>();
        assert_eq!(meta.value(0), r#"{"a":1}"#);
        assert!(meta.is_null(1));

        let odd = batch.column_by_name("odd").unwrap().as_string::<i32>();
        assert_eq!(odd.value(0), "n/a");
        assert_eq!(odd.value(1), "7");
    }
}
