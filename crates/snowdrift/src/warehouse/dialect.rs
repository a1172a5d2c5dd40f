//! Snowflake statements issued by the loader.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{BulkLoad, LoadColumn};
use crate::config::FileFormatType;
use crate::flatten::{FlatSchema, column_type};
use crate::naming::{json_element_name, safe_column_name};

pub fn column_clause(name: &str, property: &Value) -> String {
    format!("{} {}", safe_column_name(name), column_type(property))
}

pub fn show_schemas(like: &str) -> String {
    format!("SHOW SCHEMAS LIKE '{}'", like.to_uppercase())
}

pub fn show_tables(database: Option<&str>, schema: &str) -> String {
    format!("SHOW TERSE TABLES IN SCHEMA {}", in_database(database, schema))
}

pub fn show_columns(database: Option<&str>, schema: &str) -> String {
    format!("SHOW COLUMNS IN SCHEMA {}", in_database(database, schema))
}

fn in_database(database: Option<&str>, schema: &str) -> String {
    match database {
        Some(db) => format!("{db}.{schema}"),
        None => schema.to_string(),
    }
}

pub fn show_primary_keys(table: &str) -> String {
    format!("SHOW PRIMARY KEYS IN TABLE {table}")
}

pub fn show_file_formats(name: &str) -> String {
    format!("SHOW FILE FORMATS LIKE '{name}'")
}

pub fn create_schema(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {schema}")
}

pub fn grant_usage_on_schema(schema: &str, role: &str) -> String {
    format!("GRANT USAGE ON SCHEMA {schema} TO ROLE {role}")
}

pub fn grant_select_on_all_tables(schema: &str, role: &str) -> String {
    format!("GRANT SELECT ON ALL TABLES IN SCHEMA {schema} TO ROLE {role}")
}

pub fn create_table(table: &str, schema: &FlatSchema, primary_keys: &[String]) -> String {
    let mut clauses: Vec<String> = schema
        .iter()
        .map(|(name, property)| column_clause(name, property))
        .collect();
    if !primary_keys.is_empty() {
        clauses.push(format!("PRIMARY KEY ({})", key_list(primary_keys)));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {table} ({}) data_retention_time_in_days = 1",
        clauses.join(", ")
    )
}

pub fn add_column(table: &str, name: &str, property: &Value) -> String {
    format!("ALTER TABLE {table} ADD COLUMN {}", column_clause(name, property))
}

/// Rename a column out of the way, suffixed with the UTC time of the change.
pub fn version_column(table: &str, name: &str, now: DateTime<Utc>) -> String {
    let column = safe_column_name(name);
    format!(
        "ALTER TABLE {table} RENAME COLUMN {column} TO \"{}_{}\"",
        column.trim_matches('"'),
        now.format("%Y%m%d_%H%M")
    )
}

pub fn drop_primary_key(table: &str) -> String {
    format!("ALTER TABLE {table} DROP PRIMARY KEY")
}

pub fn add_primary_key(table: &str, keys: &[String]) -> String {
    format!("ALTER TABLE {table} ADD PRIMARY KEY ({})", key_list(keys))
}

pub fn drop_not_null(table: &str, column: &str) -> String {
    format!("ALTER TABLE {table} ALTER COLUMN {} DROP NOT NULL", safe_column_name(column))
}

pub fn delete_soft_deleted(table: &str) -> String {
    format!("DELETE FROM {table} WHERE _sdc_deleted_at IS NOT NULL")
}

/// Gzipped files (`.gz`) are declared as such; others are uploaded as-is.
pub fn put_file(path: &Path, stage: &str) -> String {
    let compression = if path.extension().is_some_and(|ext| ext == "gz") {
        " SOURCE_COMPRESSION=GZIP"
    } else {
        ""
    };
    format!("PUT 'file://{}' '@{stage}'{compression}", path.display())
}

pub fn remove_file(stage: &str, key: &str) -> String {
    format!("REMOVE '@{stage}/{key}'")
}

fn key_list(keys: &[String]) -> String {
    keys.iter()
        .map(|k| safe_column_name(k))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `trans($n) "COL"` for CSV, `trans($1:"col") "COL"` for Parquet.
fn select_list(columns: &[LoadColumn], format: FileFormatType) -> String {
    columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let source = match format {
                FileFormatType::Csv => format!("${}", i + 1),
                FileFormatType::Parquet => format!("$1:{}", json_element_name(&column.name)),
            };
            format!(
                "{}({source}) {}",
                column.trans.unwrap_or(""),
                safe_column_name(&column.name)
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_list(columns: &[LoadColumn], prefix: &str) -> String {
    columns
        .iter()
        .map(|c| format!("{prefix}{}", safe_column_name(&c.name)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Upsert statement matching staged rows on the key columns.
pub fn merge(load: &BulkLoad) -> String {
    let on = load
        .primary_keys
        .iter()
        .map(|k| {
            let column = safe_column_name(k);
            format!("s.{column} = t.{column}")
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    let key_columns: Vec<String> = load.primary_keys.iter().map(|k| safe_column_name(k)).collect();
    let updates = load
        .columns
        .iter()
        .map(|c| safe_column_name(&c.name))
        .filter(|c| !key_columns.contains(c))
        .map(|c| format!("{c} = s.{c}"))
        .collect::<Vec<_>>();
    let when_matched = if updates.is_empty() {
        String::new()
    } else {
        format!("WHEN MATCHED THEN UPDATE SET {} ", updates.join(", "))
    };

    format!(
        "MERGE INTO {table} t USING (SELECT {select} FROM '@{stage}/{key}' (FILE_FORMAT => '{format}')) s \
         ON {on} {when_matched}WHEN NOT MATCHED THEN INSERT ({columns}) VALUES ({values})",
        table = load.table,
        select = select_list(&load.columns, load.format_type),
        stage = load.stage,
        key = load.key,
        format = load.file_format,
        columns = column_list(&load.columns, ""),
        values = column_list(&load.columns, "s."),
    )
}

/// Append statement loading every staged row.
pub fn copy(load: &BulkLoad) -> String {
    format!(
        "COPY INTO {table} ({columns}) FROM (SELECT {select} FROM '@{stage}/{key}') \
         FILE_FORMAT = (format_name='{format}')",
        table = load.table,
        columns = column_list(&load.columns, ""),
        select = select_list(&load.columns, load.format_type),
        stage = load.stage,
        key = load.key,
        format = load.file_format,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn load(format_type: FileFormatType, primary_keys: &[&str]) -> BulkLoad {
        BulkLoad {
            table: "raw.\"ORDERS\"".to_string(),
            stage: "raw.s3_stage".to_string(),
            key: "snowdrift_orders_1.csv.gz".to_string(),
            file_format: "raw.csv_format".to_string(),
            format_type,
            columns: vec![
                LoadColumn { name: "id".to_string(), trans: None },
                LoadColumn { name: "payload".to_string(), trans: Some("parse_json") },
            ],
            primary_keys: primary_keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn test_create_table() {
        let mut schema = FlatSchema::new();
        schema.insert("id".to_string(), json!({"type": "integer"}));
        schema.insert("updated_at".to_string(), json!({"type": ["null", "string"], "format": "date-time"}));
        assert_eq!(
            create_table("raw.\"ORDERS\"", &schema, &["id".to_string()]),
            "CREATE TABLE IF NOT EXISTS raw.\"ORDERS\" (\"ID\" number, \"UPDATED_AT\" timestamp_ntz, \
             PRIMARY KEY (\"ID\")) data_retention_time_in_days = 1"
        );
        assert_eq!(
            create_table("raw.\"ORDERS\"", &schema, &[]),
            "CREATE TABLE IF NOT EXISTS raw.\"ORDERS\" (\"ID\" number, \"UPDATED_AT\" timestamp_ntz) \
             data_retention_time_in_days = 1"
        );
    }

    #[test]
    fn test_merge_csv() {
        assert_eq!(
            merge(&load(FileFormatType::Csv, &["id"])),
            "MERGE INTO raw.\"ORDERS\" t USING (SELECT ($1) \"ID\", parse_json($2) \"PAYLOAD\" \
             FROM '@raw.s3_stage/snowdrift_orders_1.csv.gz' (FILE_FORMAT => 'raw.csv_format')) s \
             ON s.\"ID\" = t.\"ID\" WHEN MATCHED THEN UPDATE SET \"PAYLOAD\" = s.\"PAYLOAD\" \
             WHEN NOT MATCHED THEN INSERT (\"ID\", \"PAYLOAD\") VALUES (s.\"ID\", s.\"PAYLOAD\")"
        );
    }

    #[test]
    fn test_merge_only_keys_skips_update() {
        let mut only_keys = load(FileFormatType::Parquet, &["id", "payload"]);
        only_keys.columns[1].trans = None;
        let sql = merge(&only_keys);
        assert!(!sql.contains("WHEN MATCHED"));
        assert!(sql.contains("SELECT ($1:\"id\") \"ID\", ($1:\"payload\") \"PAYLOAD\""));
        assert!(sql.contains("ON s.\"ID\" = t.\"ID\" AND s.\"PAYLOAD\" = t.\"PAYLOAD\" WHEN NOT MATCHED"));
    }

    #[test]
    fn test_copy_parquet() {
        assert_eq!(
            copy(&load(FileFormatType::Parquet, &[])),
            "COPY INTO raw.\"ORDERS\" (\"ID\", \"PAYLOAD\") FROM (SELECT ($1:\"id\") \"ID\", \
             parse_json($1:\"payload\") \"PAYLOAD\" FROM '@raw.s3_stage/snowdrift_orders_1.csv.gz') \
             FILE_FORMAT = (format_name='raw.csv_format')"
        );
    }

    #[test]
    fn test_column_ddl() {
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        assert_eq!(
            version_column("raw.\"T\"", "c_ts", now),
            "ALTER TABLE raw.\"T\" RENAME COLUMN \"C_TS\" TO \"C_TS_20240506_0708\""
        );
        assert_eq!(
            add_column("raw.\"T\"", "c_ts", &json!({"type": "string", "format": "date-time"})),
            "ALTER TABLE raw.\"T\" ADD COLUMN \"C_TS\" timestamp_ntz"
        );
        assert_eq!(
            drop_not_null("raw.\"T\"", "id"),
            "ALTER TABLE raw.\"T\" ALTER COLUMN \"ID\" DROP NOT NULL"
        );
        assert_eq!(
            add_primary_key("raw.\"T\"", &["id".to_string(), "region".to_string()]),
            "ALTER TABLE raw.\"T\" ADD PRIMARY KEY (\"ID\", \"REGION\")"
        );
    }

    #[test]
    fn test_catalog_queries() {
        assert_eq!(show_columns(Some("DB"), "raw"), "SHOW COLUMNS IN SCHEMA DB.raw");
        assert_eq!(show_tables(None, "raw"), "SHOW TERSE TABLES IN SCHEMA raw");
        assert_eq!(show_schemas("raw"), "SHOW SCHEMAS LIKE 'RAW'");
        assert_eq!(
            remove_file("raw.%\"T\"", "f.csv.gz"),
            "REMOVE '@raw.%\"T\"/f.csv.gz'"
        );
        assert_eq!(
            put_file(Path::new("/tmp/f.csv.gz"), "raw.%\"T\""),
            "PUT 'file:///tmp/f.csv.gz' '@raw.%\"T\"' SOURCE_COMPRESSION=GZIP"
        );
        assert_eq!(
            put_file(Path::new("/tmp/f.csv"), "raw.%\"T\""),
            "PUT 'file:///tmp/f.csv' '@raw.%\"T\"'"
        );
    }
}
