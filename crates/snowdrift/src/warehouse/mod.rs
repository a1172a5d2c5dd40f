//! Warehouse collaborator.
//!
//! The loader issues all catalog queries, DDL and bulk loads through the
//! [`Warehouse`] trait. [`SqlApiWarehouse`] implements it over the Snowflake
//! SQL API; the statements themselves are built in [`dialect`].

pub mod dialect;
mod sql_api;

pub use sql_api::{ResultSet, SqlApiSettings, SqlApiWarehouse};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::FileFormatType;
use crate::error::WarehouseError;
use crate::flatten::{FlatSchema, column_trans};

/// Largest number of rows a catalog query may return.
pub const MAX_CATALOG_ROWS: usize = 9999;

/// One column of a destination table, as reported by `SHOW COLUMNS`.
///
/// Names are upper case and `data_type` is normalized (`FIXED` is reported
/// as `NUMBER`, `REAL` as `FLOAT`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub schema_name: String,
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub schema_name: String,
    pub table_name: String,
}

/// Rows written by a bulk load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounts {
    pub inserted: u64,
    pub updated: u64,
}

/// A column selected from a staged file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadColumn {
    /// Flattened column name as it appears in the load file.
    pub name: String,
    /// SQL function applied to the staged value.
    pub trans: Option<&'static str>,
}

impl LoadColumn {
    pub fn from_schema(schema: &FlatSchema) -> Vec<LoadColumn> {
        schema
            .iter()
            .map(|(name, property)| LoadColumn {
                name: name.clone(),
                trans: column_trans(property),
            })
            .collect()
    }
}

/// Everything needed to load one staged file into a table.
#[derive(Debug, Clone)]
pub struct BulkLoad {
    /// Qualified table name, `schema."TABLE"`.
    pub table: String,
    /// Stage name without the leading `@`.
    pub stage: String,
    /// Key of the staged file, relative to the stage.
    pub key: String,
    pub file_format: String,
    pub format_type: FileFormatType,
    pub columns: Vec<LoadColumn>,
    /// Key property names; empty for append-only loads.
    pub primary_keys: Vec<String>,
}

/// Abstract access to the destination warehouse.
///
/// Catalog lookups report missing objects as [`WarehouseError::NotFound`].
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Run a statement that returns no rows of interest.
    async fn execute_ddl(&self, statement: &str) -> Result<(), WarehouseError>;

    /// Schema names matching `like`.
    async fn show_schemas(&self, like: &str) -> Result<Vec<String>, WarehouseError>;

    async fn show_tables(&self, schema: &str) -> Result<Vec<TableMeta>, WarehouseError>;

    async fn show_columns(&self, schema: &str) -> Result<Vec<ColumnMeta>, WarehouseError>;

    /// Upper-cased primary key columns of a qualified table.
    async fn show_primary_keys(&self, table: &str) -> Result<Vec<String>, WarehouseError>;

    /// Type of a named file format.
    async fn file_format_type(&self, name: &str) -> Result<FileFormatType, WarehouseError>;

    /// Insert or update rows from a staged file, matching on key columns.
    async fn upsert(&self, load: &BulkLoad) -> Result<LoadCounts, WarehouseError>;

    /// Append every row of a staged file.
    async fn append(&self, load: &BulkLoad) -> Result<LoadCounts, WarehouseError>;

    /// Delete rows flagged as deleted, returning the number removed.
    async fn delete_rows(&self, table: &str) -> Result<u64, WarehouseError>;

    /// Whether [`Warehouse::put_file`] and [`Warehouse::remove_file`] are
    /// available, which table stages need.
    fn supports_file_transfer(&self) -> bool {
        true
    }

    /// Upload a local file into a warehouse-managed stage.
    async fn put_file(&self, path: &Path, stage: &str) -> Result<(), WarehouseError>;

    /// Remove a file from a warehouse-managed stage.
    async fn remove_file(&self, stage: &str, key: &str) -> Result<(), WarehouseError>;

    /// A handle whose statements are tagged for `schema` and `table`.
    fn scoped(&self, schema: &str, table: &str) -> Arc<dyn Warehouse>;
}

pub type WarehouseRef = Arc<dyn Warehouse>;

/// Normalize a `SHOW COLUMNS` data type to the names used for comparison.
pub fn normalize_data_type(data_type: &str) -> String {
    let kind = serde_json::from_str::<Value>(data_type)
        .ok()
        .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| data_type.to_string())
        .to_uppercase();
    match kind.as_str() {
        "FIXED" => "NUMBER".to_string(),
        "REAL" => "FLOAT".to_string(),
        _ => kind,
    }
}
