//! Snapshot of destination column metadata.
//!
//! Loaded once at startup for every configured target schema and refreshed
//! after DDL, so most schema checks need no catalog round trip. When disabled
//! every lookup goes to the warehouse.

use tracing::{debug, warn};

use crate::error::WarehouseError;
use crate::warehouse::{ColumnMeta, TableMeta, WarehouseRef};

pub struct MetadataCache {
    warehouse: WarehouseRef,
    enabled: bool,
    columns: Vec<ColumnMeta>,
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("enabled", &self.enabled)
            .field("columns", &self.columns.len())
            .finish()
    }
}

/// Treat a missing object as an empty result.
fn or_empty<T>(result: Result<Vec<T>, WarehouseError>) -> Result<Vec<T>, WarehouseError> {
    match result {
        Err(err) if err.is_not_found() => {
            debug!("Catalog object not found: {err}");
            Ok(Vec::new())
        }
        other => other,
    }
}

impl MetadataCache {
    /// An empty cache. Call [`MetadataCache::load`] to populate it.
    pub fn new(warehouse: WarehouseRef, enabled: bool) -> Self {
        Self {
            warehouse,
            enabled,
            columns: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Populate the cache with the columns of `schemas`. No-op when disabled.
    pub async fn load(&mut self, schemas: &[String]) -> Result<(), WarehouseError> {
        if !self.enabled {
            return Ok(());
        }
        self.columns.clear();
        for schema in schemas {
            let columns = self.query_columns(schema).await?;
            if columns.is_empty() {
                warn!(schema = %schema, "No columns discovered in schema");
            }
            self.columns.extend(columns);
        }
        debug!(columns = self.columns.len(), "Table cache loaded");
        Ok(())
    }

    async fn query_columns(&self, schema: &str) -> Result<Vec<ColumnMeta>, WarehouseError> {
        or_empty(self.warehouse.show_columns(schema).await)
    }

    /// Columns of every table in `schema`.
    pub async fn columns(&self, schema: &str) -> Result<Vec<ColumnMeta>, WarehouseError> {
        if !self.enabled {
            return self.query_columns(schema).await;
        }
        let schema = schema.to_uppercase();
        Ok(self
            .columns
            .iter()
            .filter(|c| c.schema_name == schema)
            .cloned()
            .collect())
    }

    /// Columns of one table, `table` given without quotes.
    pub async fn table_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnMeta>, WarehouseError> {
        let table = table.to_uppercase();
        Ok(self
            .columns(schema)
            .await?
            .into_iter()
            .filter(|c| c.table_name == table)
            .collect())
    }

    pub async fn tables(&self, schema: &str) -> Result<Vec<TableMeta>, WarehouseError> {
        if !self.enabled {
            return or_empty(self.warehouse.show_tables(schema).await);
        }
        let mut tables: Vec<TableMeta> = Vec::new();
        for column in self.columns(schema).await? {
            let known = tables
                .iter()
                .any(|t| t.schema_name == column.schema_name && t.table_name == column.table_name);
            if !known {
                tables.push(TableMeta {
                    schema_name: column.schema_name,
                    table_name: column.table_name,
                });
            }
        }
        Ok(tables)
    }

    /// Whether `schema` exists. With the cache enabled, a schema without
    /// any table is reported as missing.
    pub async fn schema_exists(&self, schema: &str) -> Result<bool, WarehouseError> {
        if self.enabled {
            let schema = schema.to_uppercase();
            return Ok(self.columns.iter().any(|c| c.schema_name == schema));
        }
        Ok(!or_empty(self.warehouse.show_schemas(schema).await)?.is_empty())
    }

    /// Re-query the columns of `schemas`, replacing their cached rows.
    pub async fn refresh(&mut self, schemas: &[String]) -> Result<(), WarehouseError> {
        if !self.enabled {
            return Ok(());
        }
        for schema in schemas {
            let fresh = self.query_columns(schema).await?;
            let upper = schema.to_uppercase();
            self.columns.retain(|c| c.schema_name != upper);
            self.columns.extend(fresh);
        }
        Ok(())
    }
}
