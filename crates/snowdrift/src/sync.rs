//! Destination table synchronization.
//!
//! Makes sure the target schema and table exist and match the flattened
//! stream schema before any row of the stream is loaded:
//!
//! 1. create the schema when missing and grant usage on it
//! 2. create the table when missing and grant select on it
//! 3. otherwise add missing columns and version columns whose type changed
//! 4. realign the primary key with the declared key properties
//!
//! Every statement is fatal on failure.

use std::collections::HashMap;

use chrono::Utc;
use snafu::prelude::*;
use tracing::info;

use crate::cache::MetadataCache;
use crate::config::Config;
use crate::error::{CatalogSnafu, DdlSnafu, NoTargetSchemaSnafu, SyncError};
use crate::flatten::{FlatSchema, column_type};
use crate::metrics::events::DdlExecuted;
use crate::naming::{split_qualified_name, table_name};
use crate::warehouse::{Warehouse, dialect};
use snowdrift_core::emit;

/// Existing column types that are kept when the stream asks for `TIMESTAMP_NTZ`.
const ZONED_TIMESTAMP_TYPES: &[&str] = &["TIMESTAMP_TZ", "TIMESTAMP_LTZ"];

/// Destination of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    pub stream: String,
    pub schema_name: String,
    /// Quoted, upper-cased table name without schema.
    pub table: String,
    pub grantees: Vec<String>,
}

impl TableTarget {
    /// Route a stream to its target schema.
    ///
    /// The source schema part of the stream name selects a `schema_mapping`
    /// entry; without one the default target schema is used.
    pub fn resolve(stream: &str, config: &Config) -> Result<Self, SyncError> {
        let source_schema = split_qualified_name(stream, '-').schema;
        let mapping = source_schema
            .as_deref()
            .and_then(|schema| config.schema_mapping.get(schema));

        let schema_name = mapping
            .and_then(|m| m.target_schema.clone())
            .or_else(|| config.default_target_schema.clone())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .context(NoTargetSchemaSnafu { stream })?;

        let grantees = mapping
            .and_then(|m| m.target_schema_select_permissions.as_ref())
            .or(config.default_target_schema_select_permissions.as_ref())
            .map(|g| g.to_vec())
            .unwrap_or_default();

        Ok(Self {
            stream: stream.to_string(),
            schema_name,
            table: table_name(stream),
            grantees,
        })
    }

    /// `schema."TABLE"`
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema_name, self.table)
    }

    /// Table name without quotes.
    pub fn bare_table(&self) -> &str {
        self.table.trim_matches('"')
    }
}

/// Applies the DDL needed to load a stream into its target table.
pub struct TableSync<'a> {
    warehouse: &'a dyn Warehouse,
    cache: &'a mut MetadataCache,
}

impl<'a> TableSync<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, cache: &'a mut MetadataCache) -> Self {
        Self { warehouse, cache }
    }

    async fn run(&self, kind: &'static str, statement: String) -> Result<(), SyncError> {
        info!(statement = %statement, "Running {kind}");
        self.warehouse
            .execute_ddl(&statement)
            .await
            .context(DdlSnafu { statement })?;
        emit!(DdlExecuted { kind });
        Ok(())
    }

    async fn refresh(&mut self, target: &TableTarget) -> Result<(), SyncError> {
        self.cache
            .refresh(std::slice::from_ref(&target.schema_name))
            .await
            .context(CatalogSnafu)
    }

    pub async fn ensure_schema(
        &mut self,
        target: &TableTarget,
        schema: &FlatSchema,
        key_properties: &[String],
    ) -> Result<(), SyncError> {
        self.create_schema_if_missing(target).await?;

        let tables = self.cache.tables(&target.schema_name).await.context(CatalogSnafu)?;
        let exists = tables
            .iter()
            .any(|t| t.table_name.eq_ignore_ascii_case(target.bare_table()));

        if !exists {
            info!(table = %target.qualified(), "Table does not exist, creating");
            self.run("create_table", dialect::create_table(&target.qualified(), schema, key_properties))
                .await?;
            for role in &target.grantees {
                self.run("grant", dialect::grant_select_on_all_tables(&target.schema_name, role))
                    .await?;
            }
            self.refresh(target).await?;
            return Ok(());
        }

        info!(table = %target.qualified(), "Table exists");
        self.update_columns(target, schema).await?;
        self.refresh_primary_key(target, key_properties).await
    }

    async fn create_schema_if_missing(&mut self, target: &TableTarget) -> Result<(), SyncError> {
        let exists = self
            .cache
            .schema_exists(&target.schema_name)
            .await
            .context(CatalogSnafu)?;
        if exists {
            return Ok(());
        }

        info!(schema = %target.schema_name, "Schema does not exist, creating");
        self.run("create_schema", dialect::create_schema(&target.schema_name))
            .await?;
        for role in &target.grantees {
            self.run("grant", dialect::grant_usage_on_schema(&target.schema_name, role))
                .await?;
        }
        self.refresh(target).await
    }

    async fn update_columns(&mut self, target: &TableTarget, schema: &FlatSchema) -> Result<(), SyncError> {
        let existing: HashMap<String, String> = self
            .cache
            .table_columns(&target.schema_name, target.bare_table())
            .await
            .context(CatalogSnafu)?
            .into_iter()
            .map(|c| (c.column_name, c.data_type))
            .collect();

        let table = target.qualified();
        let mut changed = false;

        for (name, property) in schema {
            let required = column_type(property).to_uppercase();
            match existing.get(&name.to_uppercase()) {
                None => {
                    self.run("add_column", dialect::add_column(&table, name, property))
                        .await?;
                    changed = true;
                }
                Some(current) if *current != required => {
                    let keep_zoned =
                        required == "TIMESTAMP_NTZ" && ZONED_TIMESTAMP_TYPES.contains(&current.as_str());
                    if keep_zoned {
                        continue;
                    }
                    self.run("version_column", dialect::version_column(&table, name, Utc::now()))
                        .await?;
                    self.run("add_column", dialect::add_column(&table, name, property))
                        .await?;
                    changed = true;
                }
                Some(_) => {}
            }
        }

        if changed {
            self.refresh(target).await?;
        }
        Ok(())
    }

    async fn refresh_primary_key(&mut self, target: &TableTarget, key_properties: &[String]) -> Result<(), SyncError> {
        let table = target.qualified();
        let current = match self.warehouse.show_primary_keys(&table).await {
            Ok(keys) => keys,
            Err(err) if err.is_not_found() => Vec::new(),
            Err(source) => return Err(SyncError::Catalog { source }),
        };

        let mut declared: Vec<String> = key_properties.iter().map(|k| k.to_uppercase()).collect();
        let mut sorted_current = current.clone();
        declared.sort();
        sorted_current.sort();
        if declared == sorted_current {
            return Ok(());
        }

        info!(table = %table, from = ?current, to = ?key_properties, "Updating primary key");
        if !current.is_empty() {
            self.run("drop_primary_key", dialect::drop_primary_key(&table))
                .await?;
        }
        if !key_properties.is_empty() {
            self.run("add_primary_key", dialect::add_primary_key(&table, key_properties))
                .await?;
        }

        let mut relaxed: Vec<String> = Vec::new();
        for column in current.iter().chain(key_properties.iter()) {
            let column = column.to_uppercase();
            if !relaxed.contains(&column) {
                self.run("drop_not_null", dialect::drop_not_null(&table, &column))
                    .await?;
                relaxed.push(column);
            }
        }
        Ok(())
    }
}
