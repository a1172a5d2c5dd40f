//! In-memory warehouse and stage fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use snowdrift::config::{Config, FileFormatType};
use snowdrift::error::{StageError, WarehouseError};
use snowdrift::format::EncodedFile;
use snowdrift::stage::{Stage, StageRef};
use snowdrift::sync::TableTarget;
use snowdrift::warehouse::{BulkLoad, ColumnMeta, LoadCounts, TableMeta, Warehouse, WarehouseRef, dialect};
use snowdrift::Loader;

/// Ordered log of every call made to the fakes.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn entries(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn entries_starting_with(log: &CallLog, prefix: &str) -> Vec<String> {
    entries(log).into_iter().filter(|e| e.starts_with(prefix)).collect()
}

/// A bulk load as seen by the warehouse.
#[derive(Debug, Clone)]
pub struct LoadCall {
    pub statement: String,
    pub table: String,
    pub key: String,
    pub primary_keys: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeWarehouse {
    pub log: CallLog,
    pub loads: Arc<Mutex<Vec<LoadCall>>>,
    columns: Arc<Mutex<Vec<ColumnMeta>>>,
    primary_keys: Arc<Mutex<HashMap<String, Vec<String>>>>,
    fail_loads: Arc<Mutex<bool>>,
    no_file_transfer: bool,
}

impl FakeWarehouse {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    /// Pretend `schema.table` exists with `columns` as `(name, data type)`.
    pub fn with_table(self, schema: &str, table: &str, columns: &[(&str, &str)]) -> Self {
        {
            let mut known = self.columns.lock().unwrap();
            for (name, data_type) in columns {
                known.push(ColumnMeta {
                    schema_name: schema.to_uppercase(),
                    table_name: table.to_uppercase(),
                    column_name: name.to_uppercase(),
                    data_type: data_type.to_uppercase(),
                });
            }
        }
        self
    }

    pub fn with_primary_key(self, table: &str, keys: &[&str]) -> Self {
        self.primary_keys
            .lock()
            .unwrap()
            .insert(table.to_string(), keys.iter().map(|k| k.to_uppercase()).collect());
        self
    }

    /// Behave like a warehouse reached over the SQL API, without `PUT`.
    pub fn without_file_transfer(mut self) -> Self {
        self.no_file_transfer = true;
        self
    }

    pub fn fail_loads(&self) {
        *self.fail_loads.lock().unwrap() = true;
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn load(&self, kind: &str, load: &BulkLoad) -> Result<LoadCounts, WarehouseError> {
        let statement = match kind {
            "MERGE" => dialect::merge(load),
            _ => dialect::copy(load),
        };
        self.record(format!("{kind} {} {}", load.table, load.key));
        if *self.fail_loads.lock().unwrap() {
            return Err(WarehouseError::Api {
                status: 422,
                code: "100038".to_string(),
                message: "Numeric value 'abc' is not recognized".to_string(),
            });
        }
        self.loads.lock().unwrap().push(LoadCall {
            statement,
            table: load.table.clone(),
            key: load.key.clone(),
            primary_keys: load.primary_keys.clone(),
        });
        Ok(LoadCounts {
            inserted: 1,
            updated: 0,
        })
    }
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn execute_ddl(&self, statement: &str) -> Result<(), WarehouseError> {
        self.record(statement.to_string());
        Ok(())
    }

    async fn show_schemas(&self, like: &str) -> Result<Vec<String>, WarehouseError> {
        let like = like.to_uppercase();
        let found = self.columns.lock().unwrap().iter().any(|c| c.schema_name == like);
        Ok(if found { vec![like] } else { Vec::new() })
    }

    async fn show_tables(&self, schema: &str) -> Result<Vec<TableMeta>, WarehouseError> {
        let schema = schema.to_uppercase();
        let mut tables: Vec<TableMeta> = Vec::new();
        for column in self.columns.lock().unwrap().iter().filter(|c| c.schema_name == schema) {
            if !tables.iter().any(|t| t.table_name == column.table_name) {
                tables.push(TableMeta {
                    schema_name: column.schema_name.clone(),
                    table_name: column.table_name.clone(),
                });
            }
        }
        Ok(tables)
    }

    async fn show_columns(&self, schema: &str) -> Result<Vec<ColumnMeta>, WarehouseError> {
        let schema = schema.to_uppercase();
        Ok(self
            .columns
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.schema_name == schema)
            .cloned()
            .collect())
    }

    async fn show_primary_keys(&self, table: &str) -> Result<Vec<String>, WarehouseError> {
        Ok(self.primary_keys.lock().unwrap().get(table).cloned().unwrap_or_default())
    }

    async fn file_format_type(&self, _name: &str) -> Result<FileFormatType, WarehouseError> {
        Ok(FileFormatType::Csv)
    }

    async fn upsert(&self, load: &BulkLoad) -> Result<LoadCounts, WarehouseError> {
        self.load("MERGE", load)
    }

    async fn append(&self, load: &BulkLoad) -> Result<LoadCounts, WarehouseError> {
        self.load("COPY", load)
    }

    async fn delete_rows(&self, table: &str) -> Result<u64, WarehouseError> {
        self.record(dialect::delete_soft_deleted(table));
        Ok(0)
    }

    fn supports_file_transfer(&self) -> bool {
        !self.no_file_transfer
    }

    async fn put_file(&self, path: &Path, stage: &str) -> Result<(), WarehouseError> {
        self.record(dialect::put_file(path, stage));
        Ok(())
    }

    async fn remove_file(&self, stage: &str, key: &str) -> Result<(), WarehouseError> {
        self.record(dialect::remove_file(stage, key));
        Ok(())
    }

    fn scoped(&self, _schema: &str, _table: &str) -> Arc<dyn Warehouse> {
        Arc::new(self.clone())
    }
}

/// Stage that keeps a copy of every uploaded CSV file in memory.
#[derive(Clone, Default)]
pub struct FakeStage {
    pub log: CallLog,
    /// Uploaded file contents by key, kept after removal.
    pub files: Arc<Mutex<HashMap<String, String>>>,
    concurrent: bool,
    upload_delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
    uploads: Arc<AtomicUsize>,
}

impl FakeStage {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            concurrent: true,
            ..Default::default()
        }
    }

    /// A stage that does not allow concurrent uploads, like a table stage.
    pub fn serial(log: CallLog) -> Self {
        Self {
            log,
            concurrent: false,
            ..Default::default()
        }
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = Some(delay);
        self
    }

    pub fn file(&self, key: &str) -> String {
        self.files.lock().unwrap().get(key).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Stage for FakeStage {
    fn stage_name(&self, target: &TableTarget) -> String {
        format!("{}.%{}", target.schema_name, target.table)
    }

    fn supports_concurrent_upload(&self) -> bool {
        self.concurrent
    }

    async fn upload(&self, file: &EncodedFile, stream: &str, _target: &TableTarget) -> Result<String, StageError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.upload_delay {
            tokio::time::sleep(delay).await;
        }

        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        let key = format!("{stream}-{n}.{}", file.extension);
        let contents = std::fs::read_to_string(file.path()).unwrap_or_default();
        self.files.lock().unwrap().insert(key.clone(), contents);
        self.log.lock().unwrap().push(format!("UPLOAD {key}"));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(key)
    }

    async fn remove(&self, key: &str, _target: &TableTarget) -> Result<(), StageError> {
        self.log.lock().unwrap().push(format!("REMOVE {key}"));
        Ok(())
    }

    async fn archive(&self, key: &str, archive_key: &str, _metadata: &[(String, String)]) -> Result<(), StageError> {
        self.log.lock().unwrap().push(format!("ARCHIVE {key} {archive_key}"));
        Ok(())
    }
}

/// Config with uncompressed CSV load files so staged contents can be read
/// back, extended with the given JSON members.
pub fn config(extra: &str) -> Config {
    let separator = if extra.trim().is_empty() { "" } else { "," };
    Config::parse(&format!(
        r#"{{"default_target_schema": "raw", "no_compression": true{separator} {extra}}}"#
    ))
    .unwrap()
}

pub fn loader(config: Config, warehouse: &FakeWarehouse, stage: &FakeStage) -> Loader {
    let warehouse: WarehouseRef = Arc::new(warehouse.clone());
    let stage: StageRef = Arc::new(stage.clone());
    Loader::new(config, warehouse, stage, "raw.csv_format", FileFormatType::Csv)
}

/// Run the loader over `lines`, returning the checkpoint lines it wrote.
pub async fn run(loader: &Loader, lines: &[String]) -> Result<Vec<String>, snowdrift::error::LoaderError> {
    let input = lines.join("\n");
    let mut output: Vec<u8> = Vec::new();
    loader.run(input.as_bytes(), &mut output).await?;
    Ok(String::from_utf8(output)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect())
}
