//! Batch materializer.
//!
//! Turns a snapshot of buffered rows into committed warehouse rows:
//!
//! 1. encode the rows into a local load file
//! 2. upload it to the stage
//! 3. `MERGE` (key properties declared) or `COPY INTO` (append only)
//! 4. archive the staged file when configured
//! 5. remove the staged file, whatever the outcome of the load
//! 6. delete soft-deleted rows when `hard_delete` is set
//!
//! `BATCH` files go through the same path after their lines are
//! transformed like streamed records.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use snafu::prelude::*;
use tracing::{debug, info};

use snowdrift_core::emit;

use crate::config::{Config, FileFormatType};
use crate::error::{
    ArchiveSnafu, BatchLineSnafu, BatchReadSnafu, BatchRecordSnafu, EncodeSnafu, FlushError,
    HardDeleteSnafu, LoadSnafu, RemoveStagedSnafu, TaskJoinSnafu, UnsupportedBatchSnafu, UploadSnafu,
};
use crate::flatten::FlatRecord;
use crate::format::{EncodeOptions, encode};
use crate::message::BatchMessage;
use crate::metrics::events::{RowsLoaded, StreamFlushCompleted};
use crate::stage::StageRef;
use crate::stream::StreamState;
use crate::sync::TableTarget;
use crate::transform::{RecordTransform, batched_at_now};
use crate::warehouse::{BulkLoad, LoadColumn, LoadCounts, WarehouseRef};

/// `tap` metadata value when `tap_id` is not configured.
const UNDEFINED_TAP: &str = "undefined-tap";

/// Rows of one stream to load.
#[derive(Debug)]
pub struct FlushJob {
    pub stream: String,
    pub transform: Arc<RecordTransform>,
    pub target: TableTarget,
    pub rows: Vec<FlatRecord>,
    /// Bookmark metadata attached to the archived file.
    pub bookmark_metadata: Vec<(String, String)>,
}

impl FlushJob {
    /// Snapshot of the buffered rows of `state`.
    pub fn snapshot(stream: &str, state: &StreamState) -> Self {
        Self {
            stream: stream.to_string(),
            transform: state.transform.clone(),
            target: state.target.clone(),
            rows: state.snapshot(),
            bookmark_metadata: state.bookmarks.metadata(),
        }
    }
}

/// A `BATCH` file waiting to be loaded.
#[derive(Debug)]
pub struct BatchJob {
    pub message: BatchMessage,
    pub transform: Arc<RecordTransform>,
    pub target: TableTarget,
    pub bookmark_properties: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct MaterializerSettings {
    pub encode: EncodeOptions,
    /// Named file format used by load statements.
    pub file_format: String,
    pub hard_delete: bool,
    pub archive_load_files: bool,
    pub tap_id: String,
}

impl MaterializerSettings {
    pub fn from_config(config: &Config, file_format: String, format: FileFormatType) -> Self {
        Self {
            encode: EncodeOptions::from_config(config, format),
            file_format,
            hard_delete: config.hard_delete,
            archive_load_files: config.archive_load_files,
            tap_id: config.tap_id.clone().unwrap_or_else(|| UNDEFINED_TAP.to_string()),
        }
    }
}

pub struct Materializer {
    warehouse: WarehouseRef,
    stage: StageRef,
    settings: MaterializerSettings,
}

impl Materializer {
    pub fn new(warehouse: WarehouseRef, stage: StageRef, settings: MaterializerSettings) -> Self {
        Self {
            warehouse,
            stage,
            settings,
        }
    }

    /// Load the rows of `job`. Empty jobs make no collaborator calls.
    pub async fn flush(&self, job: FlushJob) -> Result<LoadCounts, FlushError> {
        if job.rows.is_empty() {
            return Ok(LoadCounts::default());
        }

        let start = Instant::now();
        let FlushJob {
            stream,
            transform,
            target,
            rows,
            bookmark_metadata,
        } = job;

        let options = self.settings.encode.clone();
        let schema_source = transform.clone();
        let file = tokio::task::spawn_blocking(move || encode(&rows, &schema_source.flat_schema, &options))
            .await
            .context(TaskJoinSnafu)?
            .context(EncodeSnafu { stream: &stream })?;
        debug!(stream = %stream, rows = file.rows, bytes = file.size_bytes, "Load file written");

        let key = self
            .stage
            .upload(&file, &stream, &target)
            .await
            .context(UploadSnafu { stream: &stream })?;

        let table = target.qualified();
        let load = BulkLoad {
            table: table.clone(),
            stage: self.stage.stage_name(&target),
            key: key.clone(),
            file_format: self.settings.file_format.clone(),
            format_type: self.settings.encode.format,
            columns: LoadColumn::from_schema(&transform.flat_schema),
            primary_keys: transform.key_properties.clone(),
        };

        let warehouse = self.warehouse.scoped(&target.schema_name, &target.table);
        let result = if load.primary_keys.is_empty() {
            warehouse.append(&load).await
        } else {
            warehouse.upsert(&load).await
        };
        let loaded = result.context(LoadSnafu {
            stream: &stream,
            table: &table,
        });

        let archived = match (&loaded, self.settings.archive_load_files) {
            (Ok(_), true) => self.archive(&stream, &target, &key, bookmark_metadata).await,
            _ => Ok(()),
        };
        let removed = self
            .stage
            .remove(&key, &target)
            .await
            .context(RemoveStagedSnafu { key: &key });

        let counts = loaded?;
        archived?;
        removed?;

        emit!(RowsLoaded {
            stream: stream.clone(),
            inserted: counts.inserted,
            updated: counts.updated,
        });
        info!(
            stream = %stream,
            table = %table,
            rows = file.rows,
            inserted = counts.inserted,
            updated = counts.updated,
            "Loaded rows"
        );

        if self.settings.hard_delete {
            let deleted = warehouse
                .delete_rows(&table)
                .await
                .context(HardDeleteSnafu { table: &table })?;
            info!(table = %table, deleted, "Deleted soft-deleted rows");
        }

        emit!(StreamFlushCompleted {
            stream,
            duration: start.elapsed(),
        });
        Ok(counts)
    }

    async fn archive(
        &self,
        stream: &str,
        target: &TableTarget,
        key: &str,
        bookmark_metadata: Vec<(String, String)>,
    ) -> Result<(), FlushError> {
        let file_name = key.rsplit('/').next().unwrap_or(key);
        let table = target.bare_table();
        let archive_key = format!("{}/{}/{}", self.settings.tap_id, table, file_name);

        let mut metadata = vec![
            ("tap".to_string(), self.settings.tap_id.clone()),
            ("schema".to_string(), target.schema_name.clone()),
            ("table".to_string(), table.to_string()),
            ("archived-by".to_string(), "snowdrift".to_string()),
        ];
        metadata.extend(bookmark_metadata);

        self.stage
            .archive(key, &archive_key, &metadata)
            .await
            .context(ArchiveSnafu { stream })
    }

    /// Load a `BATCH` file.
    pub async fn flush_batch(&self, job: BatchJob) -> Result<LoadCounts, FlushError> {
        let BatchJob {
            message,
            transform,
            target,
            bookmark_properties,
        } = job;
        let path = batch_path(&message)?;
        info!(stream = %message.stream, path = %path.display(), "Loading batch file");

        let gzip = message.compression.as_deref() == Some("gzip");
        let reader_transform = transform.clone();
        let reader_target = target.clone();
        let state = tokio::task::spawn_blocking(move || {
            let mut state = StreamState::new(reader_transform, reader_target, bookmark_properties.as_deref());
            read_batch(&path, gzip, &mut state)?;
            Ok::<_, FlushError>(state)
        })
        .await
        .context(TaskJoinSnafu)??;

        self.flush(FlushJob::snapshot(&message.stream, &state)).await
    }
}

/// Local path of a batch file. Only uncompressed or gzip JSONL files on the
/// local filesystem are supported.
fn batch_path(message: &BatchMessage) -> Result<PathBuf, FlushError> {
    let filepath = message.filepath.as_str();
    ensure!(
        message.format == "jsonl",
        UnsupportedBatchSnafu {
            path: filepath,
            message: format!("format {} is not supported", message.format),
        }
    );
    if let Some(compression) = message.compression.as_deref() {
        ensure!(
            compression == "gzip",
            UnsupportedBatchSnafu {
                path: filepath,
                message: format!("compression {compression} is not supported"),
            }
        );
    }

    let local = filepath.strip_prefix("file://").unwrap_or(filepath);
    ensure!(
        !local.contains("://"),
        UnsupportedBatchSnafu {
            path: filepath,
            message: "only local files are supported",
        }
    );
    Ok(PathBuf::from(local))
}

/// Read batch lines into `state`. Each line is a `RECORD` message or a bare
/// record object.
fn read_batch(path: &std::path::Path, gzip: bool, state: &mut StreamState) -> Result<(), FlushError> {
    let display = path.display().to_string();
    let file = File::open(path).context(BatchReadSnafu { path: &display })?;
    let reader: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let batched_at = batched_at_now();
    for (index, line) in BufReader::new(reader).lines().enumerate() {
        let line = line.context(BatchReadSnafu { path: &display })?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line).context(BatchLineSnafu {
            path: &display,
            line: index + 1,
        })?;
        let (record, time_extracted) = split_batch_line(value).context(UnsupportedBatchSnafu {
            path: &display,
            message: format!("line {} is not a JSON object", index + 1),
        })?;

        let transform = state.transform.clone();
        let row = transform
            .apply(record, time_extracted.as_deref(), &batched_at)
            .context(BatchRecordSnafu { path: &display })?;
        let key = transform
            .primary_key(&row)
            .context(BatchRecordSnafu { path: &display })?;
        state.buffer(key, row);
    }
    Ok(())
}

fn split_batch_line(value: Value) -> Option<(Map<String, Value>, Option<String>)> {
    let Value::Object(mut object) = value else {
        return None;
    };
    let is_message = object.get("type").and_then(Value::as_str) == Some("RECORD");
    if !is_message {
        return Some((object, None));
    }
    let time_extracted = object
        .get("time_extracted")
        .and_then(Value::as_str)
        .map(str::to_string);
    match object.remove("record") {
        Some(Value::Object(record)) => Some((record, time_extracted)),
        _ => None,
    }
}
