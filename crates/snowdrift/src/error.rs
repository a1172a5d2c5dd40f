//! Error types for the snowdrift loader.

use snafu::prelude::*;

pub use snowdrift_core::error::{ConfigError, StorageError};

/// Problems with the input event stream itself.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtocolError {
    #[snafu(display("Unable to parse line as JSON: {line}: {source}"))]
    InvalidJson {
        line: String,
        source: serde_json::Error,
    },

    #[snafu(display("Line is not a JSON object: {line}"))]
    NotAnObject { line: String },

    #[snafu(display("Line is missing required key '{key}': {line}"))]
    MissingKey { key: String, line: String },

    #[snafu(display("Invalid '{key}' in message: {source}"))]
    InvalidField {
        key: String,
        source: serde_json::Error,
    },

    #[snafu(display("Unknown message type {kind} in message {line}"))]
    UnknownType { kind: String, line: String },

    #[snafu(display("A {kind} for stream {stream} was encountered before a corresponding schema"))]
    SchemaNotSeen { kind: String, stream: String },

    /// Key properties are mandatory unless `primary_key_required` is off.
    #[snafu(display("key_properties field is required for stream {stream}"))]
    KeyPropertiesRequired { stream: String },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FlattenError {
    #[snafu(display("Duplicate column name produced in schema: {column}"))]
    DuplicateColumn { column: String },
}

/// A record that cannot be loaded as-is.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ValidationError {
    #[snafu(display("Invalid JSON schema for stream {stream}: {message}"))]
    InvalidSchema { stream: String, message: String },

    #[snafu(display(
        "Data validation failed and cannot load to destination. RECORD: {record}\n\
         multipleOf validations that allow long precisions are not supported. \
         Try removing 'multipleOf' from the JSON schema."
    ))]
    Precision { record: String },

    #[snafu(display("Record does not pass schema validation. RECORD: {record}\n{details}"))]
    SchemaMismatch { record: String, details: String },

    #[snafu(display("Value of column '{column}' is expected to be a date/time string: {value}"))]
    UnexpectedValueType { column: String, value: String },

    #[snafu(display("Cannot find {keys:?} primary key(s) in record. Available fields: {available:?}"))]
    PrimaryKeyNotFound {
        keys: Vec<String>,
        available: Vec<String>,
    },
}

/// Errors reported by the warehouse collaborator.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WarehouseError {
    #[snafu(display("Warehouse request failed: {source}"))]
    Request { source: reqwest::Error },

    #[snafu(display("Warehouse returned {status} ({code}): {message}"))]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The catalog object does not exist (or is not visible to the role).
    #[snafu(display("Object does not exist: {message}"))]
    NotFound { message: String },

    #[snafu(display("Query returned too many records. This query can return max {max} records"))]
    TooManyRecords { max: usize },

    #[snafu(display("Unable to decode warehouse response: {message}"))]
    Decode { message: String },

    #[snafu(display("{operation} is not supported by this warehouse client"))]
    Unsupported { operation: String },

    #[snafu(display("Named file format not found: {name}"))]
    FileFormatNotFound { name: String },

    #[snafu(display("Not supported named file format {name} of type {kind}"))]
    FileFormatUnsupported { name: String, kind: String },
}

impl WarehouseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, WarehouseError::NotFound { .. })
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StageError {
    #[snafu(display("Object storage error: {source}"))]
    Storage { source: StorageError },

    #[snafu(display("Table stage command failed: {source}"))]
    TableStage { source: WarehouseError },

    #[snafu(display("Archiving load files requires an external stage"))]
    ArchiveUnsupported,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EncodeError {
    #[snafu(display("Failed to create load file: {source}"))]
    TempFile { source: std::io::Error },

    #[snafu(display("Failed to write CSV row: {source}"))]
    Csv { source: csv::Error },

    #[snafu(display("Failed to build Arrow batch: {source}"))]
    Arrow { source: arrow::error::ArrowError },

    #[snafu(display("Failed to write Parquet file: {source}"))]
    Parquet {
        source: parquet::errors::ParquetError,
    },
}

/// Failures while creating or altering destination objects.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SyncError {
    #[snafu(display(
        "Target schema name not defined in config. Neither 'default_target_schema' (string) \
         nor 'schema_mapping' (object) defines target schema for {stream} stream."
    ))]
    NoTargetSchema { stream: String },

    #[snafu(display("Failed to run '{statement}': {source}"))]
    Ddl {
        statement: String,
        source: WarehouseError,
    },

    #[snafu(display("Catalog query failed: {source}"))]
    Catalog { source: WarehouseError },
}

/// Failures of a single stream or batch flush.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FlushError {
    #[snafu(display("Failed to encode rows of {stream}: {source}"))]
    Encode { stream: String, source: EncodeError },

    #[snafu(display("Failed to stage load file of {stream}: {source}"))]
    Upload { stream: String, source: StageError },

    #[snafu(display("Failed to load {stream} into {table}: {source}"))]
    Load {
        stream: String,
        table: String,
        source: WarehouseError,
    },

    #[snafu(display("Failed to archive load file of {stream}: {source}"))]
    Archive { stream: String, source: StageError },

    #[snafu(display("Failed to remove staged file {key}: {source}"))]
    RemoveStaged { key: String, source: StageError },

    #[snafu(display("Failed to delete soft-deleted rows from {table}: {source}"))]
    HardDelete {
        table: String,
        source: WarehouseError,
    },

    #[snafu(display("Failed to read batch file {path}: {source}"))]
    BatchRead {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Invalid line {line} in batch file {path}: {source}"))]
    BatchLine {
        path: String,
        line: usize,
        source: serde_json::Error,
    },

    #[snafu(display("Invalid record in batch file {path}: {source}"))]
    BatchRecord {
        path: String,
        source: ValidationError,
    },

    #[snafu(display("Unsupported batch file {path}: {message}"))]
    UnsupportedBatch { path: String, message: String },

    #[snafu(display("Flush task failed: {source}"))]
    TaskJoin { source: tokio::task::JoinError },
}

/// Top-level loader errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoaderError {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("{source}"))]
    Protocol { source: ProtocolError },

    #[snafu(display("Schema flattening failed for stream {stream}: {source}"))]
    Flatten {
        stream: String,
        source: FlattenError,
    },

    #[snafu(display("{source}"))]
    Validation { source: ValidationError },

    #[snafu(display("Table sync failed for stream {stream}: {source}"))]
    Sync { stream: String, source: SyncError },

    #[snafu(display("Flush failed: {source}"))]
    Flush { source: FlushError },

    #[snafu(display("Warehouse error: {source}"))]
    Warehouse { source: WarehouseError },

    #[snafu(display("Stage error: {source}"))]
    Stage { source: StageError },

    #[snafu(display("Failed to read input: {source}"))]
    Input { source: std::io::Error },

    #[snafu(display("Failed to write checkpoint: {source}"))]
    Output { source: std::io::Error },

    #[snafu(display("Failed to encode checkpoint: {source}"))]
    CheckpointEncode { source: serde_json::Error },
}

impl From<ConfigError> for LoaderError {
    fn from(source: ConfigError) -> Self {
        LoaderError::Config { source }
    }
}

impl From<ProtocolError> for LoaderError {
    fn from(source: ProtocolError) -> Self {
        LoaderError::Protocol { source }
    }
}

impl From<ValidationError> for LoaderError {
    fn from(source: ValidationError) -> Self {
        LoaderError::Validation { source }
    }
}

impl From<FlushError> for LoaderError {
    fn from(source: FlushError) -> Self {
        LoaderError::Flush { source }
    }
}

impl From<WarehouseError> for LoaderError {
    fn from(source: WarehouseError) -> Self {
        LoaderError::Warehouse { source }
    }
}
