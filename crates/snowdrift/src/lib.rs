//! Snowdrift: batch loader for line-delimited event streams into Snowflake.
//!
//! This crate handles:
//! - Parsing `SCHEMA`, `RECORD`, `STATE`, `BATCH` and `ACTIVATE_VERSION` events
//! - Flattening, validating and buffering records per stream
//! - Creating and altering destination tables as schemas drift
//! - Staging CSV or Parquet load files and loading them with `MERGE`/`COPY INTO`
//! - Writing `STATE` checkpoints only after the rows they cover are committed

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod flatten;
pub mod format;
pub mod materializer;
pub mod message;
pub mod metrics;
pub mod naming;
pub mod stage;
pub mod stream;
pub mod sync;
pub mod transform;
pub mod validate;
pub mod warehouse;

use std::sync::Arc;

use snafu::prelude::*;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::info;

use cache::MetadataCache;
use coordinator::{Coordinator, FlushSettings};
use dispatcher::Dispatcher;
use error::{ConfigError, LoaderError, StageSnafu};
use materializer::{Materializer, MaterializerSettings};
use stage::{ExternalStage, StageRef, TableStage};
use warehouse::{SqlApiSettings, SqlApiWarehouse, WarehouseRef};

// Re-export commonly used items
pub use config::{Config, FileFormatType};
pub use snowdrift_core::{CliArgs, init_metrics, init_tracing};

/// A configured loader with its warehouse and stage collaborators.
pub struct Loader {
    config: Arc<Config>,
    warehouse: WarehouseRef,
    stage: StageRef,
    table_stage: bool,
    file_format: String,
    format: FileFormatType,
}

impl Loader {
    /// Assemble a loader from explicit collaborators.
    pub fn new(
        config: Config,
        warehouse: WarehouseRef,
        stage: StageRef,
        file_format: impl Into<String>,
        format: FileFormatType,
    ) -> Self {
        Self {
            table_stage: !stage.supports_concurrent_upload(),
            config: Arc::new(config),
            warehouse,
            stage,
            file_format: file_format.into(),
            format,
        }
    }

    /// Build the SQL API warehouse and the stage described by `config`.
    pub async fn from_config(config: Config) -> Result<Self, LoaderError> {
        let settings = SqlApiSettings::from_config(&config)?;
        let warehouse: WarehouseRef = Arc::new(SqlApiWarehouse::new(settings));
        Self::with_warehouse(config, warehouse).await
    }

    /// Build the stage described by `config` on top of `warehouse` and
    /// resolve the file format.
    pub async fn with_warehouse(config: Config, warehouse: WarehouseRef) -> Result<Self, LoaderError> {
        let stage: StageRef = match ExternalStage::from_config(&config).await.context(StageSnafu)? {
            Some(stage) => Arc::new(stage),
            None if warehouse.supports_file_transfer() => {
                info!("No s3_bucket configured, using table stages");
                Arc::new(TableStage::new(warehouse.clone()))
            }
            None => {
                return Err(ConfigError::Invalid {
                    errors: vec![
                        "s3_bucket is required: table stages need PUT and REMOVE, \
                         which the SQL API does not support"
                            .to_string(),
                    ],
                }
                .into());
            }
        };

        let file_format = Config::required(&config.file_format, "file_format")?.to_string();
        let format = match config.file_format_type {
            Some(format) => format,
            None => warehouse.file_format_type(&file_format).await?,
        };
        if config.uses_table_stage() && format == FileFormatType::Parquet {
            return Err(ConfigError::Invalid {
                errors: vec![format!(
                    "Table stages with Parquet file format is not supported. \
                     File format {file_format} is of type parquet."
                )],
            }
            .into());
        }
        info!(file_format = %file_format, format = format.as_str(), "Using file format");

        Ok(Self::new(config, warehouse, stage, file_format, format))
    }

    /// Load every event of `input`, writing checkpoints to `output`.
    pub async fn run<R, W>(&self, input: R, output: W) -> Result<(), LoaderError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send,
    {
        let mut cache = MetadataCache::new(self.warehouse.clone(), !self.config.disable_table_cache);
        cache.load(&self.config.schema_names()).await?;

        let materializer = Materializer::new(
            self.warehouse.clone(),
            self.stage.clone(),
            MaterializerSettings::from_config(&self.config, self.file_format.clone(), self.format),
        );
        let coordinator = Coordinator::new(
            Arc::new(materializer),
            FlushSettings::from_config(&self.config, self.table_stage),
            output,
        );
        let mut dispatcher = Dispatcher::new(self.config.clone(), self.warehouse.clone(), cache, coordinator);
        dispatcher.run(input).await
    }
}
