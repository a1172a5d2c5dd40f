//! Input event dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use snafu::prelude::*;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tracing::{debug, info};

use crate::cache::MetadataCache;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::{
    FlattenSnafu, InputSnafu, KeyPropertiesRequiredSnafu, LoaderError, SchemaNotSeenSnafu, SyncSnafu,
};
use crate::flatten::flatten_schema;
use crate::materializer::BatchJob;
use crate::message::{ActivateVersionMessage, BatchMessage, Event, RecordMessage, SchemaMessage, parse_line};
use crate::stream::StreamState;
use crate::sync::{TableSync, TableTarget};
use crate::transform::{RecordTransform, add_metadata_columns, batched_at_now};
use crate::validate::{JsonSchemaValidator, RecordValidator};
use crate::warehouse::WarehouseRef;

/// Schema and key properties a stream was last set up with.
type SchemaIdentity = (Value, Option<Vec<String>>);

pub struct Dispatcher<W> {
    config: Arc<Config>,
    warehouse: WarehouseRef,
    cache: MetadataCache,
    coordinator: Coordinator<W>,
    schemas: HashMap<String, SchemaIdentity>,
    bookmark_properties: HashMap<String, Option<Vec<String>>>,
}

impl<W: AsyncWrite + Unpin + Send> Dispatcher<W> {
    pub fn new(config: Arc<Config>, warehouse: WarehouseRef, cache: MetadataCache, coordinator: Coordinator<W>) -> Self {
        Self {
            config,
            warehouse,
            cache,
            coordinator,
            schemas: HashMap::new(),
            bookmark_properties: HashMap::new(),
        }
    }

    /// Consume `input` until end of file, then flush everything and write
    /// the final checkpoint.
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, input: R) -> Result<(), LoaderError> {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.context(InputSnafu)? {
            if line.trim().is_empty() {
                continue;
            }
            let event = parse_line(&line)?;
            self.handle(event).await?;
        }

        info!("End of input, flushing remaining streams");
        self.coordinator.finish().await
    }

    pub async fn handle(&mut self, event: Event) -> Result<(), LoaderError> {
        match event {
            Event::Schema(message) => self.on_schema(message).await,
            Event::Record(message) => self.on_record(message).await,
            Event::State(message) => {
                debug!("Received state");
                self.coordinator.on_state(message.value);
                Ok(())
            }
            Event::Batch(message) => self.on_batch(message).await,
            Event::ActivateVersion(ActivateVersionMessage { stream, version }) => {
                info!(stream = %stream, version = ?version, "ACTIVATE_VERSION message received, ignoring");
                Ok(())
            }
        }
    }

    async fn on_schema(&mut self, message: SchemaMessage) -> Result<(), LoaderError> {
        let SchemaMessage {
            stream,
            schema,
            key_properties,
            bookmark_properties,
        } = message;

        let identity = (schema, key_properties);
        if self.schemas.get(&stream) == Some(&identity) {
            debug!(stream = %stream, "Schema unchanged");
            return Ok(());
        }
        let (schema, key_properties) = identity;

        if self.coordinator.stream(&stream).is_some_and(StreamState::has_rows) {
            info!(stream = %stream, "Schema changed, flushing buffered rows first");
            self.coordinator.flush_stream(&stream).await?;
        }

        let keys = key_properties
            .clone()
            .context(KeyPropertiesRequiredSnafu { stream: &stream })?;
        ensure!(
            !keys.is_empty() || !self.config.primary_key_required,
            KeyPropertiesRequiredSnafu { stream: &stream }
        );

        let add_metadata = self.config.add_metadata_columns || self.config.hard_delete;
        let mut stream_schema = schema.clone();
        if add_metadata {
            add_metadata_columns(&mut stream_schema);
        }

        let max_level = self.config.data_flattening_max_level;
        let flat_schema = flatten_schema(&stream_schema, max_level).context(FlattenSnafu { stream: &stream })?;

        let validator = if self.config.validate_records {
            let validator = JsonSchemaValidator::new(&stream, &stream_schema)?;
            Some(Arc::new(validator) as Arc<dyn RecordValidator>)
        } else {
            None
        };

        let target = TableTarget::resolve(&stream, &self.config).context(SyncSnafu { stream: &stream })?;
        TableSync::new(self.warehouse.as_ref(), &mut self.cache)
            .ensure_schema(&target, &flat_schema, &keys)
            .await
            .context(SyncSnafu { stream: &stream })?;

        let transform = RecordTransform {
            stream: stream.clone(),
            schema: stream_schema,
            flat_schema,
            key_properties: keys,
            max_level,
            add_metadata,
            validator,
            precision_as_warnings: self.config.precision_errors_as_warnings,
        };
        let state = StreamState::new(Arc::new(transform), target, bookmark_properties.as_deref());
        info!(stream = %stream, table = %state.target.qualified(), "Stream ready");

        self.coordinator.set_stream(&stream, state);
        self.bookmark_properties.insert(stream.clone(), bookmark_properties);
        self.schemas.insert(stream, (schema, key_properties));
        Ok(())
    }

    async fn on_record(&mut self, message: RecordMessage) -> Result<(), LoaderError> {
        let RecordMessage {
            stream,
            record,
            time_extracted,
        } = message;

        let transform = self
            .coordinator
            .stream(&stream)
            .context(SchemaNotSeenSnafu {
                kind: "RECORD",
                stream: &stream,
            })?
            .transform
            .clone();

        let row = transform.apply(record, time_extracted.as_deref(), &batched_at_now())?;
        let key = transform.primary_key(&row)?;
        self.coordinator.buffer(&stream, key, row).await
    }

    async fn on_batch(&mut self, message: BatchMessage) -> Result<(), LoaderError> {
        let state = self.coordinator.stream(&message.stream).context(SchemaNotSeenSnafu {
            kind: "BATCH",
            stream: &message.stream,
        })?;
        let job = BatchJob {
            transform: state.transform.clone(),
            target: state.target.clone(),
            bookmark_properties: self.bookmark_properties.get(&message.stream).cloned().flatten(),
            message,
        };
        self.coordinator.queue_batch(job).await
    }
}
