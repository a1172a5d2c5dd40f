//! Warehouse-managed table stage.
//!
//! Files are uploaded with `PUT` into `@schema.%"TABLE"` and removed with
//! `REMOVE`, both through the warehouse collaborator. Uploads share the
//! client session, so only one stream may upload at a time.

use async_trait::async_trait;
use snafu::prelude::*;
use tracing::info;

use super::Stage;
use crate::error::{ArchiveUnsupportedSnafu, StageError, TableStageSnafu};
use crate::format::EncodedFile;
use crate::sync::TableTarget;
use crate::warehouse::WarehouseRef;

pub struct TableStage {
    warehouse: WarehouseRef,
}

impl TableStage {
    pub fn new(warehouse: WarehouseRef) -> Self {
        Self { warehouse }
    }
}

#[async_trait]
impl Stage for TableStage {
    fn stage_name(&self, target: &TableTarget) -> String {
        format!("{}.%{}", target.schema_name, target.table)
    }

    fn supports_concurrent_upload(&self) -> bool {
        false
    }

    async fn upload(&self, file: &EncodedFile, _stream: &str, target: &TableTarget) -> Result<String, StageError> {
        let stage = self.stage_name(target);
        let key = file
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(stage = %stage, key = %key, "Uploading load file to table stage");
        self.warehouse
            .put_file(file.path(), &stage)
            .await
            .context(TableStageSnafu)?;
        Ok(key)
    }

    async fn remove(&self, key: &str, target: &TableTarget) -> Result<(), StageError> {
        let stage = self.stage_name(target);
        info!(stage = %stage, key = %key, "Deleting load file from table stage");
        self.warehouse
            .remove_file(&stage, key)
            .await
            .context(TableStageSnafu)
    }

    async fn archive(&self, _key: &str, _archive_key: &str, _metadata: &[(String, String)]) -> Result<(), StageError> {
        ArchiveUnsupportedSnafu.fail()
    }
}
