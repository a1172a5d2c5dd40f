//! Stage collaborator.
//!
//! A stage holds load files between encoding and the bulk load statement.
//! [`ExternalStage`] writes them to object storage behind a named external
//! stage; [`TableStage`] uploads them into the warehouse-managed stage of the
//! target table.

mod external;
mod table;

pub use external::ExternalStage;
pub use table::TableStage;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StageError;
use crate::format::EncodedFile;
use crate::sync::TableTarget;

#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name as used in load statements, without the leading `@`.
    fn stage_name(&self, target: &TableTarget) -> String;

    /// Whether several streams may upload at the same time.
    fn supports_concurrent_upload(&self) -> bool;

    /// Upload a load file, returning its key relative to the stage.
    async fn upload(&self, file: &EncodedFile, stream: &str, target: &TableTarget) -> Result<String, StageError>;

    async fn remove(&self, key: &str, target: &TableTarget) -> Result<(), StageError>;

    /// Copy a staged file to the archive location under `archive_key`.
    async fn archive(&self, key: &str, archive_key: &str, metadata: &[(String, String)]) -> Result<(), StageError>;
}

pub type StageRef = Arc<dyn Stage>;
