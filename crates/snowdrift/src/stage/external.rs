//! External stage on object storage.

use async_trait::async_trait;
use chrono::Utc;
use object_store::path::Path;
use snafu::prelude::*;
use tracing::info;

use snowdrift_core::StorageProvider;

use super::Stage;
use crate::config::Config;
use crate::error::{ArchiveUnsupportedSnafu, StageError, StorageSnafu};
use crate::format::EncodedFile;
use crate::sync::TableTarget;

/// Where archived load files go.
#[derive(Debug, Clone)]
struct ArchiveLocation {
    storage: StorageProvider,
    prefix: String,
}

/// Load files in a bucket behind a named stage (`schema.stage_name`).
#[derive(Debug, Clone)]
pub struct ExternalStage {
    name: String,
    storage: StorageProvider,
    key_prefix: String,
    archive: Option<ArchiveLocation>,
}

impl ExternalStage {
    pub fn new(name: impl Into<String>, storage: StorageProvider, key_prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage,
            key_prefix: key_prefix.into(),
            archive: None,
        }
    }

    /// Archive copies of load files under `prefix` in `storage`.
    pub fn with_archive(mut self, storage: StorageProvider, prefix: impl Into<String>) -> Self {
        self.archive = Some(ArchiveLocation {
            storage,
            prefix: prefix.into(),
        });
        self
    }

    /// Build the stage from `s3_bucket`, `stage` and the archive settings.
    ///
    /// Returns `None` when the configuration uses table stages.
    pub async fn from_config(config: &Config) -> Result<Option<Self>, StageError> {
        let (Some(bucket), Some(name)) = (&config.s3_bucket, &config.stage) else {
            return Ok(None);
        };

        let storage = StorageProvider::for_url_with_options(bucket, config.storage_options())
            .await
            .context(StorageSnafu)?;
        info!(stage = %name, location = %storage.url(), "Using external stage");

        let mut stage = Self::new(name.clone(), storage.clone(), config.s3_key_prefix.clone());
        if config.archive_load_files {
            let archive_storage = match &config.archive_load_files_s3_bucket {
                Some(archive_bucket) => StorageProvider::for_url_with_options(archive_bucket, config.storage_options())
                    .await
                    .context(StorageSnafu)?,
                None => storage,
            };
            stage = stage.with_archive(archive_storage, config.archive_load_files_s3_prefix.clone());
        }
        Ok(Some(stage))
    }

    /// Key of a new load file for `stream`.
    pub fn object_key(&self, stream: &str, extension: &str) -> String {
        format!(
            "{}snowdrift_{}_{}.{}",
            self.key_prefix,
            stream,
            Utc::now().format("%Y%m%d-%H%M%S-%6f"),
            extension
        )
    }
}

#[async_trait]
impl Stage for ExternalStage {
    fn stage_name(&self, _target: &TableTarget) -> String {
        self.name.clone()
    }

    fn supports_concurrent_upload(&self) -> bool {
        true
    }

    async fn upload(&self, file: &EncodedFile, stream: &str, _target: &TableTarget) -> Result<String, StageError> {
        let key = self.object_key(stream, file.extension);
        info!(location = %self.storage.url(), key = %key, "Uploading load file to external stage");
        self.storage
            .put_file(&Path::from(key.as_str()), file.path(), &[])
            .await
            .context(StorageSnafu)?;
        Ok(key)
    }

    async fn remove(&self, key: &str, _target: &TableTarget) -> Result<(), StageError> {
        info!(key = %key, "Deleting load file from external stage");
        self.storage
            .delete(&Path::from(key))
            .await
            .context(StorageSnafu)
    }

    async fn archive(&self, key: &str, archive_key: &str, metadata: &[(String, String)]) -> Result<(), StageError> {
        let archive = self.archive.as_ref().context(ArchiveUnsupportedSnafu)?;
        let destination = format!("{}/{}", archive.prefix.trim_end_matches('/'), archive_key);
        info!(key = %key, archive = %destination, "Copying load file to archive");
        self.storage
            .copy_to(
                &archive.storage,
                &Path::from(key),
                &Path::from(destination.as_str()),
                metadata,
            )
            .await
            .context(StorageSnafu)
    }
}
