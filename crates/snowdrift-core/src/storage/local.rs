//! Local filesystem backend, used for development and tests.

use std::sync::Arc;

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use snafu::prelude::*;

use crate::error::{IoSnafu, ObjectStoreSnafu, StorageError};

use super::{StorageLocation, StorageProvider};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalLocation {
    pub path: String,
}

impl StorageProvider {
    pub(super) async fn construct_local(location: LocalLocation) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&location.path)
            .await
            .context(IoSnafu)?;

        let object_store: Arc<dyn ObjectStore> = Arc::new(
            LocalFileSystem::new_with_prefix(&location.path).context(ObjectStoreSnafu)?,
        );
        let canonical_url = format!("file://{}", location.path);

        Ok(Self {
            location: StorageLocation::Local(location),
            object_store,
            canonical_url,
        })
    }
}
