//! Google Cloud Storage backend.

use std::sync::Arc;

use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path;
use object_store::{ObjectStore, RetryConfig};
use snafu::prelude::*;
use tracing::debug;

use crate::error::{GcsConfigSnafu, StorageError};

use super::{StorageLocation, StorageProvider};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcsLocation {
    pub bucket: String,
    pub key: Option<Path>,
}

impl StorageProvider {
    pub(super) fn construct_gcs(location: GcsLocation) -> Result<Self, StorageError> {
        let mut builder = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(&location.bucket)
            .with_retry(RetryConfig::default());

        if let Ok(service_account_key) = std::env::var("GOOGLE_SERVICE_ACCOUNT_KEY") {
            debug!("Using GCS service account key from environment");
            builder = builder.with_service_account_key(&service_account_key);
        }

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(builder.build().context(GcsConfigSnafu)?);
        let canonical_url = format!("gcs://{}", location.bucket);

        Ok(Self {
            location: StorageLocation::Gcs(location),
            object_store,
            canonical_url,
        })
    }
}
