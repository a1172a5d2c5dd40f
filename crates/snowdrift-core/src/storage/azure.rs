//! Azure Blob Storage backend.

use std::sync::Arc;

use object_store::azure::MicrosoftAzureBuilder;
use object_store::path::Path;
use object_store::{ObjectStore, RetryConfig};
use snafu::prelude::*;

use crate::error::{AzureConfigSnafu, StorageError};

use super::{StorageLocation, StorageProvider};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureLocation {
    pub account: String,
    pub container: String,
    pub key: Option<Path>,
}

impl StorageProvider {
    pub(super) fn construct_azure(location: AzureLocation) -> Result<Self, StorageError> {
        let builder = MicrosoftAzureBuilder::from_env()
            .with_account(&location.account)
            .with_container_name(&location.container)
            .with_retry(RetryConfig::default());

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(builder.build().context(AzureConfigSnafu)?);
        let canonical_url = format!(
            "azure://{}.blob.core.windows.net/{}",
            location.account, location.container
        );

        Ok(Self {
            location: StorageLocation::Azure(location),
            object_store,
            canonical_url,
        })
    }
}
