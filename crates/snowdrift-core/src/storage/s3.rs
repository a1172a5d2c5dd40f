//! Amazon S3 (and S3 compatible) backend.

use std::collections::HashMap;
use std::sync::Arc;

use object_store::aws::{AmazonS3Builder, AmazonS3ConfigKey};
use object_store::path::Path;
use object_store::{ObjectStore, RetryConfig};
use snafu::prelude::*;

use crate::error::{S3ConfigSnafu, StorageError};

use super::{StorageLocation, StorageProvider};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub key: Option<Path>,
}

impl StorageProvider {
    pub(super) fn construct_s3(
        location: S3Location,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&location.bucket)
            .with_retry(RetryConfig::default());

        for (key, value) in &options {
            let key: AmazonS3ConfigKey = key.parse().context(S3ConfigSnafu)?;
            builder = builder.with_config(key, value.clone());
        }

        if let Some(region) = &location.region {
            builder = builder.with_region(region);
        }

        let endpoint = location
            .endpoint
            .clone()
            .or_else(|| options.get("aws_endpoint").cloned());
        if let Some(endpoint) = &endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(builder.build().context(S3ConfigSnafu)?);
        let canonical_url = format!("s3://{}", location.bucket);

        Ok(Self {
            location: StorageLocation::S3(location),
            object_store,
            canonical_url,
        })
    }
}
