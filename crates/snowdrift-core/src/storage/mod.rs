//! Object storage used for staging and archiving load files.
//!
//! Wraps `object_store` for S3, GCS, Azure Blob Storage and the local
//! filesystem behind a single provider that qualifies keys with the
//! location prefix and records request metrics.

mod azure;
mod gcs;
mod local;
mod s3;
mod url_parser;

pub use azure::AzureLocation;
pub use gcs::GcsLocation;
pub use local::LocalLocation;
pub use s3::S3Location;
pub use url_parser::StorageLocation;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use object_store::path::Path;
use object_store::{Attribute, AttributeValue, Attributes, ObjectStore, PutOptions, PutPayload};
use snafu::prelude::*;
use tracing::debug;

use crate::emit;
use crate::error::{IoSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

pub type StorageProviderRef = Arc<StorageProvider>;

/// A bucket (or directory) plus optional key prefix.
#[derive(Clone)]
pub struct StorageProvider {
    location: StorageLocation,
    object_store: Arc<dyn ObjectStore>,
    canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

impl StorageProvider {
    /// Build a provider from a location string.
    ///
    /// `options` are backend configuration keys such as `aws_access_key_id`
    /// or `aws_endpoint`; they are only consulted by the S3 backend.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match StorageLocation::parse(url)? {
            StorageLocation::S3(location) => Self::construct_s3(location, options),
            StorageLocation::Gcs(location) => Self::construct_gcs(location),
            StorageLocation::Azure(location) => Self::construct_azure(location),
            StorageLocation::Local(location) => Self::construct_local(location).await,
        }
    }

    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    /// URL of the location root, used in log lines and stage definitions.
    pub fn url(&self) -> &str {
        &self.canonical_url
    }

    /// Bucket or container name, `None` on the local filesystem.
    pub fn bucket(&self) -> Option<&str> {
        match &self.location {
            StorageLocation::S3(s3) => Some(&s3.bucket),
            StorageLocation::Gcs(gcs) => Some(&gcs.bucket),
            StorageLocation::Azure(azure) => Some(&azure.container),
            StorageLocation::Local(_) => None,
        }
    }

    /// Prefix `path` with the location key, if any.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.location.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = match self.object_store.get(&path).await {
            Ok(response) => response.bytes().await,
            Err(err) => Err(err),
        };
        record(StorageOperation::Get, &result, start);
        result.context(ObjectStoreSnafu)
    }

    pub async fn put_bytes(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        self.put_payload_with_opts(path, PutPayload::from(bytes), PutOptions::default())
            .await
    }

    /// Upload a local file, attaching `metadata` as user-defined object
    /// metadata. The local filesystem backend cannot store metadata, so it
    /// is dropped there.
    pub async fn put_file(
        &self,
        path: &Path,
        file: &std::path::Path,
        metadata: &[(String, String)],
    ) -> Result<(), StorageError> {
        let contents = tokio::fs::read(file).await.context(IoSnafu)?;
        let opts = self.put_options(metadata);
        self.put_payload_with_opts(path, PutPayload::from(contents), opts)
            .await
    }

    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.delete(&path).await;
        record(StorageOperation::Delete, &result, start);
        result.context(ObjectStoreSnafu)
    }

    /// Copy an object into `dest`, which may live in another bucket.
    ///
    /// Copies within one location stay server side. Otherwise the object is
    /// read and written again.
    pub async fn copy_to(
        &self,
        dest: &StorageProvider,
        from: &Path,
        to: &Path,
        metadata: &[(String, String)],
    ) -> Result<(), StorageError> {
        debug!(from = %from, to = %to, dest = %dest.canonical_url, "Copying object");

        if metadata.is_empty() && self.same_bucket(dest) {
            let source = self.qualify_path(from);
            let target = dest.qualify_path(to);
            let start = Instant::now();
            let result = self.object_store.copy(&source, &target).await;
            record(StorageOperation::Copy, &result, start);
            return result.context(ObjectStoreSnafu);
        }

        let bytes = self.get(from).await?;
        let opts = dest.put_options(metadata);
        dest.put_payload_with_opts(to, PutPayload::from(bytes), opts)
            .await
    }

    fn same_bucket(&self, other: &StorageProvider) -> bool {
        match (&self.location, &other.location) {
            (StorageLocation::Local(a), StorageLocation::Local(b)) => a.path == b.path,
            _ => self.bucket().is_some() && self.bucket() == other.bucket(),
        }
    }

    fn put_options(&self, metadata: &[(String, String)]) -> PutOptions {
        if metadata.is_empty() || matches!(self.location, StorageLocation::Local(_)) {
            return PutOptions::default();
        }
        let attributes: Attributes = metadata
            .iter()
            .map(|(key, value)| {
                (
                    Attribute::Metadata(key.clone().into()),
                    AttributeValue::from(value.clone()),
                )
            })
            .collect();
        PutOptions {
            attributes,
            ..Default::default()
        }
    }

    async fn put_payload_with_opts(
        &self,
        path: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put_opts(&path, payload, opts).await;
        record(StorageOperation::Put, &result, start);
        result.context(ObjectStoreSnafu)?;
        Ok(())
    }
}

fn record<T, E>(operation: StorageOperation, result: &Result<T, E>, start: Instant) {
    emit!(StorageRequest {
        operation,
        status: RequestStatus::of(result),
    });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}
