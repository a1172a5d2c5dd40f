//! Parsing of staging locations.
//!
//! A location is either a bare bucket name (S3, the loader's historic
//! default) or a URL naming the backend explicitly.

use std::sync::LazyLock;

use object_store::path::Path;
use regex::{Captures, Regex};

use crate::error::{InvalidUrlSnafu, StorageError};

use super::{AzureLocation, GcsLocation, LocalLocation, S3Location};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Azure,
    Local,
}

/// Patterns are tried in order; the first match wins.
static PATTERNS: LazyLock<Vec<(Backend, Regex)>> = LazyLock::new(|| {
    let pattern = |backend, re: &str| (backend, Regex::new(re).expect("location pattern is valid"));
    vec![
        pattern(
            Backend::S3,
            r"^[sS]3[aA]?::(?P<protocol>https?)://(?P<endpoint>[^:/]+):(?P<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$",
        ),
        pattern(
            Backend::S3,
            r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$",
        ),
        pattern(
            Backend::S3,
            r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$",
        ),
        pattern(
            Backend::Gcs,
            r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$",
        ),
        pattern(
            Backend::Azure,
            r"^abfss?://(?P<container>[a-z0-9\-]+)@(?P<account>[a-z0-9]+)\.dfs\.core\.windows\.net(/(?P<key>.+))?$",
        ),
        pattern(
            Backend::Azure,
            r"^az://(?P<account>[a-z0-9]+)/(?P<container>[a-z0-9\-]+)(/(?P<key>.+))?$",
        ),
        pattern(Backend::Local, r"^file://(?P<path>/.*)$"),
        pattern(Backend::Local, r"^(?P<path>/.*)$"),
        pattern(
            Backend::S3,
            r"^(?P<bucket>[a-z0-9][a-z0-9\-\.]*[a-z0-9])(/(?P<key>.+))?$",
        ),
    ]
});

/// Where staged files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    S3(S3Location),
    Gcs(GcsLocation),
    Azure(AzureLocation),
    Local(LocalLocation),
}

impl StorageLocation {
    pub fn parse(url: &str) -> Result<Self, StorageError> {
        let found = PATTERNS
            .iter()
            .find_map(|(backend, re)| re.captures(url).map(|caps| (*backend, caps)));

        let Some((backend, caps)) = found else {
            return InvalidUrlSnafu { url }.fail();
        };

        let key = caps
            .name("key")
            .map(|m| m.as_str().trim_end_matches('/'))
            .filter(|k| !k.is_empty())
            .map(Path::from);

        Ok(match backend {
            Backend::S3 => StorageLocation::S3(S3Location {
                bucket: group(&caps, "bucket"),
                region: caps.name("region").map(|m| m.as_str().to_string()),
                endpoint: endpoint(&caps),
                key,
            }),
            Backend::Gcs => StorageLocation::Gcs(GcsLocation {
                bucket: group(&caps, "bucket"),
                key,
            }),
            Backend::Azure => StorageLocation::Azure(AzureLocation {
                account: group(&caps, "account"),
                container: group(&caps, "container"),
                key,
            }),
            Backend::Local => StorageLocation::Local(LocalLocation {
                path: group(&caps, "path").trim_end_matches('/').to_string(),
            }),
        })
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            StorageLocation::S3(s3) => s3.key.as_ref(),
            StorageLocation::Gcs(gcs) => gcs.key.as_ref(),
            StorageLocation::Azure(azure) => azure.key.as_ref(),
            StorageLocation::Local(_) => None,
        }
    }
}

fn group(caps: &Captures, name: &str) -> String {
    caps.name(name)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

fn endpoint(caps: &Captures) -> Option<String> {
    let host = caps.name("endpoint")?.as_str();
    let protocol = caps.name("protocol").map_or("https", |m| m.as_str());
    let port = caps.name("port").map_or("443", |m| m.as_str());
    Some(format!("{protocol}://{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_bucket_name_is_s3() {
        let StorageLocation::S3(s3) = StorageLocation::parse("my-stage-bucket").unwrap() else {
            panic!("expected S3 location");
        };
        assert_eq!(s3.bucket, "my-stage-bucket");
        assert_eq!(s3.key, None);
        assert_eq!(s3.endpoint, None);
    }

    #[test]
    fn test_s3_url_with_prefix() {
        let StorageLocation::S3(s3) = StorageLocation::parse("s3://loads/snowflake/").unwrap()
        else {
            panic!("expected S3 location");
        };
        assert_eq!(s3.bucket, "loads");
        assert_eq!(s3.key, Some(Path::from("snowflake")));
    }

    #[test]
    fn test_s3_virtual_hosted_url() {
        let StorageLocation::S3(s3) =
            StorageLocation::parse("https://loads.s3.eu-west-1.amazonaws.com/stage").unwrap()
        else {
            panic!("expected S3 location");
        };
        assert_eq!(s3.bucket, "loads");
        assert_eq!(s3.region.as_deref(), Some("eu-west-1"));
        assert_eq!(s3.key, Some(Path::from("stage")));
    }

    #[test]
    fn test_s3_custom_endpoint() {
        let StorageLocation::S3(s3) =
            StorageLocation::parse("s3::http://localhost:9000/loads/tmp").unwrap()
        else {
            panic!("expected S3 location");
        };
        assert_eq!(s3.bucket, "loads");
        assert_eq!(s3.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(s3.key, Some(Path::from("tmp")));
    }

    #[test]
    fn test_gcs_url() {
        let StorageLocation::Gcs(gcs) = StorageLocation::parse("gs://warehouse_loads/x").unwrap()
        else {
            panic!("expected GCS location");
        };
        assert_eq!(gcs.bucket, "warehouse_loads");
        assert_eq!(gcs.key, Some(Path::from("x")));
    }

    #[test]
    fn test_azure_urls() {
        let StorageLocation::Azure(azure) =
            StorageLocation::parse("abfss://loads@acct.dfs.core.windows.net/stage").unwrap()
        else {
            panic!("expected Azure location");
        };
        assert_eq!(azure.account, "acct");
        assert_eq!(azure.container, "loads");

        let StorageLocation::Azure(azure) = StorageLocation::parse("az://acct/loads").unwrap()
        else {
            panic!("expected Azure location");
        };
        assert_eq!(azure.container, "loads");
        assert_eq!(azure.key, None);
    }

    #[test]
    fn test_local_paths() {
        for url in ["file:///tmp/stage", "/tmp/stage/"] {
            let StorageLocation::Local(local) = StorageLocation::parse(url).unwrap() else {
                panic!("expected local location for {url}");
            };
            assert_eq!(local.path, "/tmp/stage");
        }
    }

    #[test]
    fn test_invalid_location() {
        assert!(StorageLocation::parse("ftp://somewhere").is_err());
        assert!(StorageLocation::parse("").is_err());
    }
}
