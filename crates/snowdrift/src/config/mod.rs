//! Loader configuration.
//!
//! The configuration file is JSON or YAML (JSON is read by the YAML parser).
//! Environment variables are expanded before parsing. Unknown keys are
//! ignored so tap-agnostic settings can share one file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use snowdrift_core::config::{interpolate_text, read_interpolated};
use snowdrift_core::error::{ConfigError, InvalidSnafu, MissingKeySnafu, YamlParseSnafu};

use crate::naming::split_qualified_name;

/// File format used for staged load files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormatType {
    Csv,
    Parquet,
}

impl FileFormatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormatType::Csv => "csv",
            FileFormatType::Parquet => "parquet",
        }
    }
}

/// One role or a list of roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Grantees {
    One(String),
    Many(Vec<String>),
}

impl Grantees {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Grantees::One(role) => vec![role.clone()],
            Grantees::Many(roles) => roles.clone(),
        }
    }
}

/// Destination overrides for one source schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMappingEntry {
    pub target_schema: Option<String>,
    pub target_schema_select_permissions: Option<Grantees>,
}

fn default_sql_api_token_type() -> String {
    "OAUTH".to_string()
}

fn default_sql_api_timeout_secs() -> u64 {
    3600
}

fn default_batch_size_rows() -> usize {
    100_000
}

fn default_max_parallelism() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_archive_prefix() -> String {
    "archive".to_string()
}

/// Main configuration.
///
/// # Example
///
/// ```json
/// {
///   "account": "xy12345.eu-west-1",
///   "dbname": "ANALYTICS",
///   "warehouse": "LOADING",
///   "sql_api_token": "${SNOWFLAKE_TOKEN}",
///   "file_format": "raw.csv_format",
///   "s3_bucket": "my-stage-bucket",
///   "stage": "raw.s3_stage",
///   "default_target_schema": "raw",
///   "batch_size_rows": 50000
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub account: Option<String>,
    pub dbname: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub warehouse: Option<String>,
    pub role: Option<String>,
    pub sql_api_token: Option<String>,
    #[serde(default = "default_sql_api_token_type")]
    pub sql_api_token_type: String,
    /// Defaults to `https://{account}.snowflakecomputing.com`.
    pub sql_api_url: Option<String>,
    #[serde(default = "default_sql_api_timeout_secs")]
    pub sql_api_timeout_secs: u64,
    pub query_tag: Option<String>,

    /// Bucket name or storage URL of the external stage.
    pub s3_bucket: Option<String>,
    #[serde(default)]
    pub s3_key_prefix: String,
    pub s3_region_name: Option<String>,
    pub s3_endpoint_url: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_session_token: Option<String>,
    /// Named external stage as `<schema>.<stage_name>`.
    pub stage: Option<String>,
    pub file_format: Option<String>,
    /// Detected with `SHOW FILE FORMATS` when absent.
    pub file_format_type: Option<FileFormatType>,

    #[serde(default = "default_batch_size_rows")]
    pub batch_size_rows: usize,
    /// Zero picks the worker count per flush round.
    #[serde(default)]
    pub parallelism: usize,
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    #[serde(default)]
    pub flush_all_streams: bool,
    #[serde(default)]
    pub hard_delete: bool,
    #[serde(default)]
    pub add_metadata_columns: bool,
    #[serde(default)]
    pub validate_records: bool,
    #[serde(default = "default_true")]
    pub primary_key_required: bool,
    #[serde(default)]
    pub data_flattening_max_level: usize,
    #[serde(default)]
    pub disable_table_cache: bool,
    pub default_target_schema: Option<String>,
    pub default_target_schema_select_permissions: Option<Grantees>,
    #[serde(default)]
    pub schema_mapping: IndexMap<String, SchemaMappingEntry>,
    pub temp_dir: Option<PathBuf>,
    #[serde(default)]
    pub no_compression: bool,
    #[serde(default)]
    pub archive_load_files: bool,
    pub archive_load_files_s3_bucket: Option<String>,
    #[serde(default = "default_archive_prefix")]
    pub archive_load_files_s3_prefix: String,
    pub tap_id: Option<String>,
    #[serde(default)]
    pub precision_errors_as_warnings: bool,
    /// Address of the Prometheus endpoint, disabled when absent.
    pub metrics_address: Option<String>,
}

impl Config {
    /// Load and validate a configuration file, or an empty configuration
    /// when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let contents = match path {
            Some(path) => read_interpolated(path)?,
            None => "{}".to_string(),
        };
        Self::from_document(&contents)
    }

    /// Parse configuration text, expanding environment variables first.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let contents = interpolate_text(contents)?;
        Self::from_document(&contents)
    }

    fn from_document(contents: &str) -> Result<Self, ConfigError> {
        let contents = if contents.trim().is_empty() {
            "{}"
        } else {
            contents
        };
        let config: Config = serde_yaml::from_str(contents).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field rules, reporting every violation at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.s3_bucket.is_some() != self.stage.is_some() {
            errors.push(
                "Only one of 's3_bucket' or 'stage' keys defined in config. Use both of them for \
                 an external stage or neither of them for table stages."
                    .to_string(),
            );
        }

        let stage_without_schema = self
            .stage
            .as_deref()
            .is_some_and(|stage| split_qualified_name(stage, '.').schema.is_none());
        if stage_without_schema {
            errors.push(
                "The named external stage object in config has to use the <schema>.<stage_name> format."
                    .to_string(),
            );
        }

        let has_default = self
            .default_target_schema
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
        if !has_default && self.schema_mapping.is_empty() {
            errors.push(
                "Neither 'default_target_schema' (string) nor 'schema_mapping' (object) keys set in config."
                    .to_string(),
            );
        }

        if self.archive_load_files && self.s3_bucket.is_none() {
            errors.push(
                "Archive load files option can be used only with external stages. Please define s3_bucket."
                    .to_string(),
            );
        }

        if self.uses_table_stage() && self.file_format_type == Some(FileFormatType::Parquet) {
            errors.push(
                "Table stages with Parquet file format is not supported. Use named stages with \
                 Parquet file format or table stages with CSV file format."
                    .to_string(),
            );
        }

        if self.batch_size_rows == 0 {
            errors.push("'batch_size_rows' must be greater than zero.".to_string());
        }
        if self.max_parallelism == 0 {
            errors.push("'max_parallelism' must be greater than zero.".to_string());
        }

        ensure!(errors.is_empty(), InvalidSnafu { errors });
        Ok(())
    }

    /// Files are staged through the warehouse-managed table stage.
    pub fn uses_table_stage(&self) -> bool {
        self.s3_bucket.is_none()
    }

    /// Every destination schema named in the configuration, de-duplicated.
    pub fn schema_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let candidates = self
            .default_target_schema
            .iter()
            .chain(self.schema_mapping.values().filter_map(|m| m.target_schema.as_ref()));
        for name in candidates {
            let name = name.trim();
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    /// Object store options for the external stage bucket.
    pub fn storage_options(&self) -> HashMap<String, String> {
        [
            ("aws_region", &self.s3_region_name),
            ("aws_endpoint", &self.s3_endpoint_url),
            ("aws_access_key_id", &self.aws_access_key_id),
            ("aws_secret_access_key", &self.aws_secret_access_key),
            ("aws_session_token", &self.aws_session_token),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
        .collect()
    }

    /// Value of a key that a component cannot work without.
    pub fn required<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str, ConfigError> {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .context(MissingKeySnafu { key })
    }
}
