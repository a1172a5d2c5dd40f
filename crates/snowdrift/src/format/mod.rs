//! Load file encoders.
//!
//! Bucket rows are written to a local temporary file in the stage file
//! format. Columns are written in flattened schema order, which is also the
//! order of the load statement's select list.

mod csv;
mod parquet;

use std::path::{Path, PathBuf};

use snafu::prelude::*;
use tempfile::NamedTempFile;

use crate::config::{Config, FileFormatType};
use crate::error::{EncodeError, TempFileSnafu};
use crate::flatten::{FlatRecord, FlatSchema};

/// Settings shared by every encoder.
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub format: FileFormatType,
    /// Gzip CSV output, gzip codec for Parquet.
    pub compress: bool,
    /// Directory for temporary files; the system default when unset.
    pub temp_dir: Option<PathBuf>,
}

impl EncodeOptions {
    pub fn from_config(config: &Config, format: FileFormatType) -> Self {
        Self {
            format,
            compress: !config.no_compression,
            temp_dir: config.temp_dir.clone(),
        }
    }

    /// File name suffix, without a leading dot.
    pub fn extension(&self) -> &'static str {
        match (self.format, self.compress) {
            (FileFormatType::Csv, true) => "csv.gz",
            (FileFormatType::Csv, false) => "csv",
            (FileFormatType::Parquet, _) => "parquet",
        }
    }

    fn temp_file(&self) -> Result<NamedTempFile, EncodeError> {
        let suffix = format!(".{}", self.extension());
        let mut builder = tempfile::Builder::new();
        builder.prefix("snowdrift_").suffix(&suffix);
        match &self.temp_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).context(TempFileSnafu)?;
                builder.tempfile_in(dir)
            }
            None => builder.tempfile(),
        }
        .context(TempFileSnafu)
    }
}

/// A load file on local disk. The file is deleted when this is dropped.
#[derive(Debug)]
pub struct EncodedFile {
    file: NamedTempFile,
    pub extension: &'static str,
    pub rows: usize,
    pub size_bytes: u64,
}

impl EncodedFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Write `rows` into a new temporary load file.
///
/// Blocking; run it on a blocking thread from async code.
pub fn encode(rows: &[FlatRecord], schema: &FlatSchema, options: &EncodeOptions) -> Result<EncodedFile, EncodeError> {
    let file = options.temp_file()?;
    let handle = file.reopen().context(TempFileSnafu)?;

    match options.format {
        FileFormatType::Csv => csv::write(handle, rows, schema, options.compress)?,
        FileFormatType::Parquet => parquet::write(handle, rows, schema, options.compress)?,
    }

    let size_bytes = std::fs::metadata(file.path()).context(TempFileSnafu)?.len();
    Ok(EncodedFile {
        file,
        extension: options.extension(),
        rows: rows.len(),
        size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::FlatValue;
    use serde_json::json;

    #[test]
    fn test_extension() {
        let mut options = EncodeOptions {
            format: FileFormatType::Csv,
            compress: true,
            temp_dir: None,
        };
        assert_eq!(options.extension(), "csv.gz");
        options.compress = false;
        assert_eq!(options.extension(), "csv");
        options.format = FileFormatType::Parquet;
        assert_eq!(options.extension(), "parquet");
    }

    #[test]
    fn test_encode_into_temp_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let options = EncodeOptions {
            format: FileFormatType::Csv,
            compress: false,
            temp_dir: Some(dir.path().join("nested")),
        };
        let mut schema = FlatSchema::new();
        schema.insert("id".to_string(), json!({"type": "integer"}));
        let rows = vec![FlatRecord::from([("id".to_string(), FlatValue::Int(1))])];

        let encoded = encode(&rows, &schema, &options).unwrap();
        assert!(encoded.path().starts_with(dir.path()));
        assert_eq!(encoded.rows, 1);
        assert_eq!(encoded.size_bytes, 2);

        let path = encoded.path().to_path_buf();
        drop(encoded);
        assert!(!path.exists());
    }
}
